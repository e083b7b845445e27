//! Result cursors handed to read callbacks
//!
//! Both iterators borrow the reply buffer, so they cannot outlive the
//! callback invocation that receives them. They are single-pass and not
//! `Clone`; collect them if the values are needed later.

use std::iter::FusedIterator;

use crate::protocol::{AddressRange, Indexed};

/// Lazy sequence of `(address, bit)` pairs from an FC01/FC02 reply
#[derive(Debug)]
pub struct BitIterator<'a> {
    bytes: &'a [u8],
    range: AddressRange,
    pos: u16,
}

impl<'a> BitIterator<'a> {
    /// `bytes` must hold at least `ceil(range.count / 8)` bytes
    pub(crate) fn new(range: AddressRange, bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            range,
            pos: 0,
        }
    }

    /// Address range this cursor covers
    pub fn range(&self) -> AddressRange {
        self.range
    }
}

impl Iterator for BitIterator<'_> {
    type Item = Indexed<bool>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.range.count {
            return None;
        }

        let byte = self.bytes.get(usize::from(self.pos / 8))?;
        let value = (byte >> (self.pos % 8)) & 0x01 != 0;
        let index = self.range.address_at(self.pos);
        self.pos += 1;

        Some(Indexed::new(index, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::from(self.range.count - self.pos);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BitIterator<'_> {}

impl FusedIterator for BitIterator<'_> {}

/// Lazy sequence of `(address, register)` pairs from an FC03/FC04 reply
#[derive(Debug)]
pub struct RegisterIterator<'a> {
    bytes: &'a [u8],
    range: AddressRange,
    pos: u16,
}

impl<'a> RegisterIterator<'a> {
    /// `bytes` must hold at least `2 * range.count` bytes
    pub(crate) fn new(range: AddressRange, bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            range,
            pos: 0,
        }
    }

    /// Address range this cursor covers
    pub fn range(&self) -> AddressRange {
        self.range
    }
}

impl Iterator for RegisterIterator<'_> {
    type Item = Indexed<u16>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.range.count {
            return None;
        }

        let offset = usize::from(self.pos) * 2;
        let pair = self.bytes.get(offset..offset + 2)?;
        let value = u16::from_be_bytes([pair[0], pair[1]]);
        let index = self.range.address_at(self.pos);
        self.pos += 1;

        Some(Indexed::new(index, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::from(self.range.count - self.pos);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RegisterIterator<'_> {}

impl FusedIterator for RegisterIterator<'_> {}
