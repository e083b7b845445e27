//! MBAP framing for Modbus TCP
//!
//! ```text
//! +----------------+-------------+--------+---------+------------------+
//! | Transaction ID | Protocol ID | Length | Unit ID | PDU (FC + data)  |
//! |    2 bytes     |  2 (0x0000) |   2    |    1    |  1..=253 bytes   |
//! +----------------+-------------+--------+---------+------------------+
//! ```
//!
//! The length field counts the unit id plus the PDU. [`FrameReader`] keeps
//! partially received data in its own buffer, so [`FrameReader::next_frame`]
//! can be cancelled in a `select!` without losing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_RESPONSE_BUFFER_SIZE};
use crate::error::{FrameError, ModbusError, ModbusResult};
use crate::protocol::UnitId;

/// Bytes before the length-counted part of the header
const MBAP_FIXED_LEN: usize = 6;

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub tx_id: u16,
    /// Length field: unit id + PDU
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Parse and validate the first 7 bytes of an ADU
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(FrameError::InsufficientBytes);
        }

        let mut cursor = &data[..MBAP_HEADER_LEN];
        let tx_id = cursor.get_u16();
        let protocol_id = cursor.get_u16();
        let length = cursor.get_u16();
        let unit_id = cursor.get_u8();

        if protocol_id != 0 {
            return Err(FrameError::UnknownProtocolId(protocol_id));
        }
        if length == 0 {
            return Err(FrameError::LengthZero);
        }
        if usize::from(length) > MAX_MBAP_LENGTH {
            return Err(FrameError::LengthTooBig(usize::from(length)));
        }

        Ok(Self {
            tx_id,
            length,
            unit_id,
        })
    }

    /// Total ADU size announced by this header
    pub fn frame_len(&self) -> usize {
        MBAP_FIXED_LEN + usize::from(self.length)
    }
}

/// One complete reply: header plus PDU (function code onward)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

/// Wrap a PDU in an MBAP header
pub fn encode_frame(tx_id: u16, unit_id: UnitId, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    buf.put_u16(tx_id);
    buf.put_u16(0);
    buf.put_u16((pdu.len() + 1) as u16);
    buf.put_u8(unit_id);
    buf.put_slice(pdu);
    buf.freeze()
}

/// Decode a buffer holding exactly one ADU
pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    let header = MbapHeader::parse(data)?;
    if header.frame_len() != data.len() {
        return Err(FrameError::LengthMismatch {
            declared: usize::from(header.length),
            actual: data.len() - MBAP_FIXED_LEN,
        });
    }

    Ok(Frame {
        header,
        pdu: Bytes::copy_from_slice(&data[MBAP_HEADER_LEN..]),
    })
}

/// Incremental MBAP frame reader over a byte stream
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MODBUS_RESPONSE_BUFFER_SIZE),
        }
    }

    /// Try to split one complete frame off the buffered data
    pub fn parse(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buffer.len() < MBAP_HEADER_LEN {
            return Ok(None);
        }

        let header = MbapHeader::parse(&self.buffer)?;
        if self.buffer.len() < header.frame_len() {
            return Ok(None);
        }

        let mut adu = self.buffer.split_to(header.frame_len());
        adu.advance(MBAP_HEADER_LEN);
        trace!(
            "frame parsed: tx_id={} unit={} pdu_len={}",
            header.tx_id,
            header.unit_id,
            adu.len()
        );

        Ok(Some(Frame {
            header,
            pdu: adu.freeze(),
        }))
    }

    /// Read until one complete frame is available
    ///
    /// End of stream is reported as `ConnectionFailed`.
    pub async fn next_frame<R>(&mut self, io: &mut R) -> ModbusResult<Frame>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.parse()? {
                return Ok(frame);
            }

            let read = io.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(ModbusError::connection("connection closed by remote"));
            }
        }
    }

    /// Drop buffered bytes, used when the connection is replaced
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of buffered bytes not yet framed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
