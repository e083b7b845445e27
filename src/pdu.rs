//! Modbus PDU buffers
//!
//! Requests are built into a fixed-size stack array so encoding never touches
//! the heap. Replies are read back through [`PduCursor`], a bounds-checked
//! big-endian reader over a borrowed payload.

use tracing::trace;

use crate::constants::{COIL_OFF, COIL_ON, EXCEPTION_FLAG, MAX_PDU_SIZE};
use crate::error::{FrameError, ModbusError, ModbusResult};
use crate::protocol::{AddressRange, ModbusFunction, WriteMultiple};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::internal("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.extend(&value.to_be_bytes())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::internal(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function(mut self, function: ModbusFunction) -> ModbusResult<Self> {
        self.pdu.push(function.to_u8())?;
        Ok(self)
    }

    /// Add a big-endian u16 (address, quantity or value)
    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        trace!(
            "PDU built: FC={:02X?}, total_len={}",
            self.pdu.function_code(),
            self.pdu.len()
        );
        self.pdu
    }

    /// Build a read request PDU for FC01-04
    pub fn build_read_request(
        function: ModbusFunction,
        range: AddressRange,
    ) -> ModbusResult<ModbusPdu> {
        if !function.is_read_function() {
            return Err(ModbusError::internal(format!(
                "{} is not a read function",
                function
            )));
        }
        Ok(PduBuilder::new()
            .function(function)?
            .word(range.start)?
            .word(range.count)?
            .build())
    }

    /// Build a write single coil PDU (FC05)
    pub fn build_write_single_coil(address: u16, value: bool) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function(ModbusFunction::WriteSingleCoil)?
            .word(address)?
            .word(coil_to_u16(value))?
            .build())
    }

    /// Build a write single register PDU (FC06)
    pub fn build_write_single_register(address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function(ModbusFunction::WriteSingleRegister)?
            .word(address)?
            .word(value)?
            .build())
    }

    /// Build a write multiple coils PDU (FC15)
    pub fn build_write_multiple_coils(write: &WriteMultiple<bool>) -> ModbusResult<ModbusPdu> {
        let range = write.range();
        let coil_bytes = pack_bits(write.values());

        Ok(PduBuilder::new()
            .function(ModbusFunction::WriteMultipleCoils)?
            .word(range.start)?
            .word(range.count)?
            .byte(coil_bytes.len() as u8)?
            .data(&coil_bytes)?
            .build())
    }

    /// Build a write multiple registers PDU (FC16)
    pub fn build_write_multiple_registers(write: &WriteMultiple<u16>) -> ModbusResult<ModbusPdu> {
        let range = write.range();

        let mut builder = PduBuilder::new()
            .function(ModbusFunction::WriteMultipleRegisters)?
            .word(range.start)?
            .word(range.count)?
            .byte((write.values().len() * 2) as u8)?;

        for &value in write.values() {
            builder = builder.word(value)?;
        }

        Ok(builder.build())
    }
}

/// Pack coils into bytes, first coil in the least significant bit
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Number of bytes needed to carry `count` packed bits
#[inline]
pub fn packed_len(count: u16) -> usize {
    usize::from(count).div_ceil(8)
}

/// FC05 wire value of a coil
#[inline]
pub fn coil_to_u16(value: bool) -> u16 {
    if value {
        COIL_ON
    } else {
        COIL_OFF
    }
}

/// Coil state from an FC05 wire value
#[inline]
pub fn coil_from_u16(value: u16) -> Result<bool, FrameError> {
    match value {
        COIL_ON => Ok(true),
        COIL_OFF => Ok(false),
        other => Err(FrameError::UnknownCoilState(other)),
    }
}

/// Bounds-checked big-endian reader over a reply PDU
#[derive(Debug)]
pub struct PduCursor<'a> {
    data: &'a [u8],
}

impl<'a> PduCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        let (&first, rest) = self
            .data
            .split_first()
            .ok_or(FrameError::InsufficientBytes)?;
        self.data = rest;
        Ok(first)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, FrameError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], FrameError> {
        if self.data.len() < count {
            return Err(FrameError::InsufficientBytes);
        }
        let (head, rest) = self.data.split_at(count);
        self.data = rest;
        Ok(head)
    }

    /// Read a byte-count prefixed block
    pub fn read_counted(&mut self) -> Result<&'a [u8], FrameError> {
        let count = usize::from(self.read_u8()?);
        if self.data.len() < count {
            return Err(FrameError::InsufficientBytesForByteCount {
                count,
                remaining: self.data.len(),
            });
        }
        self.read_bytes(count)
    }

    /// Fail if any bytes are left over
    pub fn expect_empty(&self) -> Result<(), FrameError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(FrameError::TrailingBytes(self.data.len()))
        }
    }
}
