//! Modbus protocol definitions and request value types
//!
//! This module contains the core Modbus protocol definitions: function codes,
//! exception codes, unit ids, address ranges, indexed values and the write
//! payloads that travel through a channel.

use std::fmt;
use std::time::Duration;

use crate::constants::*;
use crate::error::InvalidRequest;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier (0-255), the sub-device multiplexed over one TCP connection
pub type UnitId = u8;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = FC_READ_COILS,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = FC_READ_DISCRETE_INPUTS,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = FC_READ_HOLDING_REGISTERS,
    /// Read Input Registers (0x04)
    ReadInputRegisters = FC_READ_INPUT_REGISTERS,
    /// Write Single Coil (0x05)
    WriteSingleCoil = FC_WRITE_SINGLE_COIL,
    /// Write Single Register (0x06)
    WriteSingleRegister = FC_WRITE_SINGLE_REGISTER,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = FC_WRITE_MULTIPLE_COILS,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = FC_WRITE_MULTIPLE_REGISTERS,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            FC_READ_COILS => Some(ModbusFunction::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Some(ModbusFunction::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Some(ModbusFunction::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Some(ModbusFunction::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Some(ModbusFunction::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Some(ModbusFunction::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Some(ModbusFunction::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Some(ModbusFunction::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Function code of the matching exception reply (code | 0x80)
    pub fn exception_code(self) -> u8 {
        self.to_u8() | EXCEPTION_FLAG
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes returned by a server
///
/// Codes outside the standard table (vendor extensions) are preserved
/// verbatim in [`ExceptionCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// 0x01
    IllegalFunction,
    /// 0x02
    IllegalDataAddress,
    /// 0x03
    IllegalDataValue,
    /// 0x04
    ServerDeviceFailure,
    /// 0x05
    Acknowledge,
    /// 0x06
    ServerDeviceBusy,
    /// 0x08
    MemoryParityError,
    /// 0x0A
    GatewayPathUnavailable,
    /// 0x0B
    GatewayTargetDeviceFailedToRespond,
    /// Any other value
    Unknown(u8),
}

impl From<u8> for ExceptionCode {
    fn from(value: u8) -> Self {
        match value {
            EXCEPTION_ILLEGAL_FUNCTION => ExceptionCode::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => ExceptionCode::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => ExceptionCode::IllegalDataValue,
            EXCEPTION_SERVER_DEVICE_FAILURE => ExceptionCode::ServerDeviceFailure,
            EXCEPTION_ACKNOWLEDGE => ExceptionCode::Acknowledge,
            EXCEPTION_SERVER_DEVICE_BUSY => ExceptionCode::ServerDeviceBusy,
            EXCEPTION_MEMORY_PARITY_ERROR => ExceptionCode::MemoryParityError,
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => ExceptionCode::GatewayPathUnavailable,
            EXCEPTION_GATEWAY_TARGET_FAILED => ExceptionCode::GatewayTargetDeviceFailedToRespond,
            other => ExceptionCode::Unknown(other),
        }
    }
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> Self {
        code.to_u8()
    }
}

impl ExceptionCode {
    /// Raw wire value
    pub fn to_u8(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => EXCEPTION_ILLEGAL_FUNCTION,
            ExceptionCode::IllegalDataAddress => EXCEPTION_ILLEGAL_DATA_ADDRESS,
            ExceptionCode::IllegalDataValue => EXCEPTION_ILLEGAL_DATA_VALUE,
            ExceptionCode::ServerDeviceFailure => EXCEPTION_SERVER_DEVICE_FAILURE,
            ExceptionCode::Acknowledge => EXCEPTION_ACKNOWLEDGE,
            ExceptionCode::ServerDeviceBusy => EXCEPTION_SERVER_DEVICE_BUSY,
            ExceptionCode::MemoryParityError => EXCEPTION_MEMORY_PARITY_ERROR,
            ExceptionCode::GatewayPathUnavailable => EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
            ExceptionCode::GatewayTargetDeviceFailedToRespond => EXCEPTION_GATEWAY_TARGET_FAILED,
            ExceptionCode::Unknown(value) => value,
        }
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::ServerDeviceFailure => "Server Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::ServerDeviceBusy => "Server Device Busy",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetDeviceFailedToRespond => {
                "Gateway Target Device Failed to Respond"
            }
            ExceptionCode::Unknown(_) => "Unknown Exception",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.to_u8())
    }
}

/// A value paired with its Modbus address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indexed<T> {
    /// Address of the point
    pub index: u16,
    /// Value of the point
    pub value: T,
}

impl<T> Indexed<T> {
    /// Create a new indexed value
    pub fn new(index: u16, value: T) -> Self {
        Self { index, value }
    }
}

impl<T> From<(u16, T)> for Indexed<T> {
    fn from((index, value): (u16, T)) -> Self {
        Self::new(index, value)
    }
}

/// Contiguous range of Modbus addresses
///
/// A valid range has `count > 0` and `start + count <= 65536`. The check is
/// done in 32-bit arithmetic so an oversized range is rejected instead of
/// wrapping around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    /// Starting address
    pub start: u16,
    /// Number of consecutive points
    pub count: u16,
}

impl AddressRange {
    /// Create a range without validating it
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Create a validated range
    pub fn try_from(start: u16, count: u16) -> Result<Self, InvalidRequest> {
        let range = Self::new(start, count);
        range.validate()?;
        Ok(range)
    }

    /// Check `count > 0` and `start + count <= 65536`
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        if self.count == 0 {
            return Err(InvalidRequest::CountOfZero);
        }

        let end = u32::from(self.start) + u32::from(self.count);
        if end > u32::from(u16::MAX) + 1 {
            return Err(InvalidRequest::AddressOverflow {
                start: self.start,
                count: self.count,
            });
        }

        Ok(())
    }

    /// Validate for FC01/FC02 (at most 2000 bits)
    pub fn of_read_bits(self) -> Result<Self, InvalidRequest> {
        self.limited_to(MAX_READ_COILS)
    }

    /// Validate for FC03/FC04 (at most 125 registers)
    pub fn of_read_registers(self) -> Result<Self, InvalidRequest> {
        self.limited_to(MAX_READ_REGISTERS)
    }

    fn limited_to(self, max: u16) -> Result<Self, InvalidRequest> {
        self.validate()?;
        if self.count > max {
            return Err(InvalidRequest::CountTooLargeForType {
                count: self.count,
                max,
            });
        }
        Ok(self)
    }

    /// Address of the `offset`-th point; callers keep `offset < count`
    pub(crate) fn address_at(&self, offset: u16) -> u16 {
        self.start.wrapping_add(offset)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "start: {} count: {}", self.start, self.count)
    }
}

/// Types that can be written with a multi-write function
pub trait WriteValue: Copy + Send + 'static {
    /// Largest number of values one request may carry
    const MAX_COUNT: u16;
}

impl WriteValue for bool {
    const MAX_COUNT: u16 = MAX_WRITE_COILS;
}

impl WriteValue for u16 {
    const MAX_COUNT: u16 = MAX_WRITE_REGISTERS;
}

/// Owned payload of a multi-write (FC0F / FC10)
///
/// The channel takes ownership of the values when the request is issued, so
/// the caller's list only has to live until the call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteMultiple<T> {
    range: AddressRange,
    values: Vec<T>,
}

impl<T: WriteValue> WriteMultiple<T> {
    /// Build a validated multi-write starting at `start`
    pub fn from(start: u16, values: Vec<T>) -> Result<Self, InvalidRequest> {
        let count = u16::try_from(values.len())
            .map_err(|_| InvalidRequest::CountTooBigForU16(values.len()))?;
        let range = AddressRange::try_from(start, count)?;

        if count > T::MAX_COUNT {
            return Err(InvalidRequest::CountTooLargeForType {
                count,
                max: T::MAX_COUNT,
            });
        }

        Ok(Self { range, values })
    }

    /// Address range covered by the values
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Values in address order
    pub fn values(&self) -> &[T] {
        &self.values
    }
}

/// Parameters that route a request to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestParam {
    /// Unit ID of the target device
    pub unit_id: UnitId,
    /// Response timeout
    pub timeout: Duration,
}

impl RequestParam {
    /// Create request parameters
    pub fn new(unit_id: UnitId, timeout: Duration) -> Self {
        Self { unit_id, timeout }
    }

    /// Create request parameters from a millisecond timeout
    pub fn from_millis(unit_id: UnitId, timeout_ms: u64) -> Self {
        Self::new(unit_id, Duration::from_millis(timeout_ms))
    }
}

impl Default for RequestParam {
    fn default() -> Self {
        Self::from_millis(1, DEFAULT_TIMEOUT_MS)
    }
}
