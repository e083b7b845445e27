//! Pending requests and their completion slots
//!
//! A [`Request`] owns the caller's callback until it is resolved. Resolution
//! consumes the request, so a callback runs at most once; a request dropped
//! while still pending (queue torn down, runtime destroyed) resolves itself
//! with [`ModbusError::Shutdown`], so it also runs at least once.

use std::fmt;
use std::time::Duration;

use crate::codec;
use crate::error::{ModbusError, ModbusResult};
use crate::iter::{BitIterator, RegisterIterator};
use crate::pdu::ModbusPdu;
use crate::protocol::{AddressRange, Indexed, ModbusFunction, RequestParam, UnitId, WriteMultiple};

/// Completion for FC01/FC02
pub type BitCallback = Box<dyn for<'a> FnOnce(ModbusResult<BitIterator<'a>>) + Send>;

/// Completion for FC03/FC04
pub type RegisterCallback = Box<dyn for<'a> FnOnce(ModbusResult<RegisterIterator<'a>>) + Send>;

/// Completion for the write functions
pub type WriteCallback = Box<dyn FnOnce(ModbusResult<()>) + Send>;

/// Function-specific payload and completion slot
pub(crate) enum RequestDetails {
    ReadBits {
        function: ModbusFunction,
        range: AddressRange,
        callback: BitCallback,
    },
    ReadRegisters {
        function: ModbusFunction,
        range: AddressRange,
        callback: RegisterCallback,
    },
    WriteSingleCoil {
        value: Indexed<bool>,
        callback: WriteCallback,
    },
    WriteSingleRegister {
        value: Indexed<u16>,
        callback: WriteCallback,
    },
    WriteMultipleCoils {
        write: WriteMultiple<bool>,
        callback: WriteCallback,
    },
    WriteMultipleRegisters {
        write: WriteMultiple<u16>,
        callback: WriteCallback,
    },
}

impl RequestDetails {
    pub(crate) fn function(&self) -> ModbusFunction {
        match self {
            RequestDetails::ReadBits { function, .. } => *function,
            RequestDetails::ReadRegisters { function, .. } => *function,
            RequestDetails::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            RequestDetails::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            RequestDetails::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            RequestDetails::WriteMultipleRegisters { .. } => {
                ModbusFunction::WriteMultipleRegisters
            }
        }
    }

    /// Invoke the callback with the reply parsed from `pdu`
    fn complete(self, pdu: &[u8]) -> ModbusResult<()> {
        match self {
            RequestDetails::ReadBits {
                function,
                range,
                callback,
            } => match codec::parse_read_bits(function, range, pdu) {
                Ok(iter) => {
                    callback(Ok(iter));
                    Ok(())
                }
                Err(err) => {
                    callback(Err(err.clone()));
                    Err(err)
                }
            },
            RequestDetails::ReadRegisters {
                function,
                range,
                callback,
            } => match codec::parse_read_registers(function, range, pdu) {
                Ok(iter) => {
                    callback(Ok(iter));
                    Ok(())
                }
                Err(err) => {
                    callback(Err(err.clone()));
                    Err(err)
                }
            },
            RequestDetails::WriteSingleCoil { value, callback } => {
                let result = codec::parse_write_single_coil(value, pdu);
                callback(result.clone());
                result
            }
            RequestDetails::WriteSingleRegister { value, callback } => {
                let result = codec::parse_write_single_register(value, pdu);
                callback(result.clone());
                result
            }
            RequestDetails::WriteMultipleCoils { write, callback } => {
                let result = codec::parse_write_multiple(
                    ModbusFunction::WriteMultipleCoils,
                    write.range(),
                    pdu,
                );
                callback(result.clone());
                result
            }
            RequestDetails::WriteMultipleRegisters { write, callback } => {
                let result = codec::parse_write_multiple(
                    ModbusFunction::WriteMultipleRegisters,
                    write.range(),
                    pdu,
                );
                callback(result.clone());
                result
            }
        }
    }

    fn fail(self, err: ModbusError) {
        match self {
            RequestDetails::ReadBits { callback, .. } => callback(Err(err)),
            RequestDetails::ReadRegisters { callback, .. } => callback(Err(err)),
            RequestDetails::WriteSingleCoil { callback, .. }
            | RequestDetails::WriteSingleRegister { callback, .. }
            | RequestDetails::WriteMultipleCoils { callback, .. }
            | RequestDetails::WriteMultipleRegisters { callback, .. } => callback(Err(err)),
        }
    }
}

/// One queued Modbus operation
pub struct Request {
    unit_id: UnitId,
    timeout: Duration,
    details: Option<RequestDetails>,
}

impl Request {
    pub(crate) fn new(param: RequestParam, details: RequestDetails) -> Self {
        Self {
            unit_id: param.unit_id,
            timeout: param.timeout,
            details: Some(details),
        }
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Function code, `None` once the request has been resolved
    pub fn function(&self) -> Option<ModbusFunction> {
        self.details.as_ref().map(RequestDetails::function)
    }

    /// Encode the request PDU
    pub(crate) fn encode(&self) -> ModbusResult<ModbusPdu> {
        match &self.details {
            Some(details) => codec::encode_request(details),
            None => Err(ModbusError::internal("request already resolved")),
        }
    }

    /// Resolve with the reply PDU; returns the outcome handed to the callback
    pub(crate) fn complete(mut self, pdu: &[u8]) -> ModbusResult<()> {
        match self.details.take() {
            Some(details) => details.complete(pdu),
            None => Err(ModbusError::internal("request already resolved")),
        }
    }

    /// Resolve with an error
    pub(crate) fn fail(mut self, err: ModbusError) {
        if let Some(details) = self.details.take() {
            details.fail(err);
        }
    }

    /// Drop the callback without invoking it
    ///
    /// Used when the enqueue call itself reports the failure.
    pub(crate) fn disarm(mut self) {
        self.details = None;
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(details) = self.details.take() {
            details.fail(ModbusError::Shutdown);
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("unit_id", &self.unit_id)
            .field("function", &self.function())
            .field("timeout", &self.timeout)
            .finish()
    }
}
