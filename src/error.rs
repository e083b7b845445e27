//! # Modbus Channel Error Handling
//!
//! Every outcome a channel can report travels through [`ModbusError`]:
//!
//! - **InvalidRequest**: rejected synchronously at enqueue time, before any I/O
//! - **Exception**: the server answered with a Modbus exception code
//! - **Communication errors**: `Timeout`, `ConnectionFailed`, `BadFrame`, `Shutdown`
//! - **QueueFull**: the channel queue is at capacity; the caller must back off
//!
//! Protocol and communication failures are delivered to the request callback,
//! the same way a successful result is. Only `InvalidRequest`, `QueueFull` and
//! `Shutdown` after close are returned directly from the enqueue call.
//!
//! ```rust
//! use voltage_modbus_channel::{ErrorKind, ModbusError};
//!
//! fn classify(error: &ModbusError) {
//!     match error.kind() {
//!         ErrorKind::Exception => println!("server refused: {}", error),
//!         ErrorKind::Timeout | ErrorKind::ConnectionFailed => println!("retry later: {}", error),
//!         _ => println!("giving up: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::ExceptionCode;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors reported by a Modbus channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Request failed validation before it was queued
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] InvalidRequest),

    /// Server returned a Modbus exception reply
    #[error("Modbus exception: {0}")]
    Exception(ExceptionCode),

    /// No matching reply arrived before the request deadline
    #[error("Response timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connecting, writing or reading the transport failed
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Reply could not be parsed or did not match the request
    #[error("Bad frame: {0}")]
    BadFrame(#[from] FrameError),

    /// Channel is shutting down or already closed
    #[error("Channel shut down")]
    Shutdown,

    /// Request queue is at capacity
    #[error("Request queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Invalid endpoint or runtime configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Library internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Request validation failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequest {
    /// Count of zero points
    #[error("count of zero not allowed")]
    CountOfZero,

    /// `start + count` runs past address 65535
    #[error("start ({start}) and count ({count}) would overflow the u16 address space")]
    AddressOverflow { start: u16, count: u16 },

    /// Count exceeds the maximum for this function
    #[error("count {count} exceeds the maximum of {max} allowed for this function")]
    CountTooLargeForType { count: u16, max: u16 },

    /// Value list longer than a u16 count can express
    #[error("value list of length {0} does not fit a u16 count")]
    CountTooBigForU16(usize),
}

/// Framing and reply parsing failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// MBAP length field of zero
    #[error("MBAP length field is zero")]
    LengthZero,

    /// MBAP length field larger than 254
    #[error("MBAP length field {0} exceeds the maximum of 254")]
    LengthTooBig(usize),

    /// Protocol id other than 0x0000
    #[error("unknown protocol id 0x{0:04X}")]
    UnknownProtocolId(u16),

    /// Declared length does not match the buffer
    #[error("declared length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// Payload shorter than the function requires
    #[error("insufficient bytes in reply")]
    InsufficientBytes,

    /// Byte count field larger than what follows
    #[error("byte count {count} exceeds the {remaining} remaining bytes")]
    InsufficientBytesForByteCount { count: usize, remaining: usize },

    /// Byte count does not match the requested quantity
    #[error("byte count {actual} does not match the expected {expected}")]
    ByteCountMismatch { expected: usize, actual: usize },

    /// Extra bytes after a complete reply
    #[error("{0} trailing bytes after reply")]
    TrailingBytes(usize),

    /// Reply function code does not belong to the request
    #[error("unexpected function code 0x{actual:02X}, expected 0x{expected:02X}")]
    UnexpectedFunction { expected: u8, actual: u8 },

    /// Reply from a different unit id
    #[error("reply from unit {actual}, expected unit {expected}")]
    UnitIdMismatch { expected: u8, actual: u8 },

    /// Write reply does not echo the request
    #[error("write reply does not echo the request")]
    EchoMismatch,

    /// Coil value other than 0xFF00 or 0x0000
    #[error("unknown coil state 0x{0:04X}")]
    UnknownCoilState(u16),
}

/// Coarse outcome categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    Exception,
    Timeout,
    ConnectionFailed,
    BadFrame,
    Shutdown,
    QueueFull,
    Other,
}

impl ModbusError {
    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    /// Create an exception error from a raw exception byte
    pub fn exception(code: u8) -> Self {
        Self::Exception(ExceptionCode::from(code))
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Outcome category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModbusError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ModbusError::Exception(_) => ErrorKind::Exception,
            ModbusError::Timeout { .. } => ErrorKind::Timeout,
            ModbusError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            ModbusError::BadFrame(_) => ErrorKind::BadFrame,
            ModbusError::Shutdown => ErrorKind::Shutdown,
            ModbusError::QueueFull { .. } => ErrorKind::QueueFull,
            ModbusError::Configuration { .. } | ModbusError::Internal { .. } => ErrorKind::Other,
        }
    }

    /// Check if a later attempt of the same request may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout { .. }
                | ModbusError::ConnectionFailed { .. }
                | ModbusError::QueueFull { .. }
        )
    }

    /// Check if this is a communication error (timeout, connection, frame, shutdown)
    pub fn is_communication_error(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout { .. }
                | ModbusError::ConnectionFailed { .. }
                | ModbusError::BadFrame(_)
                | ModbusError::Shutdown
        )
    }

    /// Server-side exception code, if any
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::Exception(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::connection(err.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ModbusError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ModbusError::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ModbusError::from(InvalidRequest::CountOfZero).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(ModbusError::exception(0x02).kind(), ErrorKind::Exception);
        assert_eq!(ModbusError::timeout(100).kind(), ErrorKind::Timeout);
        assert_eq!(ModbusError::connection("x").kind(), ErrorKind::ConnectionFailed);
        assert_eq!(
            ModbusError::from(FrameError::LengthZero).kind(),
            ErrorKind::BadFrame
        );
        assert_eq!(ModbusError::Shutdown.kind(), ErrorKind::Shutdown);
        assert_eq!(
            ModbusError::QueueFull { capacity: 1 }.kind(),
            ErrorKind::QueueFull
        );
        assert_eq!(ModbusError::configuration("x").kind(), ErrorKind::Other);
    }

    #[test]
    fn test_error_classification() {
        assert!(ModbusError::timeout(1000).is_recoverable());
        assert!(ModbusError::timeout(1000).is_communication_error());
        assert!(!ModbusError::exception(0x01).is_recoverable());
        assert!(!ModbusError::exception(0x01).is_communication_error());
        assert!(ModbusError::Shutdown.is_communication_error());
        assert!(!ModbusError::Shutdown.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::exception(0x02);
        assert_eq!(
            err.to_string(),
            "Modbus exception: Illegal Data Address (0x02)"
        );
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));

        let err = ModbusError::from(FrameError::UnknownProtocolId(0x1234));
        assert_eq!(err.to_string(), "Bad frame: unknown protocol id 0x1234");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: ModbusError = io.into();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.to_string().contains("reset by peer"));
    }
}
