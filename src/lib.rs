//! # Voltage Modbus Channel - Asynchronous Modbus TCP Client
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! A channel-based Modbus TCP client in pure Rust. Each channel owns one
//! connection and one task; callers enqueue requests through a cheap handle
//! and receive the outcome through a callback (or a future, via
//! [`ChannelClient`]).
//!
//! ## Features
//!
//! - **Strict ordering**: one transaction in flight per channel, callbacks fire in enqueue order
//! - **Backpressure**: bounded request queue, `QueueFull` is reported synchronously
//! - **Borrow-scoped results**: read results are lazy iterators over the reply buffer
//! - **Reconnect policy**: doubling back-off, reconnect after consecutive timeouts
//! - **Clean shutdown**: every queued and in-flight request resolves exactly once
//! - **Pluggable logging**: `tracing` events, or a process-wide log sink
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_channel::{AddressRange, RequestParam, Runtime, RuntimeConfig};
//!
//! fn main() -> voltage_modbus_channel::ModbusResult<()> {
//!     let runtime = Runtime::new(RuntimeConfig::default())?;
//!     let channel = runtime.create_tcp_client("127.0.0.1:502", 100)?;
//!
//!     channel.read_holding_registers(
//!         RequestParam::from_millis(1, 1000),
//!         AddressRange::try_from(0, 5)?,
//!         |result| match result {
//!             Ok(registers) => {
//!                 for register in registers {
//!                     println!("{}: {}", register.index, register.value);
//!                 }
//!             }
//!             Err(err) => println!("read failed: {}", err),
//!         },
//!     )?;
//!
//!     runtime.destroy_channel(&channel)?;
//!     runtime.destroy();
//!     Ok(())
//! }
//! ```

// ============================================================================
// Protocol
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Modbus protocol value types
pub mod protocol;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// MBAP framing
pub mod frame;

/// Request encoding and reply decoding
pub mod codec;

/// Lazy read result iterators
pub mod iter;

// ============================================================================
// Channel machinery
// ============================================================================

/// Queued request objects and their callbacks
pub mod request;

/// Transaction id allocation and reply matching
pub mod transaction;

/// Connections, reconnect policy and statistics
pub mod transport;

/// Per-channel driver task
pub mod task;

/// Caller-facing channel handle
pub mod channel;

/// Future-based client API
pub mod client;

/// Tokio runtime ownership
pub mod runtime;

/// Process-wide log sink
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_modbus_channel::tokio) ===
pub use tokio;

// === Channel API ===
pub use channel::{Channel, ChannelConfig};
pub use request::{BitCallback, RegisterCallback, Request, WriteCallback};
pub use runtime::{Runtime, RuntimeConfig};
pub use task::{ChannelState, ChannelTask};

// === Future API ===
pub use client::{ChannelClient, ModbusClient};

// === Error handling ===
pub use error::{ErrorKind, FrameError, InvalidRequest, ModbusError, ModbusResult};

// === Core types ===
pub use iter::{BitIterator, RegisterIterator};
pub use protocol::{
    AddressRange, ExceptionCode, Indexed, ModbusAddress, ModbusFunction, RequestParam, UnitId,
    WriteMultiple,
};

// === Transport ===
pub use transport::{Connector, ReconnectConfig, ReconnectStrategy, TcpConnector, TransportStats};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS, MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS,
    MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

// === Logging ===
pub use logging::{clear_log_handler, set_log_handler, set_max_log_level, LogHandler, LogLevel};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Modbus Channel v{} - asynchronous Modbus TCP client by Evan Liu",
        VERSION
    )
}
