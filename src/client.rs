//! Future-based Modbus client over a channel
//!
//! [`ChannelClient`] wraps a [`Channel`] and turns its callback contract into
//! `async` calls: each request carries a `oneshot` sender in its callback and
//! the caller awaits the receiver. Requests still go through the channel
//! queue, so several clients sharing one channel stay strictly ordered.
//!
//! # API Naming Convention
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use voltage_modbus_channel::{ChannelClient, ChannelConfig, ModbusClient, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut client = ChannelClient::connect(
//!         "127.0.0.1:502",
//!         ChannelConfig::default(),
//!         Duration::from_secs(1),
//!     )?;
//!
//!     let registers = client.read_03(1, 0, 10).await?;
//!     for register in registers {
//!         println!("{}: {}", register.index, register.value);
//!     }
//!
//!     client.write_06(1, 100, 0x1234).await?;
//!     client.close().await
//! }
//! ```

use std::time::Duration;

use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelConfig};
use crate::error::ModbusResult;
use crate::iter::{BitIterator, RegisterIterator};
use crate::protocol::{AddressRange, Indexed, ModbusFunction, RequestParam, UnitId};
use crate::transport::TransportStats;

/// Trait defining the interface for Modbus client operations.
///
/// # Protocol Limits
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Coils (0x01) | 2000 coils |
/// | Read Discrete Inputs (0x02) | 2000 bits |
/// | Read Holding Registers (0x03) | 125 registers |
/// | Read Input Registers (0x04) | 125 registers |
/// | Write Multiple Coils (0x0F) | 1968 coils |
/// | Write Multiple Registers (0x10) | 123 registers |
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01).
    fn read_01(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<bool>>>> + Send;

    /// Read discrete inputs (function code 0x02).
    fn read_02(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<bool>>>> + Send;

    /// Read holding registers (function code 0x03).
    fn read_03(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<u16>>>> + Send;

    /// Read input registers (function code 0x04).
    fn read_04(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<u16>>>> + Send;

    /// Write single coil (function code 0x05).
    fn write_05(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send;

    /// Write multiple coils (function code 0x0F).
    fn write_0f(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send;

    /// Check if the client is connected.
    fn is_connected(&self) -> bool;

    /// Close the client connection.
    fn close(&mut self) -> impl std::future::Future<Output = ModbusResult<()>> + Send;

    /// Get transport statistics.
    fn get_stats(&self) -> TransportStats;

    // ===== Semantic name aliases (for readability) =====

    /// Alias for `read_01` - Read coils
    #[inline]
    fn read_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<bool>>>> + Send {
        self.read_01(unit_id, address, quantity)
    }

    /// Alias for `read_02` - Read discrete inputs
    #[inline]
    fn read_discrete_inputs(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<bool>>>> + Send {
        self.read_02(unit_id, address, quantity)
    }

    /// Alias for `read_03` - Read holding registers
    #[inline]
    fn read_holding_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<u16>>>> + Send {
        self.read_03(unit_id, address, quantity)
    }

    /// Alias for `read_04` - Read input registers
    #[inline]
    fn read_input_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> impl std::future::Future<Output = ModbusResult<Vec<Indexed<u16>>>> + Send {
        self.read_04(unit_id, address, quantity)
    }

    /// Alias for `write_05` - Write single coil
    #[inline]
    fn write_single_coil(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send {
        self.write_05(unit_id, address, value)
    }

    /// Alias for `write_06` - Write single register
    #[inline]
    fn write_single_register(
        &mut self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send {
        self.write_06(unit_id, address, value)
    }

    /// Alias for `write_0f` - Write multiple coils
    #[inline]
    fn write_multiple_coils(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send {
        self.write_0f(unit_id, address, values)
    }

    /// Alias for `write_10` - Write multiple registers
    #[inline]
    fn write_multiple_registers(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> impl std::future::Future<Output = ModbusResult<()>> + Send {
        self.write_10(unit_id, address, values)
    }
}

/// Async client backed by a [`Channel`]
#[derive(Debug, Clone)]
pub struct ChannelClient {
    channel: Channel,
    timeout: Duration,
}

impl ChannelClient {
    /// Wrap an existing channel; `timeout` applies to every request
    pub fn new(channel: Channel, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    /// Spawn a TCP channel on the current runtime and wrap it
    pub fn connect(endpoint: &str, config: ChannelConfig, timeout: Duration) -> ModbusResult<Self> {
        Ok(Self::new(Channel::spawn_tcp_client(endpoint, config)?, timeout))
    }

    /// Underlying channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the per-request timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn param(&self, unit_id: UnitId) -> RequestParam {
        RequestParam::new(unit_id, self.timeout)
    }

    async fn read_bits(
        &self,
        function: ModbusFunction,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<Indexed<bool>>> {
        let (tx, rx) = oneshot::channel();
        self.channel.read_bits(
            function,
            self.param(unit_id),
            AddressRange::new(address, quantity),
            Box::new(collect_bits(tx)),
        )?;
        rx.await?
    }

    async fn read_registers(
        &self,
        function: ModbusFunction,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<Indexed<u16>>> {
        let (tx, rx) = oneshot::channel();
        self.channel.read_registers(
            function,
            self.param(unit_id),
            AddressRange::new(address, quantity),
            Box::new(collect_registers(tx)),
        )?;
        rx.await?
    }
}

/// Callback that collects a bit read into a oneshot
fn collect_bits(
    tx: oneshot::Sender<ModbusResult<Vec<Indexed<bool>>>>,
) -> impl for<'a> FnOnce(ModbusResult<BitIterator<'a>>) + Send + 'static {
    move |result| {
        let _ = tx.send(result.map(|bits| bits.collect()));
    }
}

/// Callback that collects a register read into a oneshot
fn collect_registers(
    tx: oneshot::Sender<ModbusResult<Vec<Indexed<u16>>>>,
) -> impl for<'a> FnOnce(ModbusResult<RegisterIterator<'a>>) + Send + 'static {
    move |result| {
        let _ = tx.send(result.map(|registers| registers.collect()));
    }
}

/// Callback that forwards a write outcome into a oneshot
fn write_completion() -> (
    impl FnOnce(ModbusResult<()>) + Send + 'static,
    oneshot::Receiver<ModbusResult<()>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

impl ModbusClient for ChannelClient {
    async fn read_01(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<Indexed<bool>>> {
        self.read_bits(ModbusFunction::ReadCoils, unit_id, address, quantity)
            .await
    }

    async fn read_02(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<Indexed<bool>>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, unit_id, address, quantity)
            .await
    }

    async fn read_03(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<Indexed<u16>>> {
        self.read_registers(ModbusFunction::ReadHoldingRegisters, unit_id, address, quantity)
            .await
    }

    async fn read_04(
        &mut self,
        unit_id: UnitId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<Indexed<u16>>> {
        self.read_registers(ModbusFunction::ReadInputRegisters, unit_id, address, quantity)
            .await
    }

    async fn write_05(&mut self, unit_id: UnitId, address: u16, value: bool) -> ModbusResult<()> {
        let (callback, rx) = write_completion();
        self.channel
            .write_single_coil(self.param(unit_id), Indexed::new(address, value), callback)?;
        rx.await?
    }

    async fn write_06(&mut self, unit_id: UnitId, address: u16, value: u16) -> ModbusResult<()> {
        let (callback, rx) = write_completion();
        self.channel
            .write_single_register(self.param(unit_id), Indexed::new(address, value), callback)?;
        rx.await?
    }

    async fn write_0f(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        let (callback, rx) = write_completion();
        self.channel
            .write_multiple_coils(self.param(unit_id), address, values.to_vec(), callback)?;
        rx.await?
    }

    async fn write_10(
        &mut self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        let (callback, rx) = write_completion();
        self.channel
            .write_multiple_registers(self.param(unit_id), address, values.to_vec(), callback)?;
        rx.await?
    }

    fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.channel.shutdown().await
    }

    fn get_stats(&self) -> TransportStats {
        self.channel.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ModbusError};
    use crate::frame::encode_frame;
    use crate::protocol::ExceptionCode;
    use crate::transport::Connector;
    use std::future::Future;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Connector whose streams are answered by an in-memory server
    struct Loopback;

    impl Connector for Loopback {
        type Stream = DuplexStream;

        fn endpoint(&self) -> &str {
            "loopback:502"
        }

        fn connect(&mut self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            let (client, server) = tokio::io::duplex(1024);
            tokio::spawn(serve(server));
            async move { Ok(client) }
        }
    }

    /// Registers read back their own address; FC06 echoes; anything else is
    /// rejected with Illegal Function
    async fn serve(mut io: DuplexStream) {
        let mut header = [0u8; 7];
        while io.read_exact(&mut header).await.is_ok() {
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; len - 1];
            if io.read_exact(&mut pdu).await.is_err() {
                return;
            }

            let reply = match pdu[0] {
                0x03 => {
                    let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                    let mut reply = vec![0x03, (count * 2) as u8];
                    for i in 0..count {
                        reply.extend_from_slice(&(start + i).to_be_bytes());
                    }
                    reply
                }
                0x06 => pdu.clone(),
                code => vec![code | 0x80, 0x01],
            };

            let tx_id = u16::from_be_bytes([header[0], header[1]]);
            if io.write_all(&encode_frame(tx_id, header[6], &reply)).await.is_err() {
                return;
            }
        }
    }

    fn client() -> ChannelClient {
        let (channel, task) = Channel::create(Loopback, ChannelConfig::default()).unwrap();
        tokio::spawn(task.run());
        ChannelClient::new(channel, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_client_reads_and_writes() {
        let mut client = client();

        let registers = client.read_holding_registers(1, 10, 3).await.unwrap();
        assert_eq!(
            registers,
            vec![
                Indexed::new(10, 10),
                Indexed::new(11, 11),
                Indexed::new(12, 12)
            ]
        );

        client.write_06(1, 4, 0xABCD).await.unwrap();
        assert!(client.is_connected());

        let stats = client.get_stats();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.responses_received, 2);
    }

    #[tokio::test]
    async fn test_client_surfaces_exception() {
        let mut client = client();
        let err = client.read_01(1, 0, 8).await.unwrap_err();
        assert_eq!(err, ModbusError::Exception(ExceptionCode::IllegalFunction));
    }

    #[tokio::test]
    async fn test_client_rejects_invalid_request() {
        let mut client = client();
        let err = client.read_03(1, 0, 200).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(client.get_stats().requests_sent, 0);
    }

    #[tokio::test]
    async fn test_client_close() {
        let mut client = client();
        client.close().await.unwrap();
        assert!(client.channel().is_closed());
        assert_eq!(
            client.write_10(1, 0, &[1, 2]).await,
            Err(ModbusError::Shutdown)
        );
    }
}
