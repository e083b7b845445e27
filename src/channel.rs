//! # Channel Handle
//!
//! [`Channel`] is the caller-facing side of a channel: a cheap, cloneable
//! handle that validates requests and appends them to the bounded queue of
//! the channel task. Every request method returns as soon as the request is
//! queued; the outcome is delivered later to the callback, on the channel
//! task.
//!
//! ```rust,no_run
//! use voltage_modbus_channel::{AddressRange, Channel, ChannelConfig, RequestParam};
//!
//! #[tokio::main]
//! async fn main() -> voltage_modbus_channel::ModbusResult<()> {
//!     let channel = Channel::spawn_tcp_client("127.0.0.1:502", ChannelConfig::default())?;
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
//!     channel.shutdown().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info_span, warn, Instrument};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONSECUTIVE_TIMEOUTS, DEFAULT_MAX_QUEUED_REQUESTS,
    DEFAULT_SHUTDOWN_TIMEOUT, MAX_QUEUED_REQUESTS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::iter::{BitIterator, RegisterIterator};
use crate::protocol::{AddressRange, Indexed, ModbusFunction, RequestParam, WriteMultiple};
use crate::request::{Request, RequestDetails};
use crate::task::{ChannelShared, ChannelState, ChannelTask};
use crate::transport::{Connector, ReconnectConfig, TcpConnector, TransportStats};

/// Channel configuration
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use voltage_modbus_channel::ChannelConfig;
///
/// let config = ChannelConfig::new()
///     .with_max_queued_requests(16)
///     .with_max_consecutive_timeouts(5)
///     .with_packet_logging(true);
///
/// assert_eq!(config.max_queued_requests, 16);
/// assert_eq!(config.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Capacity of the request queue
    pub max_queued_requests: usize,
    /// Timeouts in a row after which the connection is re-established
    pub max_consecutive_timeouts: u32,
    /// Reconnect back-off bounds
    pub reconnect: ReconnectConfig,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Upper bound on [`Channel::shutdown`]
    pub shutdown_timeout: Duration,
    /// Log every sent and received ADU as hex
    pub packet_logging: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_queued_requests: DEFAULT_MAX_QUEUED_REQUESTS,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            packet_logging: false,
        }
    }
}

impl ChannelConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request queue capacity
    pub fn with_max_queued_requests(mut self, capacity: usize) -> Self {
        self.max_queued_requests = capacity;
        self
    }

    /// Set the consecutive timeout threshold
    pub fn with_max_consecutive_timeouts(mut self, count: u32) -> Self {
        self.max_consecutive_timeouts = count;
        self
    }

    /// Set the reconnect back-off bounds
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the shutdown wait bound
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Enable or disable hex packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Check the configuration for values the channel cannot run with
    pub fn validate(&self) -> ModbusResult<()> {
        if self.max_queued_requests == 0 {
            return Err(ModbusError::configuration(
                "max_queued_requests must be at least 1",
            ));
        }
        if self.max_queued_requests > MAX_QUEUED_REQUESTS {
            return Err(ModbusError::configuration(format!(
                "max_queued_requests must not exceed {}",
                MAX_QUEUED_REQUESTS
            )));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(ModbusError::configuration(
                "max_consecutive_timeouts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Handle to a Modbus channel
///
/// Clones share the same queue and task. The task keeps running while any
/// handle exists, or until [`Channel::shutdown`] is called.
#[derive(Debug, Clone)]
pub struct Channel {
    tx: mpsc::Sender<Request>,
    shutdown: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
    shared: Arc<ChannelShared>,
    endpoint: Arc<str>,
    capacity: usize,
    shutdown_timeout: Duration,
}

impl Channel {
    /// Create a handle and the task that serves it
    ///
    /// The task does nothing until it is spawned on a Tokio runtime.
    pub fn create<C: Connector>(
        connector: C,
        config: ChannelConfig,
    ) -> ModbusResult<(Channel, ChannelTask<C>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.max_queued_requests);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(ChannelShared::default());

        let channel = Channel {
            tx,
            shutdown: Arc::new(shutdown_tx),
            closed: closed_rx,
            shared: shared.clone(),
            endpoint: Arc::from(connector.endpoint()),
            capacity: config.max_queued_requests,
            shutdown_timeout: config.shutdown_timeout,
        };
        let task = ChannelTask::new(connector, config, rx, shutdown_rx, closed_tx, shared);

        Ok((channel, task))
    }

    /// Create a TCP channel and spawn its task on the current Tokio runtime
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_tcp_client(endpoint: &str, config: ChannelConfig) -> ModbusResult<Channel> {
        let connector = TcpConnector::new(endpoint, config.connect_timeout)?;
        let (channel, task) = Channel::create(connector, config)?;
        let span = info_span!("modbus-tcp-client", endpoint = %channel.endpoint());
        tokio::spawn(task.run().instrument(span));
        Ok(channel)
    }

    /// Remote endpoint of this channel
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests waiting in the queue
    pub fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    /// Current task state
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Whether the task currently holds an open connection
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Whether the channel no longer accepts requests
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || *self.closed.borrow()
    }

    /// Traffic statistics
    pub fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    /// Queue a request without waiting
    ///
    /// On failure the request is handed back to nobody: its callback is
    /// dropped without being invoked and the error is returned here.
    pub fn enqueue(&self, request: Request) -> ModbusResult<()> {
        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request)) => {
                request.disarm();
                Err(ModbusError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(request)) => {
                request.disarm();
                Err(ModbusError::Shutdown)
            }
        }
    }

    /// Read coils (FC01)
    pub fn read_coils<F>(
        &self,
        param: RequestParam,
        range: AddressRange,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: for<'a> FnOnce(ModbusResult<BitIterator<'a>>) + Send + 'static,
    {
        self.read_bits(ModbusFunction::ReadCoils, param, range, Box::new(callback))
    }

    /// Read discrete inputs (FC02)
    pub fn read_discrete_inputs<F>(
        &self,
        param: RequestParam,
        range: AddressRange,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: for<'a> FnOnce(ModbusResult<BitIterator<'a>>) + Send + 'static,
    {
        self.read_bits(
            ModbusFunction::ReadDiscreteInputs,
            param,
            range,
            Box::new(callback),
        )
    }

    /// Read holding registers (FC03)
    pub fn read_holding_registers<F>(
        &self,
        param: RequestParam,
        range: AddressRange,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: for<'a> FnOnce(ModbusResult<RegisterIterator<'a>>) + Send + 'static,
    {
        self.read_registers(
            ModbusFunction::ReadHoldingRegisters,
            param,
            range,
            Box::new(callback),
        )
    }

    /// Read input registers (FC04)
    pub fn read_input_registers<F>(
        &self,
        param: RequestParam,
        range: AddressRange,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: for<'a> FnOnce(ModbusResult<RegisterIterator<'a>>) + Send + 'static,
    {
        self.read_registers(
            ModbusFunction::ReadInputRegisters,
            param,
            range,
            Box::new(callback),
        )
    }

    /// Write a single coil (FC05)
    pub fn write_single_coil<F>(
        &self,
        param: RequestParam,
        value: Indexed<bool>,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: FnOnce(ModbusResult<()>) + Send + 'static,
    {
        self.enqueue(Request::new(
            param,
            RequestDetails::WriteSingleCoil {
                value,
                callback: Box::new(callback),
            },
        ))
    }

    /// Write a single register (FC06)
    pub fn write_single_register<F>(
        &self,
        param: RequestParam,
        value: Indexed<u16>,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: FnOnce(ModbusResult<()>) + Send + 'static,
    {
        self.enqueue(Request::new(
            param,
            RequestDetails::WriteSingleRegister {
                value,
                callback: Box::new(callback),
            },
        ))
    }

    /// Write multiple coils (FC0F) starting at `start`
    pub fn write_multiple_coils<F>(
        &self,
        param: RequestParam,
        start: u16,
        values: Vec<bool>,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: FnOnce(ModbusResult<()>) + Send + 'static,
    {
        let write = WriteMultiple::from(start, values)?;
        self.enqueue(Request::new(
            param,
            RequestDetails::WriteMultipleCoils {
                write,
                callback: Box::new(callback),
            },
        ))
    }

    /// Write multiple registers (FC10) starting at `start`
    pub fn write_multiple_registers<F>(
        &self,
        param: RequestParam,
        start: u16,
        values: Vec<u16>,
        callback: F,
    ) -> ModbusResult<()>
    where
        F: FnOnce(ModbusResult<()>) + Send + 'static,
    {
        let write = WriteMultiple::from(start, values)?;
        self.enqueue(Request::new(
            param,
            RequestDetails::WriteMultipleRegisters {
                write,
                callback: Box::new(callback),
            },
        ))
    }

    pub(crate) fn read_bits(
        &self,
        function: ModbusFunction,
        param: RequestParam,
        range: AddressRange,
        callback: crate::request::BitCallback,
    ) -> ModbusResult<()> {
        let range = range.of_read_bits()?;
        self.enqueue(Request::new(
            param,
            RequestDetails::ReadBits {
                function,
                range,
                callback,
            },
        ))
    }

    pub(crate) fn read_registers(
        &self,
        function: ModbusFunction,
        param: RequestParam,
        range: AddressRange,
        callback: crate::request::RegisterCallback,
    ) -> ModbusResult<()> {
        let range = range.of_read_registers()?;
        self.enqueue(Request::new(
            param,
            RequestDetails::ReadRegisters {
                function,
                range,
                callback,
            },
        ))
    }

    /// Signal the task to stop without waiting for it
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Shutdown signal that does not keep the channel alive
    pub(crate) fn shutdown_signal(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    /// Stop the channel
    ///
    /// Every queued and in-flight request is resolved with
    /// [`ModbusError::Shutdown`] before this returns. The wait is bounded by
    /// `ChannelConfig::shutdown_timeout`; if the task has not finished by
    /// then a timeout error is returned.
    pub async fn shutdown(&self) -> ModbusResult<()> {
        self.signal_shutdown();

        let mut closed = self.closed.clone();
        let waited = timeout(self.shutdown_timeout, closed.wait_for(|closed| *closed))
            .await
            .map(|result| result.map(|_| ()));
        match waited {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    "Channel {} did not close within {:?}",
                    self.endpoint, self.shutdown_timeout
                );
                Err(ModbusError::timeout(self.shutdown_timeout.as_millis() as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, InvalidRequest};
    use std::future::Future;
    use std::io;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Connector that never connects; tests here never run the task
    struct NoConnector;

    impl Connector for NoConnector {
        type Stream = DuplexStream;

        fn endpoint(&self) -> &str {
            "test:502"
        }

        fn connect(&mut self) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")) }
        }
    }

    fn channel(capacity: usize) -> (Channel, ChannelTask<NoConnector>) {
        Channel::create(
            NoConnector,
            ChannelConfig::new().with_max_queued_requests(capacity),
        )
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.max_queued_requests, 100);
        assert_eq!(config.max_consecutive_timeouts, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(!config.packet_logging);
        assert!(config.validate().is_ok());
        assert!(ChannelConfig::new().with_max_queued_requests(0).validate().is_err());
        assert!(ChannelConfig::new()
            .with_max_queued_requests(MAX_QUEUED_REQUESTS)
            .validate()
            .is_ok());
        assert!(ChannelConfig::new()
            .with_max_consecutive_timeouts(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_oversized_queue_rejected() {
        let err = Channel::create(
            NoConnector,
            ChannelConfig::new().with_max_queued_requests(usize::MAX),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(ChannelConfig::new()
            .with_max_queued_requests(MAX_QUEUED_REQUESTS + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_queue_full_is_synchronous() {
        let (channel, _task) = channel(2);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let param = RequestParam::default();

        for i in 0..2u16 {
            let fired = fired.clone();
            channel
                .write_single_register(param, Indexed::new(i, i), move |r| {
                    fired.lock().unwrap().push((i, r))
                })
                .unwrap();
        }
        assert_eq!(channel.queued(), 2);

        let rejected = fired.clone();
        let err = channel
            .write_single_register(param, Indexed::new(9, 9), move |r| {
                rejected.lock().unwrap().push((9, r))
            })
            .unwrap_err();
        assert_eq!(err, ModbusError::QueueFull { capacity: 2 });
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_request_never_queues() {
        let (channel, _task) = channel(4);
        let param = RequestParam::default();

        let err = channel
            .read_holding_registers(param, AddressRange::new(0, 126), |_| {
                panic!("callback must not run")
            })
            .unwrap_err();
        assert_eq!(
            err,
            ModbusError::InvalidRequest(InvalidRequest::CountTooLargeForType {
                count: 126,
                max: 125
            })
        );

        let err = channel
            .read_coils(param, AddressRange::new(65535, 2), |_| {
                panic!("callback must not run")
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = channel
            .write_multiple_coils(param, 0, vec![], |_| panic!("callback must not run"))
            .unwrap_err();
        assert_eq!(err, ModbusError::InvalidRequest(InvalidRequest::CountOfZero));

        assert_eq!(channel.queued(), 0);
    }

    #[test]
    fn test_dropped_task_fails_queued_and_rejects_new() {
        let (channel, task) = channel(4);
        let fired = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3u16 {
            let fired = fired.clone();
            channel
                .write_single_coil(RequestParam::default(), Indexed::new(i, true), move |r| {
                    fired.lock().unwrap().push((i, r))
                })
                .unwrap();
        }

        drop(task);
        assert!(channel.is_closed());
        assert_eq!(
            *fired.lock().unwrap(),
            vec![
                (0, Err(ModbusError::Shutdown)),
                (1, Err(ModbusError::Shutdown)),
                (2, Err(ModbusError::Shutdown))
            ]
        );

        let err = channel
            .write_single_coil(RequestParam::default(), Indexed::new(0, true), |_| {
                panic!("callback must not run")
            })
            .unwrap_err();
        assert_eq!(err, ModbusError::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_in_order() {
        let (channel, task) = channel(8);
        let fired = Arc::new(Mutex::new(Vec::new()));

        channel.signal_shutdown();
        for i in 0..4u16 {
            let fired = fired.clone();
            channel
                .write_single_register(RequestParam::default(), Indexed::new(i, i), move |r| {
                    fired.lock().unwrap().push((i, r))
                })
                .unwrap();
        }

        let handle = tokio::spawn(task.run());
        channel.shutdown().await.unwrap();
        handle.await.unwrap();

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 4);
        for (i, (index, result)) in fired.iter().enumerate() {
            assert_eq!(*index, i as u16);
            assert_eq!(*result, Err(ModbusError::Shutdown));
        }
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(channel.is_closed());
    }
}
