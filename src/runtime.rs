//! # Runtime
//!
//! [`Runtime`] owns a multi-threaded Tokio runtime and the channels created
//! from it. It is the entry point for callers that do not run an async
//! runtime of their own.
//!
//! ```rust,no_run
//! use voltage_modbus_channel::{AddressRange, RequestParam, Runtime, RuntimeConfig};
//!
//! fn main() -> voltage_modbus_channel::ModbusResult<()> {
//!     let runtime = Runtime::new(RuntimeConfig::default())?;
//!     let channel = runtime.create_tcp_client("127.0.0.1:502", 100)?;
//!
//!     channel.read_coils(
//!         RequestParam::from_millis(1, 1000),
//!         AddressRange::try_from(0, 8)?,
//!         |result| println!("{:?}", result.map(|bits| bits.collect::<Vec<_>>())),
//!     )?;
//!
//!     runtime.destroy();
//!     Ok(())
//! }
//! ```
//!
//! Destroying the runtime stops every channel created from it. Channels
//! that are still queued or in flight resolve with
//! [`ModbusError::Shutdown`](crate::ModbusError::Shutdown).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};

use crate::channel::{Channel, ChannelConfig};
use crate::constants::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::error::{ModbusError, ModbusResult};
use crate::transport::TcpConnector;

/// Default name of runtime worker threads
pub const DEFAULT_THREAD_NAME: &str = "modbus-client";

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker thread count; `None` uses one per CPU core
    pub num_core_threads: Option<usize>,
    /// Worker thread name
    pub thread_name: String,
    /// How long `destroy` waits for channels to drain
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_core_threads: None,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_core_threads(mut self, threads: usize) -> Self {
        self.num_core_threads = Some(threads);
        self
    }

    pub fn with_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Held by every spawned channel task for as long as it runs
struct TaskGuard {
    active: Arc<AtomicUsize>,
    _alive: mpsc::Sender<()>,
}

impl TaskGuard {
    fn new(active: Arc<AtomicUsize>, alive: mpsc::Sender<()>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            active,
            _alive: alive,
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Tokio runtime hosting channel tasks
pub struct Runtime {
    inner: Option<tokio::runtime::Runtime>,
    shutdown_timeout: Duration,
    signals: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    active: Arc<AtomicUsize>,
    alive: Option<mpsc::Sender<()>>,
    finished: mpsc::Receiver<()>,
}

impl Runtime {
    /// Build the runtime
    pub fn new(config: RuntimeConfig) -> ModbusResult<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name(config.thread_name.clone());

        if let Some(threads) = config.num_core_threads {
            if threads == 0 {
                return Err(ModbusError::configuration(
                    "num_core_threads must be at least 1",
                ));
            }
            builder.worker_threads(threads);
        }

        let runtime = builder.build().map_err(|e| {
            ModbusError::configuration(format!("failed to build runtime: {}", e))
        })?;
        let (alive, finished) = mpsc::channel(1);

        info!(
            "Runtime started (threads: {:?}, name: {})",
            config.num_core_threads, config.thread_name
        );

        Ok(Self {
            inner: Some(runtime),
            shutdown_timeout: config.shutdown_timeout,
            signals: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            alive: Some(alive),
            finished,
        })
    }

    /// Handle for spawning additional work on this runtime
    pub fn handle(&self) -> Option<Handle> {
        self.inner.as_ref().map(|runtime| runtime.handle().clone())
    }

    /// Number of channel tasks still running
    pub fn active_channels(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Create a TCP client channel to `endpoint` (`host:port`)
    pub fn create_tcp_client(
        &self,
        endpoint: &str,
        max_queued_requests: usize,
    ) -> ModbusResult<Channel> {
        self.create_tcp_client_with_config(
            endpoint,
            ChannelConfig::new().with_max_queued_requests(max_queued_requests),
        )
    }

    /// Create a TCP client channel with a full configuration
    pub fn create_tcp_client_with_config(
        &self,
        endpoint: &str,
        config: ChannelConfig,
    ) -> ModbusResult<Channel> {
        let (Some(runtime), Some(alive)) = (self.inner.as_ref(), self.alive.as_ref()) else {
            return Err(ModbusError::Shutdown);
        };

        let connector = TcpConnector::new(endpoint, config.connect_timeout)?;
        let (channel, task) = Channel::create(connector, config)?;
        let guard = TaskGuard::new(self.active.clone(), alive.clone());

        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        // tasks that already finished no longer hold a receiver
        signals.retain(|signal| signal.receiver_count() > 0);
        signals.push(channel.shutdown_signal());
        drop(signals);

        let span = info_span!("modbus-tcp-client", endpoint = %channel.endpoint());
        runtime.spawn(
            async move {
                let _guard = guard;
                task.run().await;
            }
            .instrument(span),
        );

        Ok(channel)
    }

    /// Shut a channel down and wait for its drain
    ///
    /// Blocking counterpart of [`Channel::shutdown`]; must not be called
    /// from within an async context.
    pub fn destroy_channel(&self, channel: &Channel) -> ModbusResult<()> {
        let Some(runtime) = self.inner.as_ref() else {
            return Err(ModbusError::Shutdown);
        };
        if Handle::try_current().is_ok() {
            channel.signal_shutdown();
            return Err(ModbusError::configuration(
                "destroy_channel called from an async context, use Channel::shutdown",
            ));
        }
        runtime.block_on(channel.shutdown())
    }

    /// Stop every channel and the runtime itself
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(runtime) = self.inner.take() else {
            return;
        };

        let signals = std::mem::take(
            &mut *self.signals.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for signal in &signals {
            signal.send_replace(true);
        }
        self.alive = None;

        if Handle::try_current().is_ok() {
            warn!("Runtime destroyed from within an async context, not waiting for channels");
            runtime.shutdown_background();
            return;
        }

        let shutdown_timeout = self.shutdown_timeout;
        let finished = &mut self.finished;
        // the timer must be created inside the runtime
        let drained =
            runtime.block_on(async { timeout(shutdown_timeout, finished.recv()).await });
        if drained.is_err() {
            error!(
                "Runtime destroyed with {} channels still active after {:?}",
                self.active.load(Ordering::Acquire),
                self.shutdown_timeout
            );
        }

        runtime.shutdown_timeout(self.shutdown_timeout);
        info!("Runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("running", &self.inner.is_some())
            .field("active_channels", &self.active_channels())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}
