//! Channel task: the per-channel protocol driver
//!
//! One task owns the connection, the transaction matcher and the receiving
//! end of the request queue. Requests are processed strictly one at a time:
//!
//! ```text
//! Idle --dequeue--> Sending --written--> AwaitingReply --reply/timeout--> Idle
//!   \_____________________ shutdown signal ______________________/--> Closed
//! ```
//!
//! Every callback runs on this task, so callbacks fire in enqueue order.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelConfig;
use crate::constants::MBAP_HEADER_LEN;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{encode_frame, Frame, FrameReader};
use crate::request::Request;
use crate::transaction::TransactionMatcher;
use crate::transport::{log_packet, Connector, ReconnectStrategy, StatsCounters};

/// Observable state of a channel task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    /// No request in flight
    Idle = 0,
    /// Connecting or writing a request
    Sending = 1,
    /// Waiting for the reply to the in-flight request
    AwaitingReply = 2,
    /// Terminal; no further requests are accepted
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Idle,
            1 => ChannelState::Sending,
            2 => ChannelState::AwaitingReply,
            _ => ChannelState::Closed,
        }
    }
}

/// State shared between the task and every handle of its channel
#[derive(Debug, Default)]
pub(crate) struct ChannelShared {
    state: AtomicU8,
    connected: AtomicBool,
    pub(crate) stats: StatsCounters,
}

impl ChannelShared {
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// Stand-in for deadlines too far out to represent (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `after` from now, or [`FAR_FUTURE`] from now if that overflows
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Shutdown was signalled while a request was being processed
struct Stop;

/// What woke the task while a transaction was in flight
enum Wake {
    Shutdown,
    Frame(ModbusResult<Frame>),
    Deadline,
}

/// Resolves once shutdown is signalled; never resolves if the signal can no
/// longer be sent
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Driver loop of one channel
pub struct ChannelTask<C: Connector> {
    connector: C,
    rx: mpsc::Receiver<Request>,
    shutdown: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
    shared: Arc<ChannelShared>,
    config: ChannelConfig,
    io: Option<C::Stream>,
    reader: FrameReader,
    matcher: TransactionMatcher,
    reconnect: Box<dyn ReconnectStrategy>,
    backoff_until: Option<Instant>,
    consecutive_timeouts: u32,
}

impl<C: Connector> ChannelTask<C> {
    pub(crate) fn new(
        connector: C,
        config: ChannelConfig,
        rx: mpsc::Receiver<Request>,
        shutdown: watch::Receiver<bool>,
        closed: watch::Sender<bool>,
        shared: Arc<ChannelShared>,
    ) -> Self {
        Self {
            reconnect: config.reconnect.doubling(),
            connector,
            rx,
            shutdown,
            closed,
            shared,
            config,
            io: None,
            reader: FrameReader::new(),
            matcher: TransactionMatcher::new(),
            backoff_until: None,
            consecutive_timeouts: 0,
        }
    }

    /// Remote endpoint served by this task
    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    /// Run until shutdown is signalled or every handle is dropped
    pub async fn run(mut self) {
        info!("Channel task started");

        loop {
            self.shared.set_state(ChannelState::Idle);

            let request = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => {
                        debug!("All channel handles dropped");
                        break;
                    }
                },
            };

            if self.process(request).await.is_err() {
                break;
            }
        }

        self.drain();
    }

    async fn process(&mut self, request: Request) -> Result<(), Stop> {
        self.shared.set_state(ChannelState::Sending);

        if self.io.is_none() {
            if let Some(until) = self.backoff_until {
                if Instant::now() < until {
                    self.shared.stats.record_error();
                    request.fail(ModbusError::connection(format!(
                        "waiting to reconnect to {}",
                        self.connector.endpoint()
                    )));
                    return Ok(());
                }
            }

            let connected = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => {
                    request.fail(ModbusError::Shutdown);
                    return Err(Stop);
                }
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    info!("Connected to {}", self.connector.endpoint());
                    self.io = Some(stream);
                    self.reader.reset();
                    self.reconnect.reset();
                    self.backoff_until = None;
                    self.consecutive_timeouts = 0;
                    self.shared.set_connected(true);
                }
                Err(err) => {
                    let delay = self.reconnect.next_delay();
                    warn!(
                        "Failed to connect to {}: {}, next attempt in {:?}",
                        self.connector.endpoint(),
                        err,
                        delay
                    );
                    self.backoff_until = Some(deadline_after(delay));
                    self.shared.stats.record_error();
                    request.fail(ModbusError::connection(err.to_string()));
                    return Ok(());
                }
            }
        }

        let pdu = match request.encode() {
            Ok(pdu) => pdu,
            Err(err) => {
                error!("Failed to encode request: {}", err);
                self.shared.stats.record_error();
                request.fail(err);
                return Ok(());
            }
        };

        let tx_id = self.matcher.next_id();
        let adu = encode_frame(tx_id, request.unit_id(), pdu.as_slice());
        if self.config.packet_logging {
            log_packet("send", &adu, Some(request.unit_id()));
        }

        let Some(io) = self.io.as_mut() else {
            request.fail(ModbusError::internal("no connection after connect"));
            return Ok(());
        };

        let written = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut self.shutdown) => {
                request.fail(ModbusError::Shutdown);
                return Err(Stop);
            }
            result = io.write_all(&adu) => result,
        };

        if let Err(err) = written {
            warn!("Write to {} failed: {}", self.connector.endpoint(), err);
            self.drop_connection();
            self.shared.stats.record_error();
            request.fail(ModbusError::connection(err.to_string()));
            return Ok(());
        }

        self.shared.stats.record_sent(adu.len());
        debug!(
            "Sent tx_id={} unit={} function={:?}",
            tx_id,
            request.unit_id(),
            request.function()
        );

        let deadline = deadline_after(request.timeout());
        self.matcher.register(tx_id, request, deadline);
        self.shared.set_state(ChannelState::AwaitingReply);

        self.await_reply().await
    }

    async fn await_reply(&mut self) -> Result<(), Stop> {
        while let Some(deadline) = self.matcher.next_deadline() {
            let Some(io) = self.io.as_mut() else {
                self.matcher
                    .fail_all(ModbusError::connection("connection lost"));
                return Ok(());
            };

            let wake = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => Wake::Shutdown,
                frame = self.reader.next_frame(io) => Wake::Frame(frame),
                _ = sleep_until(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Shutdown => return Err(Stop),
                Wake::Frame(Ok(frame)) => {
                    self.shared
                        .stats
                        .record_received(MBAP_HEADER_LEN + frame.pdu.len());
                    if self.config.packet_logging {
                        let header = frame.header;
                        let adu = encode_frame(header.tx_id, header.unit_id, &frame.pdu);
                        log_packet("receive", &adu, Some(header.unit_id));
                    }

                    match self.matcher.resolve(&frame) {
                        None => self.shared.stats.record_discarded(),
                        Some(result) => {
                            self.consecutive_timeouts = 0;
                            self.shared.stats.record_response();
                            if let Err(err) = result {
                                debug!("Request completed with error: {}", err);
                                self.shared.stats.record_error();
                            }
                        }
                    }
                }
                Wake::Frame(Err(err)) => {
                    warn!("Dropping connection to {}: {}", self.connector.endpoint(), err);
                    self.drop_connection();
                    self.shared.stats.record_error();
                    self.matcher.fail_all(err);
                }
                Wake::Deadline => {
                    let expired = self.matcher.expire(Instant::now());
                    self.shared.stats.record_timeouts(expired.len());
                    self.consecutive_timeouts = self
                        .consecutive_timeouts
                        .saturating_add(expired.len() as u32);

                    if self.consecutive_timeouts >= self.config.max_consecutive_timeouts {
                        warn!(
                            "{} consecutive timeouts, reconnecting to {}",
                            self.consecutive_timeouts,
                            self.connector.endpoint()
                        );
                        self.drop_connection();
                    }
                }
            }
        }

        Ok(())
    }

    fn drop_connection(&mut self) {
        if self.io.take().is_some() {
            info!("Disconnected from {}", self.connector.endpoint());
        }
        self.reader.reset();
        self.consecutive_timeouts = 0;
        self.shared.set_connected(false);
    }

    /// Fail everything still pending with `Shutdown`, in enqueue order
    fn drain(&mut self) {
        self.rx.close();
        self.shared.set_state(ChannelState::Closed);

        self.matcher.fail_all(ModbusError::Shutdown);

        let mut drained = 0usize;
        while let Ok(request) = self.rx.try_recv() {
            request.fail(ModbusError::Shutdown);
            drained += 1;
        }

        self.io = None;
        self.shared.set_connected(false);

        info!("Channel closed, {} queued requests failed with shutdown", drained);
        self.closed.send_replace(true);
    }
}

impl<C: Connector> Drop for ChannelTask<C> {
    fn drop(&mut self) {
        // a task dropped without running to completion still resolves everything
        if !*self.closed.borrow() {
            self.drain();
        }
    }
}
