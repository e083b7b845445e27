//! # Modbus TCP Transport
//!
//! Connection establishment, reconnect back-off and traffic statistics for a
//! channel. The channel task never opens sockets itself; it asks its
//! [`Connector`] for a fresh byte stream whenever it has none.
//!
//! ## Transport Statistics
//!
//! ```rust,no_run
//! # use voltage_modbus_channel::Channel;
//! # fn example(channel: &Channel) {
//! let stats = channel.stats();
//!
//! println!("Requests sent: {}", stats.requests_sent);
//! println!("Responses received: {}", stats.responses_received);
//! println!("Timeouts: {}", stats.timeouts);
//! println!("Discarded replies: {}", stats.discarded_replies);
//! # }
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::constants::{DEFAULT_RECONNECT_MAX_DELAY, DEFAULT_RECONNECT_MIN_DELAY};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::UnitId;

/// Format bytes as hex string for logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and format
pub fn log_packet(direction: &str, data: &[u8], unit_id: Option<UnitId>) {
    let hex_string = format_hex_packet(data);
    match unit_id {
        Some(id) => info!("[MODBUS-TCP] {} unit:{} {}", direction, id, hex_string),
        None => info!("[MODBUS-TCP] {} {}", direction, hex_string),
    }
}

/// Source of byte streams for a channel
///
/// Called by the channel task whenever it needs a connection: before the
/// first request, after a transport failure, and after too many consecutive
/// timeouts.
pub trait Connector: Send + 'static {
    /// Duplex byte stream the channel frames
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Human-readable remote endpoint
    fn endpoint(&self) -> &str;

    /// Open a new stream
    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// TCP connector for `host:port` endpoints
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector, validating the endpoint format
    pub fn new(endpoint: &str, connect_timeout: Duration) -> ModbusResult<Self> {
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            connect_timeout,
        })
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&mut self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let endpoint = self.endpoint.clone();
        let connect_timeout = self.connect_timeout;
        async move {
            let stream = timeout(connect_timeout, TcpStream::connect(endpoint.as_str()))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out", endpoint),
                    )
                })??;
            stream.set_nodelay(true)?;
            debug!("TCP connection established to {}", endpoint);
            Ok(stream)
        }
    }
}

/// Validate a `host:port` endpoint string
pub fn parse_endpoint(endpoint: &str) -> ModbusResult<String> {
    if endpoint.parse::<SocketAddr>().is_ok() {
        return Ok(endpoint.to_string());
    }

    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        ModbusError::configuration(format!("endpoint '{}' is not host:port", endpoint))
    })?;

    if host.is_empty() {
        return Err(ModbusError::configuration(format!(
            "endpoint '{}' has an empty host",
            endpoint
        )));
    }
    port.parse::<u16>().map_err(|_| {
        ModbusError::configuration(format!("endpoint '{}' has an invalid port", endpoint))
    })?;

    Ok(endpoint.to_string())
}

/// Delay policy between connection attempts
pub trait ReconnectStrategy: Send {
    /// Called after a successful connection
    fn reset(&mut self);

    /// Delay to wait after a failed attempt
    fn next_delay(&mut self) -> Duration;
}

/// Reconnect delay bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_RECONNECT_MIN_DELAY,
            max_delay: DEFAULT_RECONNECT_MAX_DELAY,
        }
    }
}

impl ReconnectConfig {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// Doubling strategy over these bounds
    pub fn doubling(&self) -> Box<dyn ReconnectStrategy> {
        Box::new(Doubling::new(self.min_delay, self.max_delay))
    }
}

/// Doubles the delay after every failure, up to a maximum
#[derive(Debug, Clone)]
pub struct Doubling {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Doubling {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }
}

impl ReconnectStrategy for Doubling {
    fn reset(&mut self) {
        self.current = self.min;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

/// Snapshot of channel traffic statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Replies whose transaction id matched nothing in flight
    pub discarded_replies: u64,
}

impl TransportStats {
    /// Percentage of sent requests that received a reply
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            return 0.0;
        }
        (self.responses_received as f64 / self.requests_sent as f64) * 100.0
    }
}

/// Live counters shared between a channel task and its handles
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    discarded_replies: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeouts(&self, count: usize) {
        self.timeouts.fetch_add(count as u64, Ordering::Relaxed);
        self.errors.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            discarded_replies: self.discarded_replies.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x00, 0x01, 0xAB, 0xFF]), "00 01 AB FF");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("127.0.0.1:502").unwrap(), "127.0.0.1:502");
        assert_eq!(parse_endpoint("[::1]:1502").unwrap(), "[::1]:1502");
        assert_eq!(parse_endpoint("plc.local:502").unwrap(), "plc.local:502");

        for bad in ["127.0.0.1", ":502", "host:", "host:70000", "host:abc"] {
            assert_eq!(parse_endpoint(bad).unwrap_err().kind(), ErrorKind::Other, "{}", bad);
        }
    }

    #[test]
    fn test_doubling_strategy() {
        let mut strategy = Doubling::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(strategy.next_delay(), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(), Duration::from_millis(200));
        assert_eq!(strategy.next_delay(), Duration::from_millis(400));
        assert_eq!(strategy.next_delay(), Duration::from_millis(500));
        assert_eq!(strategy.next_delay(), Duration::from_millis(500));

        strategy.reset();
        assert_eq!(strategy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_reconnect_config_bounds() {
        let config = ReconnectConfig::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(2));
        assert_eq!(ReconnectConfig::default().min_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_stats_counters() {
        let counters = StatsCounters::default();
        counters.record_sent(12);
        counters.record_sent(12);
        counters.record_received(11);
        counters.record_response();
        counters.record_timeouts(1);
        counters.record_discarded();

        let stats = counters.snapshot();
        assert_eq!(stats.requests_sent, 2);
        assert_eq!(stats.bytes_sent, 24);
        assert_eq!(stats.bytes_received, 11);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.discarded_replies, 1);
        assert!((stats.success_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connector =
            TcpConnector::new(&addr.to_string(), Duration::from_millis(500)).unwrap();
        assert_eq!(connector.endpoint(), addr.to_string());
        assert!(connector.connect().await.is_err());
    }
}
