//! # Log Sink
//!
//! The library logs through `tracing`. Applications that do not run their
//! own subscriber can install a single process-wide sink instead: every
//! event at or below the global level is formatted into one line and handed
//! to the sink.
//!
//! ```rust,no_run
//! use voltage_modbus_channel::logging::{console_sink, set_log_handler, set_max_log_level, LogLevel};
//!
//! set_max_log_level(LogLevel::Debug);
//! if !set_log_handler(console_sink()) {
//!     eprintln!("another tracing subscriber is already installed");
//! }
//! ```
//!
//! Installing again replaces the previous sink; [`clear_log_handler`] removes
//! it. The sink is called from whichever channel task emitted the event, so
//! it must be safe to call concurrently.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::field::{Field, Visit};
use tracing::subscriber::Interest;
use tracing::{Event, Level, Metadata, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Log level of a forwarded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            Level::DEBUG => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Process-wide log sink
pub type LogHandler = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static HANDLER: RwLock<Option<LogHandler>> = RwLock::new(None);
static SUBSCRIBER_INSTALLED: OnceLock<bool> = OnceLock::new();

/// Set the most verbose level forwarded to the sink
pub fn set_max_log_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current level threshold
pub fn max_log_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// Install `handler` as the process-wide sink
///
/// The first call installs the forwarding subscriber as the global `tracing`
/// default. Returns `false` if a different global subscriber was already in
/// place; the sink is not installed in that case.
pub fn set_log_handler(handler: LogHandler) -> bool {
    let installed = *SUBSCRIBER_INSTALLED.get_or_init(|| {
        let subscriber = tracing_subscriber::registry().with(ForwardingLayer);
        tracing::subscriber::set_global_default(subscriber).is_ok()
    });
    if !installed {
        return false;
    }

    *HANDLER.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    true
}

/// Remove the installed sink; events are dropped until a new one is set
pub fn clear_log_handler() {
    *HANDLER.write().unwrap_or_else(PoisonError::into_inner) = None;
}

/// Sink printing timestamped lines to stdout
pub fn console_sink() -> LogHandler {
    Arc::new(|level, message: &str| {
        println!(
            "{} {:5} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );
    })
}

fn current_handler() -> Option<LogHandler> {
    HANDLER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Layer forwarding formatted events to the installed sink
struct ForwardingLayer;

impl<S> Layer<S> for ForwardingLayer
where
    S: Subscriber,
{
    fn register_callsite(&self, _metadata: &'static Metadata<'static>) -> Interest {
        // the threshold changes at runtime
        Interest::sometimes()
    }

    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        LogLevel::from(*metadata.level()) <= max_log_level()
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(handler) = current_handler() else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        handler(LogLevel::from(*event.metadata().level()), &visitor.finish());
    }
}

/// Collects the message and `key=value` pairs of an event
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", field.name(), value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_field(field, format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.push_field(field, format_args!("{:?}", value));
        }
    }
}
