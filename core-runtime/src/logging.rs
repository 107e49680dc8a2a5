//! # Logging
//!
//! `tracing` output for the SDK crates, written to stderr as pretty, compact
//! or JSON lines. SDK crates follow the configured level while transport
//! crates stay at `warn`. Credential fields are redacted before events are
//! copied to a host `LoggerSink`.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use bridge_traits::time::LogLevel;
//!
//! let config = LoggingConfig::default()
//!     .with_format(LogFormat::Compact)
//!     .with_level(LogLevel::Debug);
//!
//! init_logging(config)?;
//! tracing::info!("SDK ready");
//! ```
//!
//! ## Host sink
//!
//! A configured `LoggerSink` receives every event that survives filtering as
//! a [`LogEntry`](bridge_traits::time::LogEntry). With redaction enabled the
//! fields are scrubbed before they reach the sink.

use crate::error::{Error, Result};
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::{Context, Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

/// Crates whose level follows [`LoggingConfig::level`].
const SDK_CRATES: &[&str] = &[
    "alipan_workspace",
    "core_runtime",
    "core_auth",
    "core_transfer",
    "core_service",
    "bridge_desktop",
];

/// Transport crates pinned to `warn` so chunk traffic does not flood output.
const QUIET_CRATES: &[&str] = &["h2", "hyper", "reqwest", "sqlx"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// One JSON object per event
    Json,
    /// Single line per event
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level applied to SDK crates when no explicit filter is given.
    pub level: LogLevel,
    /// Scrub credential fields before they reach the sink.
    pub redact_pii: bool,
    /// `EnvFilter` directives replacing the generated per-crate ones.
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    pub display_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            redact_pii: true,
            filter: None,
            logger_sink: None,
            display_target: true,
        }
    }
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("redact_pii", &self.redact_pii)
            .field("filter", &self.filter)
            .field("has_sink", &self.logger_sink.is_some())
            .finish()
    }
}

impl LoggingConfig {
    pub fn with_format(self, format: LogFormat) -> Self {
        Self { format, ..self }
    }

    pub fn with_level(self, level: LogLevel) -> Self {
        Self { level, ..self }
    }

    pub fn with_pii_redaction(self, redact_pii: bool) -> Self {
        Self { redact_pii, ..self }
    }

    pub fn with_filter(self, directives: impl Into<String>) -> Self {
        Self {
            filter: Some(directives.into()),
            ..self
        }
    }

    pub fn with_logger_sink(self, sink: Arc<dyn LoggerSink>) -> Self {
        Self {
            logger_sink: Some(sink),
            ..self
        }
    }

    pub fn with_target(self, display_target: bool) -> Self {
        Self {
            display_target,
            ..self
        }
    }

    fn directives(&self) -> String {
        if let Some(custom) = &self.filter {
            return custom.clone();
        }
        let level = level_name(self.level);
        SDK_CRATES
            .iter()
            .map(|name| format!("{name}={level}"))
            .chain(QUIET_CRATES.iter().map(|name| format!("{name}=warn")))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(self.directives())
            .map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))
    }

    fn output_layer(&self) -> BoxedOutput {
        let base = tracing_subscriber::fmt::layer()
            .with_target(self.display_target)
            .with_writer(io::stderr);
        match self.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Json => base.json().flatten_event(true).boxed(),
        }
    }
}

type BoxedOutput = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Install the global subscriber.
///
/// Only the first call succeeds; later calls return `Error::Config`.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let output = config.output_layer();
    let forwarder = SinkForwarder {
        sink: config.logger_sink,
        redact: config.redact_pii,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .with(forwarder)
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialized: {}", e)))
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

fn sink_level(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        Level::DEBUG => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Copies every event that passes the filter to the host [`LoggerSink`].
struct SinkForwarder {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl SinkForwarder {
    fn deliver(sink: Arc<dyn LoggerSink>, entry: LogEntry) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sink.log(entry).await {
                        eprintln!("log sink rejected entry: {}", e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = futures::executor::block_on(sink.log(entry)) {
                    eprintln!("log sink rejected entry: {}", e);
                }
            }
        }
    }
}

impl<S> Layer<S> for SinkForwarder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = &self.sink else { return };
        let meta = event.metadata();
        let level = sink_level(meta.level());
        if level < sink.min_level() {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let message = fields.message.take().unwrap_or_else(|| meta.name().to_string());
        let mut entry = LogEntry::new(level, meta.target(), message);
        for (name, value) in fields.values {
            let value = if self.redact {
                redact_if_sensitive(&name, &value)
            } else {
                value
            };
            entry = entry.with_field(name, value);
        }
        if let Some(span) = ctx.lookup_current() {
            entry = entry.with_field("span", span.name());
        }

        Self::deliver(Arc::clone(sink), entry);
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

// Numbers and bools fall through to `record_debug`, whose output matches
// their `Display`.
impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{:?}", value));
    }
}

/// Redact a field value when its name marks it as a credential.
///
/// Signed URLs keep scheme, host and path; the query string (which carries
/// the signature) is dropped.
///
/// ```ignore
/// use core_runtime::logging::redact_if_sensitive;
///
/// info!(token = %redact_if_sensitive("token", token), "Retrieved token");
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    const SENSITIVE_FIELDS: &[&str] = &[
        "token",
        "secret",
        "password",
        "authorization",
        "bearer",
        "code",
        "verifier",
    ];

    let field_lower = field_name.to_lowercase();
    if SENSITIVE_FIELDS.iter().any(|&f| field_lower.contains(f)) {
        "[REDACTED]".to_string()
    } else if field_lower.contains("url") {
        match value.split_once('?') {
            Some((base, _)) => format!("{}?[REDACTED]", base),
            None => value.to_string(),
        }
    } else {
        value.to_string()
    }
}

/// Basename of `path`, for log lines about local files.
///
/// ```ignore
/// info!(file = %strip_path("/home/ann/Downloads/report.pdf"), "Saved");
/// // Logs: file="report.pdf"
/// ```
pub fn strip_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
