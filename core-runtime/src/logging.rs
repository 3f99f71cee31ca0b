//! # Logging & Tracing Infrastructure
//!
//! The workers never own a logger. They emit `tracing` events with structured
//! fields (`job_id`, `folder_id`, `item_id`, ...), and whoever hosts them
//! decides where those events go by calling [`init_logging`] once at startup.
//!
//! - Output to stdout as pretty, compact or JSON lines
//! - Workspace crates follow the configured level; dependencies stay at `warn`
//! - Credential-bearing fields are redacted before they reach a [`LoggerSink`]
//!
//! When a sink is configured every event that survives filtering is mirrored
//! to it as a [`LogEntry`]. Tests install their own subscriber instead.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::logging::{init_logging, LoggingConfig};
//!
//! init_logging(LoggingConfig::from_env()?)?;
//! tracing::info!(folder_id = "f-1", "Worker started");
//! ```
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOG_FORMAT` | `pretty` (debug builds), `json` | `pretty`, `compact` or `json` |
//! | `LOG_LEVEL` | `info` | Level for workspace crates |
//! | `LOG_FILTER` | unset | Full `EnvFilter` directive, replaces the level-derived one |

use crate::error::{Error, Result};

use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Crates whose events follow the configured level.
const WORKSPACE_CRATES: &[&str] = &[
    "bridge_traits",
    "core_runtime",
    "core_library",
    "core_sync",
    "core_analysis",
    "core_service",
];

const SENSITIVE_FIELDS: &[&str] = &[
    "token",
    "password",
    "secret",
    "api_key",
    "authorization",
    "bearer",
    "credentials",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    /// One JSON object per line, fields flattened
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("Unknown log format: {}", other))),
        }
    }
}

fn parse_level(s: &str) -> Result<LogLevel> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        other => Err(Error::Config(format!("Unknown log level: {}", other))),
    }
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Replace credential-bearing field values before they reach the sink
    pub redact_secrets: bool,
    /// Full filter directive; overrides `level`
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Log span enter/exit (pretty) or the span list (JSON)
    pub enable_spans: bool,
}

impl fmt::Debug for LoggingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingConfig")
            .field("format", &self.format)
            .field("level", &self.level)
            .field("redact_secrets", &self.redact_secrets)
            .field("filter", &self.filter)
            .field("logger_sink", &self.logger_sink.is_some())
            .field("enable_spans", &self.enable_spans)
            .finish()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            redact_secrets: true,
            filter: None,
            logger_sink: None,
            enable_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(format) = lookup("LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.level = parse_level(&level)?;
        }
        config.filter = lookup("LOG_FILTER").filter(|f| !f.trim().is_empty());
        Ok(config)
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_redaction(mut self, redact: bool) -> Self {
        self.redact_secrets = redact;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Mirror events to a host logging pipeline.
    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.enable_spans = enable;
        self
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let directives = match &self.filter {
            Some(custom) => custom.clone(),
            None => {
                let level = level_directive(self.level);
                std::iter::once("warn".to_string())
                    .chain(WORKSPACE_CRATES.iter().map(|c| format!("{}={}", c, level)))
                    .collect::<Vec<_>>()
                    .join(",")
            }
        };

        EnvFilter::try_new(&directives)
            .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
    }

    fn output_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = tracing_subscriber::fmt::layer().with_writer(io::stdout);
        match self.format {
            LogFormat::Pretty => base
                .pretty()
                .with_span_events(if self.enable_spans {
                    FmtSpan::ACTIVE
                } else {
                    FmtSpan::NONE
                })
                .boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Json => base
                .json()
                .flatten_event(true)
                .with_current_span(self.enable_spans)
                .with_span_list(self.enable_spans)
                .boxed(),
        }
    }
}

/// Install the global subscriber. Only the first call in a process succeeds.
///
/// # Errors
///
/// Returns [`Error::Config`] for an invalid filter or when a global
/// subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;

    tracing_subscriber::registry()
        .with(config.output_layer())
        .with(SinkLayer::new(config.logger_sink.clone(), config.redact_secrets))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

// ============================================================================
// Host sink forwarding
// ============================================================================

struct SinkLayer {
    sink: Option<Arc<dyn LoggerSink>>,
    redact: bool,
}

impl SinkLayer {
    fn new(sink: Option<Arc<dyn LoggerSink>>, redact: bool) -> Self {
        Self { sink, redact }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let metadata = event.metadata();
        let level = match *metadata.level() {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        };
        if level < sink.min_level() {
            return;
        }

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let message = fields
            .message
            .unwrap_or_else(|| metadata.name().to_string());
        let mut entry = LogEntry::new(level, metadata.target(), message);
        for (key, value) in fields.values {
            let value = if self.redact {
                redact_if_sensitive(&key, &value)
            } else {
                value
            };
            entry = entry.with_field(key, value);
        }
        entry.span_id = ctx.lookup_current().map(|span| span.name().to_string());

        let sink = Arc::clone(sink);
        // Never block a runtime worker on the host sink
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = sink.log(entry).await {
                        eprintln!("LoggerSink error: {}", err);
                    }
                });
            }
            Err(_) => {
                if let Err(err) = futures::executor::block_on(sink.log(entry)) {
                    eprintln!("LoggerSink error: {}", err);
                }
            }
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl FieldCollector {
    fn record_value(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_value(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, format!("{:?}", value));
    }
}

// ============================================================================
// Field helpers
// ============================================================================

/// Redact a field value when its name suggests a credential, and mask
/// anything that looks like an email address.
///
/// ```
/// use core_runtime::logging::redact_if_sensitive;
///
/// assert_eq!(redact_if_sensitive("access_token", "ya29.abc"), "[REDACTED]");
/// assert_eq!(redact_if_sensitive("folder_id", "1AbC"), "1AbC");
/// ```
pub fn redact_if_sensitive(field_name: &str, value: &str) -> String {
    let field = field_name.to_ascii_lowercase();
    if SENSITIVE_FIELDS.iter().any(|s| field.contains(s)) {
        return "[REDACTED]".to_string();
    }

    match value.split_once('@') {
        Some((local, domain)) if domain.contains('.') => {
            let first: String = local.chars().take(1).collect();
            format!("{}***@[REDACTED]", first)
        }
        _ => value.to_string(),
    }
}

/// Shorten an opaque cursor or token for log output.
///
/// ```
/// use core_runtime::logging::truncate_token;
///
/// assert_eq!(truncate_token("1234567890abcdef"), "12345678…");
/// assert_eq!(truncate_token("42"), "42");
/// ```
pub fn truncate_token(token: &str) -> String {
    const VISIBLE: usize = 8;

    match token.char_indices().nth(VISIBLE) {
        Some((cut, _)) => format!("{}…", &token[..cut]),
        None => token.to_string(),
    }
}

/// Strip a remote path down to its last segment.
///
/// Folder paths are user content; log the leaf only.
pub fn strip_path(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as SinkResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LoggerSink for RecordingSink {
        async fn log(&self, entry: LogEntry) -> SinkResult<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        fn min_level(&self) -> LogLevel {
            LogLevel::Trace
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_from_lookup() {
        let config = LoggingConfig::from_lookup(env(&[
            ("LOG_FORMAT", "JSON"),
            ("LOG_LEVEL", "debug"),
            ("LOG_FILTER", "core_sync=trace"),
        ]))
        .unwrap();

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.filter.as_deref(), Some("core_sync=trace"));
        assert!(config.redact_secrets);
    }

    #[test]
    fn test_config_rejects_unknown_values() {
        assert!(LoggingConfig::from_lookup(env(&[("LOG_FORMAT", "xml")])).is_err());
        assert!(LoggingConfig::from_lookup(env(&[("LOG_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn test_default_filter_covers_workspace_crates() {
        let config = LoggingConfig::default().with_level(LogLevel::Debug);
        let filter = config.env_filter().unwrap().to_string();

        assert!(filter.contains("core_sync=debug"));
        assert!(filter.contains("core_analysis=debug"));
        assert!(!filter.contains("sqlx=debug"));
    }

    #[test]
    fn test_custom_filter_replaces_level() {
        let config = LoggingConfig::default().with_filter("core_sync=trace");
        let filter = config.env_filter().unwrap().to_string();
        assert!(filter.contains("core_sync=trace"));
        assert!(!filter.contains("core_analysis"));
    }

    #[test]
    fn test_redact_if_sensitive() {
        assert_eq!(redact_if_sensitive("change_token", "abc"), "[REDACTED]");
        assert_eq!(redact_if_sensitive("Authorization", "Bearer x"), "[REDACTED]");
        assert_eq!(redact_if_sensitive("owner", "bob@example.com"), "b***@[REDACTED]");
        assert_eq!(redact_if_sensitive("name", "team@home"), "team@home");
        assert_eq!(redact_if_sensitive("item_id", "12345"), "12345");
    }

    #[test]
    fn test_truncate_token() {
        assert_eq!(truncate_token(""), "");
        assert_eq!(truncate_token("12345678"), "12345678");
        assert_eq!(truncate_token("123456789"), "12345678…");
    }

    #[test]
    fn test_strip_path() {
        assert_eq!(strip_path("Photos/2024/Summer"), "Summer");
        assert_eq!(strip_path("Photos"), "Photos");
        assert_eq!(strip_path("Photos/"), "");
    }

    #[test]
    fn test_sink_receives_events_with_fields() {
        let sink = Arc::new(RecordingSink::default());
        let layer = SinkLayer::new(Some(sink.clone() as Arc<dyn LoggerSink>), false);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        tracing::info!(target: "core_sync", folder_id = "f-1", added = 3, "sync started");

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, "core_sync");
        assert_eq!(entries[0].message, "sync started");
        assert_eq!(entries[0].fields.get("folder_id").map(String::as_str), Some("f-1"));
        assert_eq!(entries[0].fields.get("added").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_sink_redacts_tokens() {
        let sink = Arc::new(RecordingSink::default());
        let layer = SinkLayer::new(Some(sink.clone() as Arc<dyn LoggerSink>), true);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        tracing::warn!(change_token = "cursor-99", "token rejected");

        let entries = sink.entries.lock().unwrap();
        assert_eq!(
            entries[0].fields.get("change_token").map(String::as_str),
            Some("[REDACTED]")
        );
    }
}
