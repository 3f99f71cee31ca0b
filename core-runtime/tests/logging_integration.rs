//! Integration tests for the logging helpers and the sink pipeline

use async_trait::async_trait;
use bridge_traits::error::Result as SinkResult;
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_runtime::logging::{redact_if_sensitive, strip_path, LogFormat, LoggingConfig};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CollectingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for CollectingSink {
    async fn log(&self, entry: LogEntry) -> SinkResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

#[test]
fn test_logging_configuration() {
    // Logging can only be initialized once per process, so only the builder is exercised
    let sink: Arc<dyn LoggerSink> = Arc::new(CollectingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Debug)
        .with_logger_sink(sink)
        .with_spans(false);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(config.redact_secrets);
    assert!(config.logger_sink.is_some());
    assert!(!config.enable_spans);
}

#[test]
fn test_credential_fields_are_redacted() {
    assert_eq!(redact_if_sensitive("access_token", "ya29.a0"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("refresh_token", "1//0g"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("page_token", "12345"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("credentials", "{..}"), "[REDACTED]");
}

#[test]
fn test_identifiers_pass_through() {
    assert_eq!(redact_if_sensitive("folder_id", "1AbCdEf"), "1AbCdEf");
    assert_eq!(redact_if_sensitive("job_id", "job-42"), "job-42");
    assert_eq!(redact_if_sensitive("status", "completed"), "completed");
}

#[test]
fn test_email_values_are_masked() {
    let redacted = redact_if_sensitive("owner", "alice@example.com");
    assert!(redacted.starts_with('a'));
    assert!(!redacted.contains("example.com"));
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("Shared/Family/2023"), "2023");
    assert_eq!(strip_path("C:\\photos\\img.jpg"), "img.jpg");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_format_selection() {
    #[cfg(debug_assertions)]
    assert_eq!(LoggingConfig::default().format, LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(LoggingConfig::default().format, LogFormat::Json);
}
