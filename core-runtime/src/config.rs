//! # Worker Configuration
//!
//! Settings for the two background workers and the resources they share.
//!
//! ## Overview
//!
//! [`WorkerConfig`] bundles a [`SyncWorkerConfig`] (folder synchronization)
//! and an [`AnalysisWorkerConfig`] (downstream image analysis) together with
//! the database location and event buffer size. Every setting has a default;
//! builders override individual values and [`WorkerConfig::validate`] fails
//! fast on values the workers cannot run with.
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::{SyncWorkerConfig, WorkerConfig};
//! use std::time::Duration;
//!
//! let config = WorkerConfig::builder()
//!     .database_path("/var/lib/photos/sync.db")
//!     .sync(SyncWorkerConfig::default().with_poll_interval(Duration::from_secs(10)))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.sync.max_concurrent_jobs, 2);
//! ```
//!
//! ## Environment
//!
//! [`WorkerConfig::from_env`] reads overrides from the process environment:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DATABASE_PATH` | `sync.db` | SQLite database file |
//! | `SYNC_MAX_CONCURRENT_JOBS` | `2` | Folder syncs running at once |
//! | `SYNC_POLL_INTERVAL_SECS` | `30` | Job queue poll interval |
//! | `SYNC_STALE_JOB_MINUTES` | `30` | Age after which an active job is force-failed |
//! | `ANALYSIS_POLL_INTERVAL_SECS` | `10` | Analysis poll interval |
//! | `ANALYSIS_MAX_CONCURRENT` | `3` | Items analyzed at once |
//! | `ANALYSIS_BATCH_SIZE` | `20` | Items fetched per cycle |
//! | `ANALYSIS_MAX_RETRIES` | `3` | Retries per item |
//! | `ANALYSIS_BREAKER_THRESHOLD` | `10` | Failures before the breaker opens |
//! | `ANALYSIS_BREAKER_RESET_SECS` | `60` | Cool-down before a half-open trial |

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use crate::retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Sync Worker
// ============================================================================

/// Settings for the synchronization worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWorkerConfig {
    /// Folder syncs that may run at the same time
    pub max_concurrent_jobs: usize,
    /// New items written per store round-trip
    pub insert_batch_size: usize,
    /// Items between persisted checkpoints during a full sync
    pub checkpoint_every: usize,
    /// Change entries between progress events during an incremental sync
    pub progress_broadcast_every: usize,
    /// Percentage points between progress events during a full sync
    pub progress_percent_step: u8,
    /// Job queue poll interval when no trigger arrives
    pub poll_interval: Duration,
    /// Capacity of the wake-up trigger channel
    pub trigger_buffer: usize,
    /// Pending/running jobs older than this are force-failed
    pub stale_job_threshold: Duration,
    /// Upper bound for one remote listing or diff call
    pub remote_call_timeout: Duration,
    /// Retry policy for transient remote failures
    pub retry: RetryPolicy,
    /// Parent levels walked when checking subtree membership
    pub max_parent_depth: usize,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            insert_batch_size: 100,
            checkpoint_every: 100,
            progress_broadcast_every: 50,
            progress_percent_step: 5,
            poll_interval: Duration::from_secs(30),
            trigger_buffer: 10,
            stale_job_threshold: Duration::from_secs(30 * 60),
            remote_call_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            max_parent_depth: 20,
        }
    }
}

impl SyncWorkerConfig {
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_insert_batch_size(mut self, size: usize) -> Self {
        self.insert_batch_size = size;
        self
    }

    pub fn with_checkpoint_every(mut self, items: usize) -> Self {
        self.checkpoint_every = items;
        self
    }

    pub fn with_progress_broadcast_every(mut self, entries: usize) -> Self {
        self.progress_broadcast_every = entries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_job_threshold(mut self, threshold: Duration) -> Self {
        self.stale_job_threshold = threshold;
        self
    }

    pub fn with_remote_call_timeout(mut self, timeout: Duration) -> Self {
        self.remote_call_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the sync worker settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(Error::Config(
                "Sync max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.insert_batch_size == 0 || self.checkpoint_every == 0 {
            return Err(Error::Config(
                "Sync insert_batch_size and checkpoint_every must be at least 1".to_string(),
            ));
        }
        if self.progress_broadcast_every == 0 {
            return Err(Error::Config(
                "Sync progress_broadcast_every must be at least 1".to_string(),
            ));
        }
        if self.progress_percent_step == 0 || self.progress_percent_step > 100 {
            return Err(Error::Config(
                "Sync progress_percent_step must be between 1 and 100".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "Sync poll interval must be greater than zero".to_string(),
            ));
        }
        if self.trigger_buffer == 0 {
            return Err(Error::Config(
                "Sync trigger buffer must hold at least one signal".to_string(),
            ));
        }
        if self.remote_call_timeout.is_zero() {
            return Err(Error::Config(
                "Sync remote call timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Analysis Worker
// ============================================================================

/// Settings for the analysis worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisWorkerConfig {
    pub poll_interval: Duration,
    /// Pending items fetched per cycle
    pub batch_size: u32,
    /// Items analyzed concurrently
    pub max_concurrent: usize,
    /// Per-item retry policy
    pub retry: RetryPolicy,
    /// Consecutive failures that open the circuit breaker
    pub breaker_threshold: u32,
    /// Time since the last failure before a half-open trial is admitted
    pub breaker_reset_timeout: Duration,
    /// Longest edge of the reduced-resolution download
    pub thumbnail_size: u32,
    pub remote_call_timeout: Duration,
    /// Items left in `processing` longer than this are returned to `pending` at startup
    pub stuck_processing_after: Duration,
}

impl Default for AnalysisWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 20,
            max_concurrent: 3,
            retry: RetryPolicy::new(3, Duration::from_secs(2)),
            breaker_threshold: 10,
            breaker_reset_timeout: Duration::from_secs(60),
            thumbnail_size: 1024,
            remote_call_timeout: Duration::from_secs(60),
            stuck_processing_after: Duration::from_secs(15 * 60),
        }
    }
}

impl AnalysisWorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, reset_timeout: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_reset_timeout = reset_timeout;
        self
    }

    pub fn with_thumbnail_size(mut self, size: u32) -> Self {
        self.thumbnail_size = size;
        self
    }

    /// Validates the analysis worker settings.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "Analysis poll interval must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config(
                "Analysis batch size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Config(
                "Analysis max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.breaker_threshold == 0 {
            return Err(Error::Config(
                "Circuit breaker threshold must be at least 1".to_string(),
            ));
        }
        if self.thumbnail_size == 0 {
            return Err(Error::Config(
                "Thumbnail size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Complete configuration for the worker service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,
    /// Per-subscriber event buffer
    pub event_buffer_size: usize,
    pub sync: SyncWorkerConfig,
    pub analysis: AnalysisWorkerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sync.db"),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            sync: SyncWorkerConfig::default(),
            analysis: AnalysisWorkerConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// Load overrides from the process environment.
    ///
    /// Unset variables keep their defaults; unparsable ones are reported as
    /// [`Error::Config`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "SYNC_MAX_CONCURRENT_JOBS")? {
            config.sync.max_concurrent_jobs = max;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SYNC_POLL_INTERVAL_SECS")? {
            config.sync.poll_interval = Duration::from_secs(secs);
        }
        if let Some(minutes) = parse_var::<u64, _>(&lookup, "SYNC_STALE_JOB_MINUTES")? {
            config.sync.stale_job_threshold = Duration::from_secs(minutes * 60);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ANALYSIS_POLL_INTERVAL_SECS")? {
            config.analysis.poll_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "ANALYSIS_MAX_CONCURRENT")? {
            config.analysis.max_concurrent = max;
        }
        if let Some(size) = parse_var::<u32, _>(&lookup, "ANALYSIS_BATCH_SIZE")? {
            config.analysis.batch_size = size;
        }
        if let Some(retries) = parse_var::<u32, _>(&lookup, "ANALYSIS_MAX_RETRIES")? {
            config.analysis.retry.max_retries = retries;
        }
        if let Some(threshold) = parse_var::<u32, _>(&lookup, "ANALYSIS_BREAKER_THRESHOLD")? {
            config.analysis.breaker_threshold = threshold;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ANALYSIS_BREAKER_RESET_SECS")? {
            config.analysis.breaker_reset_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the whole bundle.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }
        self.sync.validate()?;
        self.analysis.validate()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", key, raw))),
    }
}

/// Builder for [`WorkerConfig`].
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    database_path: Option<PathBuf>,
    event_buffer_size: Option<usize>,
    sync: Option<SyncWorkerConfig>,
    analysis: Option<AnalysisWorkerConfig>,
}

impl WorkerConfigBuilder {
    pub fn database_path(mut self, path: impl AsRef<Path>) -> Self {
        self.database_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn sync(mut self, sync: SyncWorkerConfig) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn analysis(mut self, analysis: AnalysisWorkerConfig) -> Self {
        self.analysis = Some(analysis);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<WorkerConfig> {
        let defaults = WorkerConfig::default();
        let config = WorkerConfig {
            database_path: self.database_path.unwrap_or(defaults.database_path),
            event_buffer_size: self.event_buffer_size.unwrap_or(defaults.event_buffer_size),
            sync: self.sync.unwrap_or(defaults.sync),
            analysis: self.analysis.unwrap_or(defaults.analysis),
        };
        config.validate()?;
        Ok(config)
    }
}
