//! # Host Bridge Traits
//!
//! Contracts between the synchronization core and the outside world.
//!
//! ## Overview
//!
//! This crate defines the collaborators the core depends on but does not
//! implement: the remote change-feed file service, the remote detection
//! service, and host utilities for time and logging. Concrete adapters live
//! with the host application; tests provide in-memory fakes.
//!
//! ## Traits
//!
//! ### Remote Services
//! - [`ChangeFeedClient`](change_feed::ChangeFeedClient) - Recursive listings, change diffs, downloads
//! - [`DetectionClient`](detection::DetectionClient) - Liveness probe and face extraction
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Adapters
//! should map their failures onto the most specific variant so the core can
//! classify them:
//!
//! - credential failures (`is_credential_error`) are fatal and never retried
//! - transient failures (`is_retryable`) are retried with backoff
//! - cursor rejection (`is_invalid_cursor`) triggers a full resynchronization
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod change_feed;
pub mod detection;
pub mod error;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use change_feed::{
    ChangeEntry, ChangeFeedClient, DownloadedImage, FolderCredentials, RemoteFile, RemoteFolder,
    FOLDER_MIME_TYPE,
};
pub use detection::{BoundingBox, DetectedFace, DetectionClient, ExtractionResult, HealthStatus};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
