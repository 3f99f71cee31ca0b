//! # Sync Module
//!
//! Keeps each synced folder's item store consistent with its remote folder.
//!
//! ## Overview
//!
//! This module manages the lifecycle of sync jobs, including:
//! - Queueing and claiming jobs with per-folder deduplication
//! - Full sync from a complete remote listing, resumable from a checkpoint
//! - Incremental sync from the remote change feed
//! - Sub-folder path maintenance for renames and moves
//! - Progress, completion and failure notifications
//!
//! ## Components
//!
//! - **Sync Job State Machine** (`job`): Job lifecycle with validated state transitions
//! - **Repository** (`repository`): Persistence and atomic claiming of sync jobs
//! - **Trigger** (`trigger`): Coalescing wake-up signal for the worker loop
//! - **Paths** (`paths`): Folder path maps and subtree membership checks
//! - **Sync Orchestrator** (`coordinator`): Worker loop running full and incremental syncs

mod context;
pub mod coordinator;
pub mod error;
mod full_sync;
mod incremental_sync;
pub mod job;
pub mod paths;
pub mod repository;
pub mod trigger;

pub use coordinator::{SyncOrchestrator, SyncStats};
pub use error::{Result, SyncError};
pub use job::{JobKind, SyncJob, SyncJobId, SyncJobMetadata, SyncStatus};
pub use repository::{SqliteSyncJobRepository, SyncJobRepository};
pub use trigger::{trigger_channel, SyncTrigger, TriggerReceiver};
