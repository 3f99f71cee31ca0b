//! # Sync Job State Machine
//!
//! Manages the lifecycle of folder sync jobs with validated state transitions.
//!
//! ## Overview
//!
//! A [`SyncJob`] is one unit of synchronization work for one synced folder.
//! Jobs are persisted by the [`SyncJobRepository`](crate::SyncJobRepository),
//! claimed by the orchestrator, and never deleted: finished jobs form the
//! folder's sync history.
//!
//! ## State Machine
//!
//! ```text
//! Pending → Running → Completed
//!    ↑   ↓     ↓ ↓
//!    │   │     │ └──→ Failed
//!    │   │     └────→ Cancelled
//!    └───┴─ requeue (Running → Pending after an interrupted run)
//! ```
//!
//! ## Metadata
//!
//! Resumption state lives in [`SyncJobMetadata`], stored as JSON:
//!
//! ```json
//! {
//!   "page_token": "<remote change cursor>",
//!   "current_folder": "<remote folder id>",
//!   "processed_files": 120,
//!   "last_processed_id": "<remote file id>",
//!   "is_incremental": false,
//!   "shared_folder_id": "<uuid>"
//! }
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_sync::{JobKind, SyncJob, SyncStatus};
//! use core_runtime::events::SyncCounts;
//!
//! let job = SyncJob::new("folder-1", JobKind::Manual, 1_700_000_000);
//! let job = job.start(1_700_000_001).unwrap();
//! let job = job.complete(SyncCounts::default(), 1_700_000_010).unwrap();
//! assert_eq!(job.status, SyncStatus::Completed);
//! ```

use crate::{Result, SyncError};
use core_runtime::events::SyncCounts;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncJobId(Uuid);

impl SyncJobId {
    /// Create a new random sync job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a sync job ID from a string
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidJobId(e.to_string()))?,
        ))
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// The current status of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    /// Check if this status represents a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    /// Check if this status represents an active state
    pub fn is_active(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Running)
    }

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What caused a job to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// First sync after a folder is added
    Initial,
    /// User asked to sync now
    Manual,
    /// Remote push notification
    Webhook,
    /// Periodic resync
    Scheduled,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initial => "initial",
            JobKind::Manual => "manual",
            JobKind::Webhook => "webhook",
            JobKind::Scheduled => "scheduled",
        }
    }
}

impl FromStr for JobKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "initial" => Ok(JobKind::Initial),
            "manual" => Ok(JobKind::Manual),
            "webhook" => Ok(JobKind::Webhook),
            "scheduled" => Ok(JobKind::Scheduled),
            _ => Err(SyncError::InvalidJobKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Resumption state and folder reference carried by a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobMetadata {
    /// Change cursor the incremental run started from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    /// Remote root folder being synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_folder: Option<String>,
    /// Items processed when the last checkpoint was written
    #[serde(default)]
    pub processed_files: u64,
    /// Last remote file handled before the checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_id: Option<String>,
    #[serde(default)]
    pub is_incremental: bool,
    /// Synced folder the job belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_folder_id: Option<String>,
}

impl SyncJobMetadata {
    pub fn for_folder(folder_id: impl Into<String>) -> Self {
        Self {
            shared_folder_id: Some(folder_id.into()),
            ..Self::default()
        }
    }

    /// Parse the stored JSON form.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| SyncError::InvalidMetadata(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidMetadata(e.to_string()))
    }

    /// Record the position reached by a full listing.
    pub fn checkpoint(&mut self, last_processed_id: impl Into<String>, processed: u64) {
        self.last_processed_id = Some(last_processed_id.into());
        self.processed_files = processed;
    }

    /// Forget any position from an earlier run.
    pub fn clear_checkpoint(&mut self) {
        self.last_processed_id = None;
        self.processed_files = 0;
    }
}

// ============================================================================
// Sync Job Entity
// ============================================================================

/// A sync job with state machine semantics.
///
/// Transitions consume the job and return the next state, so a job that
/// failed validation is never left half-updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: SyncJobId,
    /// Mirror of `metadata.shared_folder_id` for queries
    pub folder_id: Option<String>,
    pub kind: JobKind,
    pub status: SyncStatus,
    /// Total/processed/failed and new/updated/deleted counters
    pub counts: SyncCounts,
    pub metadata: SyncJobMetadata,
    pub error_message: Option<String>,
    /// Unix seconds
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Last time a worker touched the job; drives staleness
    pub updated_at: i64,
}

impl SyncJob {
    /// Create a pending job for a synced folder.
    pub fn new(folder_id: impl Into<String>, kind: JobKind, now: i64) -> Self {
        let folder_id = folder_id.into();
        Self {
            id: SyncJobId::new(),
            folder_id: Some(folder_id.clone()),
            kind,
            status: SyncStatus::Pending,
            counts: SyncCounts::default(),
            metadata: SyncJobMetadata::for_folder(folder_id),
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// The synced folder this job works on.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::MissingFolderReference`] when the metadata carries
    /// no folder. Such a job can never run.
    pub fn folder_reference(&self) -> Result<&str> {
        self.metadata
            .shared_folder_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| SyncError::MissingFolderReference {
                job_id: self.id.to_string(),
            })
    }

    /// Move to `Running`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job is not in `Pending` state
    pub fn start(mut self, now: i64) -> Result<Self> {
        self.validate_transition(SyncStatus::Running)?;
        self.status = SyncStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(self)
    }

    /// Mark the job as completed with its final counters.
    pub fn complete(mut self, counts: SyncCounts, now: i64) -> Result<Self> {
        self.validate_transition(SyncStatus::Completed)?;
        self.status = SyncStatus::Completed;
        self.counts = counts;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(self)
    }

    /// Mark the job as failed with an error message.
    pub fn fail(mut self, error_message: impl Into<String>, now: i64) -> Result<Self> {
        self.validate_transition(SyncStatus::Failed)?;
        self.status = SyncStatus::Failed;
        self.error_message = Some(error_message.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(self)
    }

    pub fn cancel(mut self, now: i64) -> Result<Self> {
        self.validate_transition(SyncStatus::Cancelled)?;
        self.status = SyncStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(self)
    }

    /// Hand an interrupted job back to the queue. The checkpoint in
    /// `metadata` is kept so the next run resumes from it.
    pub fn requeue(mut self, now: i64) -> Result<Self> {
        self.validate_transition(SyncStatus::Pending)?;
        self.status = SyncStatus::Pending;
        self.updated_at = now;
        Ok(self)
    }

    /// Active and untouched for at least `threshold_secs`.
    pub fn is_stale(&self, now: i64, threshold_secs: i64) -> bool {
        self.status.is_active() && now - self.updated_at >= threshold_secs
    }

    /// Seconds between start and completion
    pub fn duration_secs(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start) as u64),
            _ => None,
        }
    }

    fn validate_transition(&self, to: SyncStatus) -> Result<()> {
        let valid = match (self.status, to) {
            // From Pending
            (SyncStatus::Pending, SyncStatus::Running) => true,
            (SyncStatus::Pending, SyncStatus::Cancelled) => true,
            (SyncStatus::Pending, SyncStatus::Failed) => true,

            // From Running
            (SyncStatus::Running, SyncStatus::Completed) => true,
            (SyncStatus::Running, SyncStatus::Failed) => true,
            (SyncStatus::Running, SyncStatus::Cancelled) => true,
            (SyncStatus::Running, SyncStatus::Pending) => true,

            // Terminal states cannot transition
            _ => false,
        };

        if !valid {
            return Err(SyncError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition from {} to {}",
                    self.status.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
