//! Domain models for the synced photo library
//!
//! Rich domain models with validation and the conversions between remote
//! listings and stored rows.

use bridge_traits::change_feed::{FolderCredentials, RemoteFile};
use bridge_traits::detection::{BoundingBox, DetectedFace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// =============================================================================
// Status Types
// =============================================================================

/// Sync state of a folder as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderSyncStatus {
    Idle,
    Syncing,
    Error,
}

impl FolderSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderSyncStatus::Idle => "idle",
            FolderSyncStatus::Syncing => "syncing",
            FolderSyncStatus::Error => "error",
        }
    }
}

impl FromStr for FolderSyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(FolderSyncStatus::Idle),
            "syncing" => Ok(FolderSyncStatus::Syncing),
            "error" => Ok(FolderSyncStatus::Error),
            other => Err(format!("unknown folder sync status '{}'", other)),
        }
    }
}

impl fmt::Display for FolderSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the downstream analysis for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Processing => "processing",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "processing" => Ok(AnalysisStatus::Processing),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(format!("unknown analysis status '{}'", other)),
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Domain Models
// =============================================================================

/// One remote folder kept in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedFolder {
    /// Unique identifier
    pub id: String,
    /// Identity of the folder in the remote store
    pub remote_folder_id: String,
    /// Display name, also the first segment of every item path
    pub name: String,
    /// Credentials used for every remote call made for this folder
    #[serde(skip_serializing, default)]
    pub credentials: FolderCredentials,
    /// Cursor for incremental diffs; empty until a full sync completes
    pub change_token: String,
    pub sync_status: FolderSyncStatus,
    /// Unix seconds of the last completed sync
    pub last_synced_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncedFolder {
    pub fn new(
        remote_folder_id: impl Into<String>,
        name: impl Into<String>,
        credentials: FolderCredentials,
        now: i64,
    ) -> Self {
        Self {
            id: new_id(),
            remote_folder_id: remote_folder_id.into(),
            name: name.into(),
            credentials,
            change_token: String::new(),
            sync_status: FolderSyncStatus::Idle,
            last_synced_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// No completed sync or no cursor means the next sync must be a full listing.
    pub fn needs_full_sync(&self) -> bool {
        self.last_synced_at.is_none() || self.change_token.is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.remote_folder_id.trim().is_empty() {
            return Err("Remote folder id cannot be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("Folder name cannot be empty".to_string());
        }
        if self.created_at < 0 || self.updated_at < self.created_at {
            return Err("Folder timestamps are inconsistent".to_string());
        }
        Ok(())
    }
}

/// One file ingested from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedItem {
    pub id: String,
    /// Owning synced folder
    pub folder_id: String,
    /// Identity of the file in the remote store, unique per folder
    pub remote_id: String,
    /// Remote parent folder of the file
    pub remote_folder_id: Option<String>,
    /// Path of the parent folder, rooted at the synced folder's name
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    /// Unix milliseconds
    pub remote_created_at: Option<i64>,
    /// Unix milliseconds
    pub remote_modified_at: Option<i64>,
    pub thumbnail_url: Option<String>,
    pub web_view_url: Option<String>,
    pub analysis_status: AnalysisStatus,
    pub result_count: i64,
    pub analysis_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncedItem {
    /// Build a new item, awaiting analysis, from a remote listing entry.
    pub fn from_remote(folder_id: &str, file: &RemoteFile, path: impl Into<String>, now: i64) -> Self {
        Self {
            id: new_id(),
            folder_id: folder_id.to_string(),
            remote_id: file.id.clone(),
            remote_folder_id: file.parent_id.clone(),
            path: path.into(),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size,
            remote_created_at: file.created_time.map(|t| t.timestamp_millis()),
            remote_modified_at: file.modified_time.map(|t| t.timestamp_millis()),
            thumbnail_url: file.thumbnail_url.clone(),
            web_view_url: file.web_view_url.clone(),
            analysis_status: AnalysisStatus::Pending,
            result_count: 0,
            analysis_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a fresh remote listing entry differs from the stored item:
    /// newer modification time, a different parent folder, or a different path.
    pub fn needs_update(&self, file: &RemoteFile, path: &str) -> bool {
        let modified = file.modified_time.map(|t| t.timestamp_millis());
        let newer = match (modified, self.remote_modified_at) {
            (Some(remote), Some(stored)) => remote > stored,
            (Some(_), None) => true,
            _ => false,
        };
        newer || self.remote_folder_id != file.parent_id || self.path != path
    }

    /// Copy the remote metadata onto the stored item. Analysis state is kept.
    pub fn apply_remote(&mut self, file: &RemoteFile, path: impl Into<String>, now: i64) {
        self.remote_folder_id = file.parent_id.clone();
        self.path = path.into();
        self.name = file.name.clone();
        self.mime_type = file.mime_type.clone();
        self.size = file.size;
        if let Some(created) = file.created_time {
            self.remote_created_at = Some(created.timestamp_millis());
        }
        if let Some(modified) = file.modified_time {
            self.remote_modified_at = Some(modified.timestamp_millis());
        }
        self.thumbnail_url = file.thumbnail_url.clone();
        self.web_view_url = file.web_view_url.clone();
        self.updated_at = now;
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.remote_id.trim().is_empty() {
            return Err("Remote file id cannot be empty".to_string());
        }
        if self.folder_id.trim().is_empty() {
            return Err("Item must belong to a folder".to_string());
        }
        if self.size < 0 {
            return Err("Item size cannot be negative".to_string());
        }
        if self.result_count < 0 {
            return Err("Result count cannot be negative".to_string());
        }
        Ok(())
    }
}

/// One face detected in a synced item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: String,
    pub item_id: String,
    pub folder_id: String,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub embedding: Vec<f32>,
    /// Grouping label assigned by clustering, if any
    pub person_id: Option<String>,
    pub created_at: i64,
}

impl AnalysisResult {
    pub fn from_detection(item: &SyncedItem, face: &DetectedFace, now: i64) -> Self {
        Self {
            id: new_id(),
            item_id: item.id.clone(),
            folder_id: item.folder_id.clone(),
            bbox: face.bbox,
            confidence: face.confidence,
            embedding: face.embedding.clone(),
            person_id: None,
            created_at: now,
        }
    }

    pub fn embedding_bytes(&self) -> Vec<u8> {
        encode_embedding(&self.embedding)
    }
}

/// Little-endian f32 encoding used for the `embedding` column.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!("embedding blob has {} bytes, not a multiple of 4", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl AnalysisCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
