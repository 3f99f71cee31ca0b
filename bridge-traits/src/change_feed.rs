//! Remote File Store Abstractions
//!
//! The change-feed file service the synchronization core keeps a local store
//! consistent with. Implementations wrap a concrete cloud API (listing,
//! change diffs, downloads); the core only relies on the semantics below.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// MIME type the remote store uses for folder entries.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Credentials stored with a synced folder and presented on every remote call.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FolderCredentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }

    /// A folder without a refresh token can never authenticate again.
    pub fn is_usable(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

impl fmt::Debug for FolderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A folder entry returned by recursive folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
    /// First parent; `None` for a top-level folder.
    pub parent_id: Option<String>,
}

/// A file (or folder) entry as reported by listings and the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    /// First parent; `None` when the entry is detached.
    pub parent_id: Option<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub thumbnail_url: Option<String>,
    pub web_view_url: Option<String>,
    pub trashed: bool,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// One entry of a change diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Identity of the changed entry; present even when `file` is not.
    pub file_id: String,
    /// The entry was removed or is no longer visible to the caller.
    pub removed: bool,
    pub file: Option<RemoteFile>,
}

/// Raw image bytes with their content type.
#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub bytes: Bytes,
    pub mime_type: String,
}

/// Remote change-feed file service.
///
/// Every method may fail with [`BridgeError::CredentialsInvalid`](crate::BridgeError)
/// (or another error for which `is_credential_error()` holds) when the folder's
/// stored credentials have expired or been revoked. `get_changes` fails with
/// [`BridgeError::InvalidCursor`](crate::BridgeError) when the token is no
/// longer accepted.
#[async_trait]
pub trait ChangeFeedClient: Send + Sync {
    /// List every folder below `root_id`, including the root itself.
    async fn list_folders_recursive(
        &self,
        credentials: &FolderCredentials,
        root_id: &str,
    ) -> Result<Vec<RemoteFolder>>;

    /// List every image file below `root_id`, in stable listing order.
    async fn list_images_recursive(
        &self,
        credentials: &FolderCredentials,
        root_id: &str,
    ) -> Result<Vec<RemoteFile>>;

    /// Changes since `token`, plus the token to use next time.
    async fn get_changes(
        &self,
        credentials: &FolderCredentials,
        token: &str,
    ) -> Result<(Vec<ChangeEntry>, String)>;

    /// A token representing "now", for future incremental diffs.
    async fn get_start_token(&self, credentials: &FolderCredentials) -> Result<String>;

    /// Slash-separated display path of a folder.
    async fn resolve_folder_path(
        &self,
        credentials: &FolderCredentials,
        folder_id: &str,
    ) -> Result<String>;

    /// Parent identities of an entry (empty for a top-level entry).
    async fn get_parent_ids(
        &self,
        credentials: &FolderCredentials,
        entry_id: &str,
    ) -> Result<Vec<String>>;

    /// Download a reduced-resolution rendition of an image.
    async fn download_thumbnail(
        &self,
        credentials: &FolderCredentials,
        file_id: &str,
        size: u32,
    ) -> Result<DownloadedImage>;

    /// Download the original file content.
    async fn download_file(
        &self,
        credentials: &FolderCredentials,
        file_id: &str,
    ) -> Result<DownloadedImage>;
}
