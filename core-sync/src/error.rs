use bridge_traits::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Sync job {job_id} does not reference a folder")]
    MissingFolderReference { job_id: String },

    #[error("Synced folder {folder_id} not found")]
    FolderNotFound { folder_id: String },

    #[error("Credentials expired for folder {folder_id}: {message}")]
    CredentialsExpired { folder_id: String, message: String },

    #[error("Invalid job metadata: {0}")]
    InvalidMetadata(String),

    #[error("Remote error: {0}")]
    Remote(#[from] BridgeError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Sync orchestrator is already running")]
    AlreadyRunning,

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Invalid sync status: {0}")]
    InvalidStatus(String),

    #[error("Invalid job kind: {0}")]
    InvalidJobKind(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Configuration and credential failures cannot succeed on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::MissingFolderReference { .. }
                | SyncError::CredentialsExpired { .. }
                | SyncError::InvalidMetadata(_)
                | SyncError::FolderNotFound { .. }
        )
    }

    /// Convert a remote failure, lifting credential rejections into
    /// [`SyncError::CredentialsExpired`] for `folder_id`.
    pub fn from_remote(error: BridgeError, folder_id: &str) -> Self {
        if error.is_credential_error() {
            SyncError::CredentialsExpired {
                folder_id: folder_id.to_string(),
                message: error.to_string(),
            }
        } else {
            SyncError::Remote(error)
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_failures_become_fatal() {
        let err = SyncError::from_remote(
            BridgeError::CredentialsInvalid("invalid_grant".to_string()),
            "folder-1",
        );
        assert!(matches!(err, SyncError::CredentialsExpired { ref folder_id, .. } if folder_id == "folder-1"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_transient_failures_stay_remote() {
        let err = SyncError::from_remote(BridgeError::Timeout("list".to_string()), "folder-1");
        assert!(matches!(err, SyncError::Remote(_)));
        assert!(!err.is_fatal());
        assert!(SyncError::MissingFolderReference {
            job_id: "j".to_string()
        }
        .is_fatal());
    }
}
