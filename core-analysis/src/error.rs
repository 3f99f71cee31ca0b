use bridge_traits::BridgeError;
use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Remote error: {0}")]
    Remote(#[from] BridgeError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Synced folder {folder_id} not found")]
    FolderNotFound { folder_id: String },

    #[error("No usable credentials for folder {folder_id}")]
    CredentialsUnavailable { folder_id: String },

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Analysis orchestrator is already running")]
    AlreadyRunning,
}

impl AnalysisError {
    /// Only remote failures classified as transient are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
