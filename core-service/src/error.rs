use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Folder {remote_folder_id} is already synced as {folder_id}")]
    FolderAlreadySynced {
        remote_folder_id: String,
        folder_id: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] core_analysis::AnalysisError),

    #[error("Library error: {0}")]
    Library(#[from] core_library::LibraryError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
