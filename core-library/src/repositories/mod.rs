//! # Repository Pattern Implementation
//!
//! Repository traits and SQLite implementations for the synced library.
//!
//! ## Architecture
//!
//! - Traits define the interface for each repository (`#[async_trait]`, `Send + Sync`)
//! - SQLite implementations use sqlx against a shared `SqlitePool`
//! - All operations return `Result<T>` for error handling
//!
//! ## Available Repositories
//!
//! - `SyncedFolderRepository` - Synced folders, change cursors, sub-folder paths
//! - `SyncedItemRepository` - Ingested files and their analysis status
//! - `AnalysisResultRepository` - Faces detected in items

pub mod analysis;
pub mod folder;
pub mod item;

pub use analysis::{AnalysisResultRepository, SqliteAnalysisResultRepository};
pub use folder::{RenameOutcome, SqliteSyncedFolderRepository, SyncedFolderRepository};
pub use item::{SqliteSyncedItemRepository, SyncedItemRepository};
