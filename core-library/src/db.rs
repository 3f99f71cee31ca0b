//! # Store Connection Pool
//!
//! Opens the SQLite store shared by the sync and analysis workers.
//!
//! Both workers write concurrently (item ingest, job checkpoints, analysis
//! status), so file-backed stores run in WAL mode with a busy timeout instead
//! of failing on `SQLITE_BUSY`. Foreign keys are always on: deleting a folder
//! relies on the cascade to its items, sub-folder paths and analysis results.
//!
//! ```rust,ignore
//! use core_library::db::{create_pool, DatabaseConfig};
//!
//! let pool = create_pool(DatabaseConfig::new("/var/lib/photos/sync.db")).await?;
//! let folders = SqliteSyncedFolderRepository::new(pool.clone());
//! ```

use crate::{LibraryError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use sqlx::SqlitePool;

/// Where the store lives and how many connections the pool keeps.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file; `None` opens a private in-memory store
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a writer waits on a locked database before giving up
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(database_path.into()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// In-memory store pinned to a single connection.
    ///
    /// Every connection to `:memory:` opens a separate database, so more than
    /// one connection would see an empty schema.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = match &self.path {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            None => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };
        Ok(options.foreign_keys(true).busy_timeout(self.busy_timeout))
    }
}

/// Open the pool, apply pending migrations and verify the store answers.
///
/// # Errors
///
/// Fails when the parent directory cannot be created, the file cannot be
/// opened, or a migration does not apply.
pub async fn create_pool(config: DatabaseConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.path.as_deref().and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LibraryError::InvalidInput {
                    field: "database_path".to_string(),
                    message: format!("cannot create {}: {}", parent.display(), e),
                })?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(config.connect_options()?)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to open store");
            LibraryError::Database(e)
        })?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| LibraryError::Migration(e.to_string()))?;

    sqlx::query("SELECT 1")
        .fetch_one(&pool)
        .await
        .map_err(LibraryError::Database)?;

    match &config.path {
        Some(path) => info!(
            database = %path.display(),
            max_connections = config.max_connections,
            "Store opened"
        ),
        None => debug!("In-memory store opened"),
    }
    Ok(pool)
}

/// Migrated in-memory pool for tests.
pub async fn create_test_pool() -> Result<SqlitePool> {
    create_pool(DatabaseConfig::in_memory()).await
}
