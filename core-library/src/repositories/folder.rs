//! Synced folder repository
//!
//! Folders carry the sync cursor and user-visible sync status. The
//! repository also owns the remote sub-folder path cache, since a folder
//! rename rewrites cached paths and item paths in one transaction.

use crate::error::{LibraryError, Result};
use crate::models::{FolderSyncStatus, SyncedFolder};
use async_trait::async_trait;
use bridge_traits::change_feed::FolderCredentials;
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Paths touched by a sub-folder rename or move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameOutcome {
    /// The path the sub-folder had before, when it was known locally
    pub old_path: Option<String>,
    /// Items whose stored path changed
    pub items_updated: u64,
}

#[async_trait]
pub trait SyncedFolderRepository: Send + Sync {
    /// Insert a new folder
    async fn insert(&self, folder: &SyncedFolder) -> Result<()>;

    /// Find a folder by its ID
    async fn find_by_id(&self, id: &str) -> Result<Option<SyncedFolder>>;

    /// Find a folder by the remote store's folder identity
    async fn find_by_remote_id(&self, remote_folder_id: &str) -> Result<Option<SyncedFolder>>;

    /// All folders, oldest first
    async fn list(&self) -> Result<Vec<SyncedFolder>>;

    /// Set the sync status, attaching or clearing the error text
    async fn update_sync_status(
        &self,
        id: &str,
        status: FolderSyncStatus,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<()>;

    /// Record a completed sync: status `idle`, error cleared, `last_synced_at` advanced
    async fn mark_synced(&self, id: &str, change_token: &str, synced_at: i64) -> Result<()>;

    /// Replace the change cursor without touching status
    async fn update_change_token(&self, id: &str, change_token: &str, now: i64) -> Result<()>;

    /// Store fresh credentials after the user reconnects; clears an `error` status
    async fn update_credentials(
        &self,
        id: &str,
        credentials: &FolderCredentials,
        now: i64,
    ) -> Result<()>;

    /// Delete a folder; items, results and cached paths cascade
    ///
    /// Returns `Ok(false)` if the folder was not found
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Replace the cached sub-folder path map with a fresh listing
    async fn replace_folder_paths(&self, id: &str, paths: &HashMap<String, String>) -> Result<()>;

    /// Cached path of one remote sub-folder
    async fn folder_path(&self, id: &str, remote_folder_id: &str) -> Result<Option<String>>;

    /// All cached sub-folder paths
    async fn folder_paths(&self, id: &str) -> Result<HashMap<String, String>>;

    /// Apply a rename or move of a remote sub-folder.
    ///
    /// Items filed directly under the sub-folder get `new_path`. When the old
    /// path is known, every cached sub-folder path and item path below it is
    /// rewritten too, so nested folders follow their parent.
    async fn rename_subfolder(
        &self,
        id: &str,
        remote_folder_id: &str,
        new_path: &str,
        now: i64,
    ) -> Result<RenameOutcome>;
}

/// SQLite implementation of [`SyncedFolderRepository`]
pub struct SqliteSyncedFolderRepository {
    pool: SqlitePool,
}

impl SqliteSyncedFolderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn validate_folder(folder: &SyncedFolder) -> Result<()> {
        folder.validate().map_err(|msg| LibraryError::InvalidInput {
            field: "SyncedFolder".to_string(),
            message: msg,
        })
    }
}


#[derive(FromRow)]
struct SyncedFolderRow {
    id: String,
    remote_folder_id: String,
    name: String,
    credentials: String,
    change_token: String,
    sync_status: String,
    last_synced_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SyncedFolderRow> for SyncedFolder {
    type Error = LibraryError;

    fn try_from(row: SyncedFolderRow) -> Result<Self> {
        let credentials: FolderCredentials = serde_json::from_str(&row.credentials)
            .map_err(|e| LibraryError::Decode(format!("folder {} credentials: {}", row.id, e)))?;
        let sync_status = row
            .sync_status
            .parse::<FolderSyncStatus>()
            .map_err(LibraryError::Decode)?;

        Ok(SyncedFolder {
            id: row.id,
            remote_folder_id: row.remote_folder_id,
            name: row.name,
            credentials,
            change_token: row.change_token,
            sync_status,
            last_synced_at: row.last_synced_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn encode_credentials(credentials: &FolderCredentials) -> Result<String> {
    serde_json::to_string(credentials).map_err(|e| LibraryError::InvalidInput {
        field: "credentials".to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl SyncedFolderRepository for SqliteSyncedFolderRepository {
    #[instrument(skip(self, folder), fields(folder_id = %folder.id))]
    async fn insert(&self, folder: &SyncedFolder) -> Result<()> {
        Self::validate_folder(folder)?;
        let credentials = encode_credentials(&folder.credentials)?;

        sqlx::query(
            r#"
            INSERT INTO synced_folders (
                id, remote_folder_id, name, credentials, change_token, sync_status,
                last_synced_at, last_error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&folder.id)
        .bind(&folder.remote_folder_id)
        .bind(&folder.name)
        .bind(credentials)
        .bind(&folder.change_token)
        .bind(folder.sync_status.as_str())
        .bind(folder.last_synced_at)
        .bind(&folder.last_error)
        .bind(folder.created_at)
        .bind(folder.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Inserted synced folder");
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SyncedFolder>> {
        let row = sqlx::query_as::<_, SyncedFolderRow>("SELECT * FROM synced_folders WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SyncedFolder::try_from).transpose()
    }

    async fn find_by_remote_id(&self, remote_folder_id: &str) -> Result<Option<SyncedFolder>> {
        let row = sqlx::query_as::<_, SyncedFolderRow>(
            "SELECT * FROM synced_folders WHERE remote_folder_id = ?",
        )
        .bind(remote_folder_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncedFolder::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<SyncedFolder>> {
        let rows = sqlx::query_as::<_, SyncedFolderRow>(
            "SELECT * FROM synced_folders ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncedFolder::try_from).collect()
    }

    async fn update_sync_status(
        &self,
        id: &str,
        status: FolderSyncStatus,
        last_error: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE synced_folders SET sync_status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("SyncedFolder", id));
        }
        Ok(())
    }

    async fn mark_synced(&self, id: &str, change_token: &str, synced_at: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE synced_folders
            SET sync_status = 'idle', last_error = NULL, change_token = ?,
                last_synced_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(change_token)
        .bind(synced_at)
        .bind(synced_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("SyncedFolder", id));
        }
        Ok(())
    }

    async fn update_change_token(&self, id: &str, change_token: &str, now: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE synced_folders SET change_token = ?, updated_at = ? WHERE id = ?")
                .bind(change_token)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("SyncedFolder", id));
        }
        Ok(())
    }

    async fn update_credentials(
        &self,
        id: &str,
        credentials: &FolderCredentials,
        now: i64,
    ) -> Result<()> {
        let encoded = encode_credentials(credentials)?;
        let result = sqlx::query(
            r#"
            UPDATE synced_folders
            SET credentials = ?,
                sync_status = CASE WHEN sync_status = 'error' THEN 'idle' ELSE sync_status END,
                last_error = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(encoded)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("SyncedFolder", id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM synced_folders WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_folder_paths(&self, id: &str, paths: &HashMap<String, String>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM remote_folder_paths WHERE folder_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for (remote_folder_id, path) in paths {
            sqlx::query(
                "INSERT INTO remote_folder_paths (folder_id, remote_folder_id, path) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(remote_folder_id)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn folder_path(&self, id: &str, remote_folder_id: &str) -> Result<Option<String>> {
        let path: Option<(String,)> = sqlx::query_as(
            "SELECT path FROM remote_folder_paths WHERE folder_id = ? AND remote_folder_id = ?",
        )
        .bind(id)
        .bind(remote_folder_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(path.map(|(p,)| p))
    }

    async fn folder_paths(&self, id: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT remote_folder_id, path FROM remote_folder_paths WHERE folder_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip(self))]
    async fn rename_subfolder(
        &self,
        id: &str,
        remote_folder_id: &str,
        new_path: &str,
        now: i64,
    ) -> Result<RenameOutcome> {
        let mut tx = self.pool.begin().await?;

        let cached: Option<(String,)> = sqlx::query_as(
            "SELECT path FROM remote_folder_paths WHERE folder_id = ? AND remote_folder_id = ?",
        )
        .bind(id)
        .bind(remote_folder_id)
        .fetch_optional(&mut *tx)
        .await?;

        let old_path = match cached {
            Some((path,)) => Some(path),
            None => {
                let from_items: Option<(String,)> = sqlx::query_as(
                    "SELECT path FROM synced_items WHERE folder_id = ? AND remote_folder_id = ? LIMIT 1",
                )
                .bind(id)
                .bind(remote_folder_id)
                .fetch_optional(&mut *tx)
                .await?;
                from_items.map(|(path,)| path)
            }
        };

        let direct = sqlx::query(
            r#"
            UPDATE synced_items SET path = ?, updated_at = ?
            WHERE folder_id = ? AND remote_folder_id = ? AND path != ?
            "#,
        )
        .bind(new_path)
        .bind(now)
        .bind(id)
        .bind(remote_folder_id)
        .bind(new_path)
        .execute(&mut *tx)
        .await?;
        let mut items_updated = direct.rows_affected();

        if let Some(old) = old_path.as_deref().filter(|old| *old != new_path) {
            // Descendants: every path starting with "<old>/"
            let nested = sqlx::query(
                r#"
                UPDATE synced_items
                SET path = ? || substr(path, length(?) + 1), updated_at = ?
                WHERE folder_id = ? AND substr(path, 1, length(?) + 1) = ? || '/'
                "#,
            )
            .bind(new_path)
            .bind(old)
            .bind(now)
            .bind(id)
            .bind(old)
            .bind(old)
            .execute(&mut *tx)
            .await?;
            items_updated += nested.rows_affected();

            sqlx::query(
                r#"
                UPDATE remote_folder_paths
                SET path = ? || substr(path, length(?) + 1)
                WHERE folder_id = ? AND substr(path, 1, length(?) + 1) = ? || '/'
                "#,
            )
            .bind(new_path)
            .bind(old)
            .bind(id)
            .bind(old)
            .bind(old)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO remote_folder_paths (folder_id, remote_folder_id, path) VALUES (?, ?, ?)
            ON CONFLICT (folder_id, remote_folder_id) DO UPDATE SET path = excluded.path
            "#,
        )
        .bind(id)
        .bind(remote_folder_id)
        .bind(new_path)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(items_updated, "Applied sub-folder rename");
        Ok(RenameOutcome {
            old_path,
            items_updated,
        })
    }
}
