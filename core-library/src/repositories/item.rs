//! Synced item repository
//!
//! Items are keyed by `(folder_id, remote_id)`. Inserts skip rows that
//! already exist so a re-processed batch after a crash is harmless.

use crate::error::{LibraryError, Result};
use crate::models::{AnalysisCounts, AnalysisStatus, SyncedItem};
use async_trait::async_trait;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Remote ids deleted per statement during orphan cleanup.
const DELETE_CHUNK: usize = 500;

#[async_trait]
pub trait SyncedItemRepository: Send + Sync {
    /// Find an item by its ID
    async fn find_by_id(&self, id: &str) -> Result<Option<SyncedItem>>;

    /// Find an item by remote identity within one folder
    async fn find_by_remote_id(&self, folder_id: &str, remote_id: &str)
        -> Result<Option<SyncedItem>>;

    /// Insert a batch in one transaction.
    ///
    /// Returns the ids of rows actually inserted; items whose remote identity
    /// already exists in the folder are skipped.
    async fn insert_batch(&self, items: &[SyncedItem]) -> Result<Vec<String>>;

    /// Overwrite the remote metadata of an existing item
    async fn update(&self, item: &SyncedItem) -> Result<()>;

    /// Delete one item by remote identity. Returns `Ok(false)` if absent
    async fn delete_by_remote_id(&self, folder_id: &str, remote_id: &str) -> Result<bool>;

    /// Delete every item filed directly under a remote folder
    async fn delete_by_remote_folder_id(&self, folder_id: &str, remote_folder_id: &str)
        -> Result<u64>;

    /// Delete every item of the folder whose remote id is not in `keep`
    async fn delete_not_in(&self, folder_id: &str, keep: &HashSet<String>) -> Result<u64>;

    /// Oldest items with the given analysis status
    async fn find_by_analysis_status(&self, status: AnalysisStatus, limit: u32)
        -> Result<Vec<SyncedItem>>;

    /// Set the analysis status, result count and error text of one item
    async fn update_analysis_status(
        &self,
        id: &str,
        status: AnalysisStatus,
        result_count: i64,
        error: Option<&str>,
        now: i64,
    ) -> Result<()>;

    /// Return items stuck in `processing` since before `updated_before` to `pending`
    async fn reset_stuck_processing(&self, updated_before: i64) -> Result<u64>;

    /// Number of items in a folder
    async fn count_by_folder(&self, folder_id: &str) -> Result<i64>;

    /// Item counts per analysis status, for one folder or all of them
    async fn analysis_counts(&self, folder_id: Option<&str>) -> Result<AnalysisCounts>;
}

/// SQLite implementation of [`SyncedItemRepository`]
pub struct SqliteSyncedItemRepository {
    pool: SqlitePool,
}

impl SqliteSyncedItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn validate_item(item: &SyncedItem) -> Result<()> {
        item.validate().map_err(|msg| LibraryError::InvalidInput {
            field: "SyncedItem".to_string(),
            message: msg,
        })
    }
}

#[derive(FromRow)]
struct SyncedItemRow {
    id: String,
    folder_id: String,
    remote_id: String,
    remote_folder_id: Option<String>,
    path: String,
    name: String,
    mime_type: String,
    size: i64,
    remote_created_at: Option<i64>,
    remote_modified_at: Option<i64>,
    thumbnail_url: Option<String>,
    web_view_url: Option<String>,
    analysis_status: String,
    result_count: i64,
    analysis_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SyncedItemRow> for SyncedItem {
    type Error = LibraryError;

    fn try_from(row: SyncedItemRow) -> Result<Self> {
        let analysis_status = row
            .analysis_status
            .parse::<AnalysisStatus>()
            .map_err(LibraryError::Decode)?;

        Ok(SyncedItem {
            id: row.id,
            folder_id: row.folder_id,
            remote_id: row.remote_id,
            remote_folder_id: row.remote_folder_id,
            path: row.path,
            name: row.name,
            mime_type: row.mime_type,
            size: row.size,
            remote_created_at: row.remote_created_at,
            remote_modified_at: row.remote_modified_at,
            thumbnail_url: row.thumbnail_url,
            web_view_url: row.web_view_url,
            analysis_status,
            result_count: row.result_count,
            analysis_error: row.analysis_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl SyncedItemRepository for SqliteSyncedItemRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<SyncedItem>> {
        let row = sqlx::query_as::<_, SyncedItemRow>("SELECT * FROM synced_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SyncedItem::try_from).transpose()
    }

    async fn find_by_remote_id(
        &self,
        folder_id: &str,
        remote_id: &str,
    ) -> Result<Option<SyncedItem>> {
        let row = sqlx::query_as::<_, SyncedItemRow>(
            "SELECT * FROM synced_items WHERE folder_id = ? AND remote_id = ?",
        )
        .bind(folder_id)
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncedItem::try_from).transpose()
    }

    #[instrument(skip(self, items), fields(batch = items.len()))]
    async fn insert_batch(&self, items: &[SyncedItem]) -> Result<Vec<String>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        for item in items {
            Self::validate_item(item)?;
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(items.len());

        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO synced_items (
                    id, folder_id, remote_id, remote_folder_id, path, name, mime_type, size,
                    remote_created_at, remote_modified_at, thumbnail_url, web_view_url,
                    analysis_status, result_count, analysis_error, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (folder_id, remote_id) DO NOTHING
                "#,
            )
            .bind(&item.id)
            .bind(&item.folder_id)
            .bind(&item.remote_id)
            .bind(&item.remote_folder_id)
            .bind(&item.path)
            .bind(&item.name)
            .bind(&item.mime_type)
            .bind(item.size)
            .bind(item.remote_created_at)
            .bind(item.remote_modified_at)
            .bind(&item.thumbnail_url)
            .bind(&item.web_view_url)
            .bind(item.analysis_status.as_str())
            .bind(item.result_count)
            .bind(&item.analysis_error)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                inserted.push(item.id.clone());
            }
        }

        tx.commit().await?;

        debug!(inserted = inserted.len(), "Inserted item batch");
        Ok(inserted)
    }

    async fn update(&self, item: &SyncedItem) -> Result<()> {
        Self::validate_item(item)?;

        let result = sqlx::query(
            r#"
            UPDATE synced_items
            SET remote_folder_id = ?, path = ?, name = ?, mime_type = ?, size = ?,
                remote_created_at = ?, remote_modified_at = ?, thumbnail_url = ?,
                web_view_url = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&item.remote_folder_id)
        .bind(&item.path)
        .bind(&item.name)
        .bind(&item.mime_type)
        .bind(item.size)
        .bind(item.remote_created_at)
        .bind(item.remote_modified_at)
        .bind(&item.thumbnail_url)
        .bind(&item.web_view_url)
        .bind(item.updated_at)
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("SyncedItem", &item.id));
        }
        Ok(())
    }

    async fn delete_by_remote_id(&self, folder_id: &str, remote_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM synced_items WHERE folder_id = ? AND remote_id = ?")
            .bind(folder_id)
            .bind(remote_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_remote_folder_id(
        &self,
        folder_id: &str,
        remote_folder_id: &str,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM synced_items WHERE folder_id = ? AND remote_folder_id = ?")
                .bind(folder_id)
                .bind(remote_folder_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, keep), fields(keep = keep.len()))]
    async fn delete_not_in(&self, folder_id: &str, keep: &HashSet<String>) -> Result<u64> {
        let stored: Vec<(String,)> =
            sqlx::query_as("SELECT remote_id FROM synced_items WHERE folder_id = ?")
                .bind(folder_id)
                .fetch_all(&self.pool)
                .await?;

        let orphans: Vec<String> = stored
            .into_iter()
            .map(|(remote_id,)| remote_id)
            .filter(|remote_id| !keep.contains(remote_id))
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for chunk in orphans.chunks(DELETE_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM synced_items WHERE folder_id = ");
            builder.push_bind(folder_id);
            builder.push(" AND remote_id IN (");
            let mut separated = builder.separated(", ");
            for remote_id in chunk {
                separated.push_bind(remote_id);
            }
            separated.push_unseparated(")");

            deleted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        debug!(deleted, "Deleted orphaned items");
        Ok(deleted)
    }

    async fn find_by_analysis_status(
        &self,
        status: AnalysisStatus,
        limit: u32,
    ) -> Result<Vec<SyncedItem>> {
        let rows = sqlx::query_as::<_, SyncedItemRow>(
            r#"
            SELECT * FROM synced_items
            WHERE analysis_status = ?
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncedItem::try_from).collect()
    }

    async fn update_analysis_status(
        &self,
        id: &str,
        status: AnalysisStatus,
        result_count: i64,
        error: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE synced_items
            SET analysis_status = ?, result_count = ?, analysis_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(result_count)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LibraryError::not_found("SyncedItem", id));
        }
        Ok(())
    }

    async fn reset_stuck_processing(&self, updated_before: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE synced_items SET analysis_status = 'pending'
            WHERE analysis_status = 'processing' AND updated_at < ?
            "#,
        )
        .bind(updated_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_folder(&self, folder_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM synced_items WHERE folder_id = ?")
                .bind(folder_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn analysis_counts(&self, folder_id: Option<&str>) -> Result<AnalysisCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT analysis_status, COUNT(*) FROM synced_items
            WHERE (?1 IS NULL OR folder_id = ?1)
            GROUP BY analysis_status
            "#,
        )
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = AnalysisCounts::default();
        for (status, count) in rows {
            match status.parse::<AnalysisStatus>().map_err(LibraryError::Decode)? {
                AnalysisStatus::Pending => counts.pending = count,
                AnalysisStatus::Processing => counts.processing = count,
                AnalysisStatus::Completed => counts.completed = count,
                AnalysisStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::SyncedFolder;
    use crate::repositories::{SqliteSyncedFolderRepository, SyncedFolderRepository};
    use bridge_traits::change_feed::{FolderCredentials, RemoteFile};

    async fn setup() -> (SqliteSyncedItemRepository, String) {
        let pool = create_test_pool().await.unwrap();
        let folders = SqliteSyncedFolderRepository::new(pool.clone());
        let folder = SyncedFolder::new("root", "Family", FolderCredentials::new("a", "r"), 100);
        folders.insert(&folder).await.unwrap();
        (SqliteSyncedItemRepository::new(pool), folder.id)
    }

    fn item(folder_id: &str, remote_id: &str, parent: &str) -> SyncedItem {
        let file = RemoteFile {
            id: remote_id.to_string(),
            name: format!("{}.jpg", remote_id),
            mime_type: "image/jpeg".to_string(),
            size: 10,
            parent_id: Some(parent.to_string()),
            created_time: None,
            modified_time: None,
            thumbnail_url: None,
            web_view_url: None,
            trashed: false,
        };
        SyncedItem::from_remote(folder_id, &file, "Family", 100)
    }

    #[tokio::test]
    async fn test_insert_batch_skips_existing_remote_ids() {
        let (repo, folder_id) = setup().await;

        let first = repo
            .insert_batch(&[item(&folder_id, "a", "root"), item(&folder_id, "b", "root")])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let again = item(&folder_id, "a", "root");
        let second = repo
            .insert_batch(&[again, item(&folder_id, "c", "root")])
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(repo.count_by_folder(&folder_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_update_and_find() {
        let (repo, folder_id) = setup().await;
        let mut stored = item(&folder_id, "a", "root");
        repo.insert_batch(&[stored.clone()]).await.unwrap();

        stored.path = "Family/Moved".to_string();
        stored.remote_folder_id = Some("moved".to_string());
        repo.update(&stored).await.unwrap();

        let found = repo.find_by_remote_id(&folder_id, "a").await.unwrap().unwrap();
        assert_eq!(found.path, "Family/Moved");
        assert_eq!(found.remote_folder_id.as_deref(), Some("moved"));
        assert_eq!(repo.find_by_id(&stored.id).await.unwrap(), Some(found));
    }

    #[tokio::test]
    async fn test_update_missing_item_is_not_found() {
        let (repo, folder_id) = setup().await;
        let result = repo.update(&item(&folder_id, "ghost", "root")).await;
        assert!(matches!(result, Err(LibraryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_not_in_removes_orphans_only() {
        let (repo, folder_id) = setup().await;
        repo.insert_batch(&[
            item(&folder_id, "A", "root"),
            item(&folder_id, "B", "root"),
            item(&folder_id, "C", "root"),
        ])
        .await
        .unwrap();

        let keep: HashSet<String> = ["A", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(repo.delete_not_in(&folder_id, &keep).await.unwrap(), 1);

        assert!(repo.find_by_remote_id(&folder_id, "B").await.unwrap().is_none());
        assert!(repo.find_by_remote_id(&folder_id, "A").await.unwrap().is_some());
        assert!(repo.find_by_remote_id(&folder_id, "C").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_by_remote_and_folder_id() {
        let (repo, folder_id) = setup().await;
        repo.insert_batch(&[
            item(&folder_id, "a", "sub"),
            item(&folder_id, "b", "sub"),
            item(&folder_id, "c", "root"),
        ])
        .await
        .unwrap();

        assert!(repo.delete_by_remote_id(&folder_id, "c").await.unwrap());
        assert!(!repo.delete_by_remote_id(&folder_id, "c").await.unwrap());
        assert_eq!(repo.delete_by_remote_folder_id(&folder_id, "sub").await.unwrap(), 2);
        assert_eq!(repo.count_by_folder(&folder_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_analysis_status_queue() {
        let (repo, folder_id) = setup().await;
        let a = item(&folder_id, "a", "root");
        let b = item(&folder_id, "b", "root");
        repo.insert_batch(&[a.clone(), b.clone()]).await.unwrap();

        repo.update_analysis_status(&a.id, AnalysisStatus::Completed, 2, None, 1_700_000_100)
            .await
            .unwrap();
        repo.update_analysis_status(&b.id, AnalysisStatus::Failed, 0, Some("bad image"), 1_700_000_100)
            .await
            .unwrap();

        let pending = repo
            .find_by_analysis_status(AnalysisStatus::Pending, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());

        let failed = repo.find_by_id(&b.id).await.unwrap().unwrap();
        assert_eq!(failed.analysis_error.as_deref(), Some("bad image"));

        let counts = repo.analysis_counts(Some(&folder_id)).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);
        assert_eq!(repo.analysis_counts(None).await.unwrap(), counts);
    }

    #[tokio::test]
    async fn test_reset_stuck_processing() {
        let (repo, folder_id) = setup().await;
        let a = item(&folder_id, "a", "root");
        repo.insert_batch(&[a.clone()]).await.unwrap();
        // A caller clock far from wall time
        let started = 1_000_000;
        repo.update_analysis_status(&a.id, AnalysisStatus::Processing, 0, None, started)
            .await
            .unwrap();

        assert_eq!(repo.reset_stuck_processing(started).await.unwrap(), 0);
        assert_eq!(repo.reset_stuck_processing(started + 60).await.unwrap(), 1);
        let found = repo.find_by_id(&a.id).await.unwrap().unwrap();
        assert_eq!(found.analysis_status, AnalysisStatus::Pending);
    }
}
