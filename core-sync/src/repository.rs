//! # Sync Job Repository
//!
//! Provides database persistence for sync jobs (the job store).
//!
//! ## Overview
//!
//! This repository handles:
//! - Creating new sync jobs
//! - Atomically claiming pending jobs for workers
//! - Persisting progress counters and checkpoints
//! - Force-failing stale jobs and recovering interrupted ones
//! - Job history retrieval
//!
//! Timestamps are supplied by the caller so that the orchestrator's injected
//! clock is the only time source.

use crate::{JobKind, Result, SyncError, SyncJob, SyncJobId, SyncJobMetadata, SyncStatus};
use async_trait::async_trait;
use core_runtime::events::SyncCounts;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

const JOB_COLUMNS: &str = r#"
    id, folder_id, kind, status,
    total_items, processed_items, failed_items,
    new_items, updated_items, deleted_items,
    metadata, error_message,
    created_at, started_at, completed_at, updated_at
"#;

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for sync job persistence
#[async_trait]
pub trait SyncJobRepository: Send + Sync {
    /// Insert a new sync job
    async fn insert(&self, job: &SyncJob) -> Result<()>;

    /// Write every field of an existing job
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::JobNotFound`] if the job doesn't exist
    async fn update(&self, job: &SyncJob) -> Result<()>;

    /// Write the outcome of a job leaving `running`.
    ///
    /// Returns `Ok(false)` and writes nothing when the stored job is no longer
    /// running, e.g. it was force-failed as stale while its worker was busy.
    async fn finish_running(&self, job: &SyncJob) -> Result<bool>;

    /// Refresh `updated_at` of a running job so it is not taken for stale
    async fn touch(&self, id: &SyncJobId, now: i64) -> Result<()>;

    async fn find_by_id(&self, id: &SyncJobId) -> Result<Option<SyncJob>>;

    /// Atomically move up to `limit` of the oldest pending jobs to running
    /// and return them. Two concurrent callers never receive the same job.
    async fn claim_pending(&self, limit: u32, now: i64) -> Result<Vec<SyncJob>>;

    /// The most recent pending or running job for a folder
    async fn find_active_for_folder(&self, folder_id: &str) -> Result<Option<SyncJob>>;

    /// Fail every pending/running job of a folder last touched before
    /// `updated_before`. Returns how many jobs were failed.
    async fn fail_stale_for_folder(
        &self,
        folder_id: &str,
        updated_before: i64,
        now: i64,
    ) -> Result<u64>;

    /// Return every running job to pending. Used at startup, when no worker
    /// can still own them.
    async fn requeue_running(&self, now: i64) -> Result<u64>;

    /// Persist progress counters without touching the checkpoint
    async fn update_progress(&self, id: &SyncJobId, counts: &SyncCounts, now: i64) -> Result<()>;

    /// Persist counters and metadata together
    async fn save_checkpoint(
        &self,
        id: &SyncJobId,
        counts: &SyncCounts,
        metadata: &SyncJobMetadata,
        now: i64,
    ) -> Result<()>;

    /// Sync job history for a folder (most recent first)
    async fn history_for_folder(&self, folder_id: &str, limit: u32) -> Result<Vec<SyncJob>>;

    async fn find_by_status(&self, status: SyncStatus) -> Result<Vec<SyncJob>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of SyncJobRepository
pub struct SqliteSyncJobRepository {
    pool: SqlitePool,
}

impl SqliteSyncJobRepository {
    /// Create a new SQLite sync job repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_jobs(&self, sql: &str, bind: &str, limit: Option<u32>) -> Result<Vec<SyncJob>> {
        let mut query = sqlx::query_as::<_, SyncJobRow>(sql).bind(bind);
        if let Some(limit) = limit {
            query = query.bind(limit as i64);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter()
            .map(SyncJob::try_from)
            .collect::<Result<Vec<_>>>()
    }

    /// Write every mutable column of `job`, optionally only while the stored
    /// row is still running. Returns the number of rows written.
    async fn write_job(&self, job: &SyncJob, only_running: bool) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE sync_jobs SET
                status = ?,
                total_items = ?,
                processed_items = ?,
                failed_items = ?,
                new_items = ?,
                updated_items = ?,
                deleted_items = ?,
                metadata = ?,
                error_message = ?,
                started_at = ?,
                completed_at = ?,
                updated_at = ?
            WHERE id = ?{}
            "#,
            if only_running { " AND status = 'running'" } else { "" }
        );

        let result = sqlx::query(&sql)
            .bind(job.status.as_str())
            .bind(job.counts.total as i64)
            .bind(job.counts.processed as i64)
            .bind(job.counts.failed as i64)
            .bind(job.counts.new as i64)
            .bind(job.counts.updated as i64)
            .bind(job.counts.deleted as i64)
            .bind(job.metadata.to_json()?)
            .bind(&job.error_message)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.updated_at)
            .bind(job.id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn fail_unreadable(&self, id: &str, reason: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Database row representation of a sync job
#[derive(Debug, FromRow)]
struct SyncJobRow {
    id: String,
    folder_id: Option<String>,
    kind: String,
    status: String,
    total_items: i64,
    processed_items: i64,
    failed_items: i64,
    new_items: i64,
    updated_items: i64,
    deleted_items: i64,
    metadata: String,
    error_message: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    updated_at: i64,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = SyncError;

    fn try_from(row: SyncJobRow) -> Result<Self> {
        let metadata = SyncJobMetadata::from_json(&row.metadata)?;

        Ok(SyncJob {
            id: SyncJobId::from_string(&row.id)?,
            folder_id: row.folder_id,
            kind: row.kind.parse::<JobKind>()?,
            status: row.status.parse::<SyncStatus>()?,
            counts: SyncCounts {
                processed: row.processed_items.max(0) as u64,
                total: row.total_items.max(0) as u64,
                new: row.new_items.max(0) as u64,
                updated: row.updated_items.max(0) as u64,
                deleted: row.deleted_items.max(0) as u64,
                failed: row.failed_items.max(0) as u64,
            },
            metadata,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl SyncJobRepository for SqliteSyncJobRepository {
    async fn insert(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, folder_id, kind, status,
                total_items, processed_items, failed_items,
                new_items, updated_items, deleted_items,
                metadata, error_message,
                created_at, started_at, completed_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.folder_id)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.counts.total as i64)
        .bind(job.counts.processed as i64)
        .bind(job.counts.failed as i64)
        .bind(job.counts.new as i64)
        .bind(job.counts.updated as i64)
        .bind(job.counts.deleted as i64)
        .bind(job.metadata.to_json()?)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, job: &SyncJob) -> Result<()> {
        if self.write_job(job, false).await? == 0 {
            return Err(SyncError::JobNotFound {
                job_id: job.id.to_string(),
            });
        }
        Ok(())
    }

    async fn finish_running(&self, job: &SyncJob) -> Result<bool> {
        Ok(self.write_job(job, true).await? > 0)
    }

    async fn touch(&self, id: &SyncJobId, now: i64) -> Result<()> {
        sqlx::query("UPDATE sync_jobs SET updated_at = ? WHERE id = ? AND status = 'running'")
            .bind(now)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_by_id(&self, id: &SyncJobId) -> Result<Option<SyncJob>> {
        let row = sqlx::query_as::<_, SyncJobRow>(&format!(
            "SELECT {} FROM sync_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(SyncJob::try_from).transpose()
    }

    async fn claim_pending(&self, limit: u32, now: i64) -> Result<Vec<SyncJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Single statement: the subquery and the update see the same snapshot
        let rows = sqlx::query_as::<_, SyncJobRow>(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'running', started_at = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM sync_jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT ?
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match SyncJob::try_from(row) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Claimed job is unreadable, failing it");
                    self.fail_unreadable(&id, &e.to_string(), now).await?;
                }
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        debug!(claimed = jobs.len(), limit, "Claimed pending sync jobs");
        Ok(jobs)
    }

    async fn find_active_for_folder(&self, folder_id: &str) -> Result<Option<SyncJob>> {
        let row = sqlx::query_as::<_, SyncJobRow>(&format!(
            r#"
            SELECT {} FROM sync_jobs
            WHERE folder_id = ? AND status IN ('pending', 'running')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            JOB_COLUMNS
        ))
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(SyncJob::try_from).transpose()
    }

    async fn fail_stale_for_folder(
        &self,
        folder_id: &str,
        updated_before: i64,
        now: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed',
                error_message = 'Job exceeded staleness threshold',
                completed_at = ?,
                updated_at = ?
            WHERE folder_id = ?
              AND status IN ('pending', 'running')
              AND updated_at < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(folder_id)
        .bind(updated_before)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn requeue_running(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'pending', updated_at = ? WHERE status = 'running'",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn update_progress(&self, id: &SyncJobId, counts: &SyncCounts, now: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                total_items = ?, processed_items = ?, failed_items = ?,
                new_items = ?, updated_items = ?, deleted_items = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(counts.total as i64)
        .bind(counts.processed as i64)
        .bind(counts.failed as i64)
        .bind(counts.new as i64)
        .bind(counts.updated as i64)
        .bind(counts.deleted as i64)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        id: &SyncJobId,
        counts: &SyncCounts,
        metadata: &SyncJobMetadata,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET
                total_items = ?, processed_items = ?, failed_items = ?,
                new_items = ?, updated_items = ?, deleted_items = ?,
                metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(counts.total as i64)
        .bind(counts.processed as i64)
        .bind(counts.failed as i64)
        .bind(counts.new as i64)
        .bind(counts.updated as i64)
        .bind(counts.deleted as i64)
        .bind(metadata.to_json()?)
        .bind(now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::JobNotFound {
                job_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn history_for_folder(&self, folder_id: &str, limit: u32) -> Result<Vec<SyncJob>> {
        self.fetch_jobs(
            &format!(
                "SELECT {} FROM sync_jobs WHERE folder_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                JOB_COLUMNS
            ),
            folder_id,
            Some(limit),
        )
        .await
    }

    async fn find_by_status(&self, status: SyncStatus) -> Result<Vec<SyncJob>> {
        self.fetch_jobs(
            &format!(
                "SELECT {} FROM sync_jobs WHERE status = ? ORDER BY created_at ASC",
                JOB_COLUMNS
            ),
            status.as_str(),
            None,
        )
        .await
    }
}

// ============================================================================
// Tests
// ============================================================================
