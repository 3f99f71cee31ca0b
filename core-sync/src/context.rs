//! Collaborators and helpers shared by the full and incremental sync runs.

use crate::{Result, SyncError, SyncJob, SyncJobRepository};
use bridge_traits::change_feed::ChangeFeedClient;
use bridge_traits::time::Clock;
use bridge_traits::BridgeError;
use core_library::models::SyncedItem;
use core_library::repositories::{SyncedFolderRepository, SyncedItemRepository};
use core_runtime::config::SyncWorkerConfig;
use core_runtime::events::{CoreEvent, EventBus, ItemEvent, SyncCounts, SyncEvent};
use core_runtime::retry::{retry_with_backoff, with_timeout, RetryError};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a sync run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    /// Every item or change was applied; `change_token` may now be stored.
    Completed {
        counts: SyncCounts,
        change_token: String,
        no_changes: bool,
    },
    /// Cancellation was observed; progress up to the checkpoint is kept.
    Interrupted { counts: SyncCounts },
}

#[derive(Clone)]
pub(crate) struct SyncContext {
    pub client: Arc<dyn ChangeFeedClient>,
    pub folders: Arc<dyn SyncedFolderRepository>,
    pub items: Arc<dyn SyncedItemRepository>,
    pub jobs: Arc<dyn SyncJobRepository>,
    pub events: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncWorkerConfig,
}

impl SyncContext {
    pub fn now(&self) -> i64 {
        self.clock.unix_timestamp()
    }

    /// Run one remote call with the per-call timeout and transient-failure
    /// retry. Credential rejections come back as
    /// [`SyncError::CredentialsExpired`] for `folder_id`.
    pub async fn remote<T, F, Fut>(
        &self,
        operation: &'static str,
        folder_id: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BridgeError>>,
    {
        let limit = self.config.remote_call_timeout;
        let result = retry_with_backoff(
            &self.config.retry,
            cancel,
            BridgeError::is_retryable,
            |attempt| {
                if attempt > 1 {
                    debug!(operation, attempt, "Retrying remote call");
                }
                with_timeout(limit, operation, op())
            },
        )
        .await;

        result.map_err(|e| match e {
            RetryError::Cancelled => SyncError::Cancelled,
            RetryError::NonRetryable(e) | RetryError::Exhausted { last: e, .. } => {
                SyncError::from_remote(e, folder_id)
            }
        })
    }

    pub fn emit(&self, event: CoreEvent) {
        self.events.emit(event).ok();
    }

    /// Mark the job alive between long remote calls.
    pub async fn heartbeat(&self, job: &SyncJob) {
        if let Err(e) = self.jobs.touch(&job.id, self.now()).await {
            warn!(job_id = %job.id, error = %e, "Failed to refresh job heartbeat");
        }
    }

    /// Broadcast progress and refresh the job's counters (and its staleness clock).
    pub async fn report_progress(
        &self,
        job: &SyncJob,
        folder_id: &str,
        counts: SyncCounts,
        percent: u8,
        is_incremental: bool,
    ) {
        self.emit(CoreEvent::Sync(SyncEvent::Progress {
            job_id: job.id.to_string(),
            folder_id: folder_id.to_string(),
            counts,
            percent,
            is_incremental,
        }));

        if let Err(e) = self.jobs.update_progress(&job.id, &counts, self.now()).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist sync progress");
        }
    }

    /// Write pending new items. Ids actually inserted count as new and are
    /// announced; a failed write counts every pending item as failed.
    pub async fn flush_inserts(
        &self,
        folder_id: &str,
        pending: &mut Vec<SyncedItem>,
        counts: &mut SyncCounts,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);

        match self.items.insert_batch(&batch).await {
            Ok(item_ids) => {
                counts.new += item_ids.len() as u64;
                debug!(folder_id, inserted = item_ids.len(), batch = batch.len(), "Flushed insert batch");
                if !item_ids.is_empty() {
                    self.emit(CoreEvent::Item(ItemEvent::Added {
                        folder_id: folder_id.to_string(),
                        item_ids,
                    }));
                }
            }
            Err(e) => {
                warn!(folder_id, batch = batch.len(), error = %e, "Insert batch failed");
                counts.failed += batch.len() as u64;
            }
        }
    }
}

/// Whole-number share of `processed` in `total`, capped at 100.
pub(crate) fn percent_of(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed.saturating_mul(100) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 120), 0);
        assert_eq!(percent_of(6, 120), 5);
        assert_eq!(percent_of(119, 120), 99);
        assert_eq!(percent_of(120, 120), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
