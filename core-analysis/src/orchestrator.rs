//! # Analysis Orchestrator
//!
//! Runs synced items that await analysis through the detection service and
//! stores the faces it returns.
//!
//! ## Workflow
//!
//! Every poll interval (and straight away after a full batch):
//! 1. Skip the cycle if the circuit breaker is open
//! 2. Probe the detection service; an unhealthy answer counts as a breaker failure
//! 3. Fetch up to `batch_size` items with analysis status `pending`, or a
//!    single item when the breaker is half-open
//! 4. Analyze them with at most `max_concurrent` in flight, each with its own
//!    retry budget
//!
//! Only item outcomes close the breaker; a healthy probe leaves the failure
//! count alone, so consecutive item failures add up across cycles.
//!
//! Items stuck in `processing` (a crash mid-analysis) are returned to
//! `pending` at start-up and then periodically.

use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::{AnalysisError, Result};
use bridge_traits::change_feed::{ChangeFeedClient, DownloadedImage};
use bridge_traits::detection::DetectionClient;
use bridge_traits::time::Clock;
use core_library::models::{AnalysisResult, AnalysisStatus, SyncedFolder, SyncedItem};
use core_library::repositories::{
    AnalysisResultRepository, SyncedFolderRepository, SyncedItemRepository,
};
use core_runtime::config::AnalysisWorkerConfig;
use core_runtime::events::{CoreEvent, EventBus, ItemEvent};
use core_runtime::retry::{retry_with_backoff, with_timeout, RetryError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The breaker rejected the cycle; nothing was called.
    BreakerOpen,
    /// The health probe failed.
    ServiceUnavailable,
    /// No item awaits analysis.
    Idle,
    Processed {
        fetched: usize,
        completed: usize,
        failed: usize,
    },
}

/// Snapshot of orchestrator activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnalysisStats {
    pub running: bool,
    pub max_concurrent: usize,
    pub batch_size: u32,
    pub breaker_state: BreakerState,
    pub breaker_failures: u32,
    pub items_completed: u64,
    pub items_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Collaborators shared by every item task.
struct Worker {
    config: AnalysisWorkerConfig,
    detector: Arc<dyn DetectionClient>,
    client: Arc<dyn ChangeFeedClient>,
    folders: Arc<dyn SyncedFolderRepository>,
    items: Arc<dyn SyncedItemRepository>,
    results: Arc<dyn AnalysisResultRepository>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct AnalysisOrchestrator {
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
}

impl AnalysisOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AnalysisWorkerConfig,
        detector: Arc<dyn DetectionClient>,
        client: Arc<dyn ChangeFeedClient>,
        folders: Arc<dyn SyncedFolderRepository>,
        items: Arc<dyn SyncedItemRepository>,
        results: Arc<dyn AnalysisResultRepository>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            config.breaker_reset_timeout,
            clock.clone(),
        );
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Self {
            worker: Arc::new(Worker {
                config,
                detector,
                client,
                folders,
                items,
                results,
                events,
                clock,
                breaker,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            semaphore,
            running: AtomicBool::new(false),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.worker.breaker
    }

    /// Poll until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::AlreadyRunning`] if another `run` is active.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AnalysisError::AlreadyRunning);
        }

        let config = &self.worker.config;
        info!(
            max_concurrent = config.max_concurrent,
            batch_size = config.batch_size,
            poll_interval_secs = config.poll_interval.as_secs(),
            "Analysis orchestrator started"
        );

        self.reset_stuck_items().await;
        let mut last_stuck_reset = self.worker.now();
        let stuck_every = config.stuck_processing_after.as_secs() as i64;

        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.worker.now() - last_stuck_reset >= stuck_every {
                self.reset_stuck_items().await;
                last_stuck_reset = self.worker.now();
            }

            // A full batch means more work is likely waiting
            loop {
                match self.run_cycle(&cancel).await {
                    Ok(CycleOutcome::Processed { fetched, .. })
                        if fetched >= config.batch_size as usize && !cancel.is_cancelled() => {}
                    Ok(_) => break,
                    Err(e) => {
                        error!(error = %e, "Analysis cycle failed");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Analysis orchestrator stopped");
        Ok(())
    }

    /// One poll cycle: breaker check, health probe, batch fetch, bounded
    /// concurrent analysis.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let worker = &self.worker;

        if !worker.breaker.allow_request() {
            debug!(failures = worker.breaker.failures(), "Circuit breaker open, skipping cycle");
            return Ok(CycleOutcome::BreakerOpen);
        }

        let outcome = self.admitted_cycle(cancel).await;
        // A trial that reached no item outcome must not wedge the breaker
        worker.breaker.release_trial();
        outcome
    }

    async fn admitted_cycle(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let worker = &self.worker;
        let trial = worker.breaker.trial_in_flight();

        let health = with_timeout(
            worker.config.remote_call_timeout,
            "health",
            worker.detector.health(),
        )
        .await;
        match health {
            Ok(status) if status.is_healthy() => {}
            Ok(status) => {
                warn!(status = %status.status, "Detection service unhealthy");
                worker.breaker.record_failure();
                return Ok(CycleOutcome::ServiceUnavailable);
            }
            Err(e) => {
                warn!(error = %e, "Detection service unreachable");
                worker.breaker.record_failure();
                return Ok(CycleOutcome::ServiceUnavailable);
            }
        }

        let limit = if trial { 1 } else { worker.config.batch_size };
        let batch = worker
            .items
            .find_by_analysis_status(AnalysisStatus::Pending, limit)
            .await?;
        if batch.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let fetched = batch.len();
        info!(
            items = fetched,
            max_concurrent = worker.config.max_concurrent,
            trial,
            "Analyzing items"
        );

        let mut tasks = JoinSet::new();
        for item in batch {
            if cancel.is_cancelled() {
                break;
            }
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AnalysisError::Cancelled)?;
            let worker = worker.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let outcome = worker.analyze(item, &cancel).await;
                drop(permit);
                outcome
            });
        }

        let mut completed = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemOutcome::Completed) => completed += 1,
                Ok(ItemOutcome::Failed) => failed += 1,
                Ok(ItemOutcome::Cancelled) => {}
                Err(e) => error!(error = %e, "Analysis task panicked"),
            }
        }

        info!(completed, failed, "Analysis batch finished");
        Ok(CycleOutcome::Processed {
            fetched,
            completed,
            failed,
        })
    }

    pub fn stats(&self) -> AnalysisStats {
        let worker = &self.worker;
        AnalysisStats {
            running: self.running.load(Ordering::SeqCst),
            max_concurrent: worker.config.max_concurrent,
            batch_size: worker.config.batch_size,
            breaker_state: worker.breaker.state(),
            breaker_failures: worker.breaker.failures(),
            items_completed: worker.completed.load(Ordering::SeqCst),
            items_failed: worker.failed.load(Ordering::SeqCst),
        }
    }

    /// Return items left in `processing` beyond the configured age to `pending`.
    pub async fn reset_stuck_items(&self) -> u64 {
        let worker = &self.worker;
        let cutoff = worker.now() - worker.config.stuck_processing_after.as_secs() as i64;
        match worker.items.reset_stuck_processing(cutoff).await {
            Ok(0) => 0,
            Ok(reset) => {
                info!(reset, "Returned stuck items to the analysis queue");
                reset
            }
            Err(e) => {
                warn!(error = %e, "Failed to reset stuck items");
                0
            }
        }
    }
}

// ============================================================================
// Per-item processing
// ============================================================================

impl Worker {
    fn now(&self) -> i64 {
        self.clock.unix_timestamp()
    }

    #[instrument(skip_all, fields(item_id = %item.id, folder_id = %item.folder_id))]
    async fn analyze(&self, item: SyncedItem, cancel: &CancellationToken) -> ItemOutcome {
        let result = retry_with_backoff(
            &self.config.retry,
            cancel,
            AnalysisError::is_retryable,
            |attempt| self.process_item(&item, attempt, cancel),
        )
        .await;

        match result {
            Ok(count) => {
                self.breaker.record_success();
                self.completed.fetch_add(1, Ordering::SeqCst);
                debug!(result_count = count, "Item analyzed");
                ItemOutcome::Completed
            }
            Err(RetryError::Cancelled) | Err(RetryError::NonRetryable(AnalysisError::Cancelled)) => {
                self.set_status(&item, AnalysisStatus::Pending, 0, None).await;
                debug!("Analysis interrupted, item requeued");
                ItemOutcome::Cancelled
            }
            Err(e) => {
                let message = match &e {
                    RetryError::Exhausted { attempts, last } => {
                        warn!(attempts, error = %last, "Analysis failed after retries");
                        last.to_string()
                    }
                    other => {
                        warn!(error = %other, "Analysis failed");
                        other.to_string()
                    }
                };

                self.set_status(&item, AnalysisStatus::Failed, 0, Some(&message))
                    .await;
                self.emit_updated(&item, AnalysisStatus::Failed, 0, Some(message));
                self.breaker.record_failure();
                self.failed.fetch_add(1, Ordering::SeqCst);
                ItemOutcome::Failed
            }
        }
    }

    /// One attempt. Returns the number of results stored for the item.
    async fn process_item(
        &self,
        item: &SyncedItem,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        if attempt > 1 {
            debug!(attempt, "Retrying analysis");
        }

        self.items
            .update_analysis_status(&item.id, AnalysisStatus::Processing, 0, None, self.now())
            .await?;

        // Results may already exist if an earlier run died before marking the item
        let existing = self.results.count_by_item(&item.id).await?;
        if existing > 0 {
            debug!(existing, "Item already has results");
            return self.complete(item, existing as u32).await;
        }

        let folder = self
            .folders
            .find_by_id(&item.folder_id)
            .await?
            .ok_or_else(|| AnalysisError::FolderNotFound {
                folder_id: item.folder_id.clone(),
            })?;
        if !folder.credentials.is_usable() {
            return Err(AnalysisError::CredentialsUnavailable {
                folder_id: folder.id.clone(),
            });
        }

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let image = self.download(&folder, item).await?;
        let mime_type = if image.mime_type.is_empty() {
            item.mime_type.clone()
        } else {
            image.mime_type
        };

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let extraction = with_timeout(
            self.config.remote_call_timeout,
            "extract",
            self.detector.extract(image.bytes, &mime_type),
        )
        .await?;

        if extraction.faces.is_empty() {
            return self.complete(item, 0).await;
        }

        let now = self.now();
        let results: Vec<AnalysisResult> = extraction
            .faces
            .iter()
            .map(|face| AnalysisResult::from_detection(item, face, now))
            .collect();
        self.results.insert_batch(&results).await?;

        self.complete(item, results.len() as u32).await
    }

    /// Reduced-resolution variant first, the original file if that fails.
    async fn download(&self, folder: &SyncedFolder, item: &SyncedItem) -> Result<DownloadedImage> {
        let limit = self.config.remote_call_timeout;

        let thumbnail = with_timeout(
            limit,
            "download_thumbnail",
            self.client.download_thumbnail(
                &folder.credentials,
                &item.remote_id,
                self.config.thumbnail_size,
            ),
        )
        .await;

        match thumbnail {
            Ok(image) => Ok(image),
            Err(e) if e.is_credential_error() => Err(e.into()),
            Err(e) => {
                debug!(error = %e, "Thumbnail download failed, fetching original");
                let image = with_timeout(
                    limit,
                    "download_file",
                    self.client.download_file(&folder.credentials, &item.remote_id),
                )
                .await?;
                Ok(image)
            }
        }
    }

    async fn complete(&self, item: &SyncedItem, count: u32) -> Result<u32> {
        self.items
            .update_analysis_status(
                &item.id,
                AnalysisStatus::Completed,
                i64::from(count),
                None,
                self.now(),
            )
            .await?;
        self.emit_updated(item, AnalysisStatus::Completed, count, None);
        Ok(count)
    }

    async fn set_status(
        &self,
        item: &SyncedItem,
        status: AnalysisStatus,
        count: i64,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .items
            .update_analysis_status(&item.id, status, count, error, self.now())
            .await
        {
            warn!(item_id = %item.id, status = %status, error = %e, "Failed to update analysis status");
        }
    }

    fn emit_updated(
        &self,
        item: &SyncedItem,
        status: AnalysisStatus,
        result_count: u32,
        error: Option<String>,
    ) {
        self.events
            .emit(CoreEvent::Item(ItemEvent::Updated {
                item_id: item.id.clone(),
                folder_id: item.folder_id.clone(),
                status: status.to_string(),
                result_count,
                error,
            }))
            .ok();
    }
}
