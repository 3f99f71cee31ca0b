//! # Sync Orchestrator
//!
//! Drains the sync job queue and keeps every synced folder consistent with
//! its remote counterpart.
//!
//! ## Overview
//!
//! The `SyncOrchestrator` runs as one long-lived background task. Each cycle
//! it atomically claims up to `max_concurrent_jobs` pending jobs and runs each
//! on its own task, bounded by a semaphore. A cycle starts on a timer tick or
//! as soon as a [`SyncTrigger`] fires (webhook, manual "sync now").
//!
//! ## Workflow
//!
//! For each claimed job:
//! 1. Resolve the job's folder (a job without one fails immediately)
//! 2. Mark the folder `syncing` and broadcast `sync:started`
//! 3. Run an incremental sync if the folder has completed a sync before,
//!    otherwise a full sync. A rejected change token falls back to a full
//!    sync with the token cleared.
//! 4. On success store the new change token, mark the folder `idle` and the
//!    job `completed`, broadcast `sync:completed`
//! 5. On failure mark the folder `error` and the job `failed`, broadcast
//!    `sync:failed` (plus `folder:credentials_expired` for credential errors)
//! 6. On cancellation persist the checkpoint and return the job to `pending`
//!
//! ## Usage
//!
//! ```rust,ignore
//! let orchestrator = Arc::new(SyncOrchestrator::new(config, client, folders, items, jobs, events, clock));
//! let cancel = CancellationToken::new();
//! tokio::spawn({
//!     let orchestrator = orchestrator.clone();
//!     let cancel = cancel.clone();
//!     async move { orchestrator.run(cancel).await }
//! });
//!
//! orchestrator.enqueue_sync(&folder_id, JobKind::Manual).await?;
//! ```

use crate::context::{SyncContext, SyncOutcome};
use crate::full_sync::run_full_sync;
use crate::incremental_sync::run_incremental_sync;
use crate::trigger::{trigger_channel, SyncTrigger, TriggerReceiver};
use crate::{JobKind, Result, SyncError, SyncJob, SyncJobId, SyncJobRepository};
use bridge_traits::change_feed::ChangeFeedClient;
use bridge_traits::time::Clock;
use core_library::models::{FolderSyncStatus, SyncedFolder};
use core_library::repositories::{SyncedFolderRepository, SyncedItemRepository};
use core_runtime::config::SyncWorkerConfig;
use core_runtime::events::{CoreEvent, EventBus, FolderEvent, SyncEvent};
use core_runtime::logging::truncate_token;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const CREDENTIALS_EXPIRED_MESSAGE: &str =
    "Remote access expired or was revoked. Reconnect the folder to resume syncing.";

/// Snapshot of orchestrator activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub running: bool,
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobDisposition {
    Completed,
    Failed,
    Requeued,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

/// Synchronization orchestrator
pub struct SyncOrchestrator {
    ctx: SyncContext,
    trigger: SyncTrigger,
    receiver: Mutex<Option<TriggerReceiver>>,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    counters: Arc<Counters>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncWorkerConfig,
        client: Arc<dyn ChangeFeedClient>,
        folders: Arc<dyn SyncedFolderRepository>,
        items: Arc<dyn SyncedItemRepository>,
        jobs: Arc<dyn SyncJobRepository>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (trigger, receiver) = trigger_channel(config.trigger_buffer);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        Self {
            ctx: SyncContext {
                client,
                folders,
                items,
                jobs,
                events,
                clock,
                config,
            },
            trigger,
            receiver: Mutex::new(Some(receiver)),
            semaphore,
            running: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Handle that wakes the orchestrator between polls.
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    pub fn config(&self) -> &SyncWorkerConfig {
        &self.ctx.config
    }

    /// Run the poll/trigger loop until `cancel` fires.
    ///
    /// Jobs left `running` by a previous process are returned to the queue
    /// first; their checkpoints let them resume.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] if another `run` is active.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or(SyncError::AlreadyRunning)?;
        self.running.store(true, Ordering::SeqCst);

        match self.ctx.jobs.requeue_running(self.ctx.now()).await {
            Ok(0) => {}
            Ok(requeued) => info!(requeued, "Requeued jobs interrupted by a previous shutdown"),
            Err(e) => warn!(error = %e, "Failed to requeue interrupted jobs"),
        }

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            max_concurrent_jobs = self.ctx.config.max_concurrent_jobs,
            poll_interval_secs = self.ctx.config.poll_interval.as_secs(),
            "Sync orchestrator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                signal = receiver.recv() => {
                    if signal.is_some() {
                        debug!("Sync cycle triggered");
                    }
                }
            }

            // Keep draining while every slot was filled
            loop {
                match self.run_once(&cancel).await {
                    Ok(claimed) if claimed >= self.ctx.config.max_concurrent_jobs => {
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        error!(error = %e, "Sync cycle failed");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        *self.receiver.lock().await = Some(receiver);
        info!("Sync orchestrator stopped");
        Ok(())
    }

    /// Claim up to `max_concurrent_jobs` pending jobs and run them to a
    /// terminal state (or back to pending when `cancel` fires).
    ///
    /// Returns the number of jobs claimed.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Ok(0);
        }

        let limit = self.ctx.config.max_concurrent_jobs as u32;
        let claimed = self.ctx.jobs.claim_pending(limit, self.ctx.now()).await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        let count = claimed.len();
        debug!(count, "Processing claimed sync jobs");

        let mut workers = JoinSet::new();
        for job in claimed {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SyncError::Database(format!("Semaphore closed: {}", e)))?;
            let ctx = self.ctx.clone();
            let cancel = cancel.clone();
            let counters = self.counters.clone();

            workers.spawn(async move {
                counters.active.fetch_add(1, Ordering::SeqCst);
                let disposition = process_job(&ctx, job, &cancel).await;
                counters.active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);

                match disposition {
                    JobDisposition::Completed => counters.completed.fetch_add(1, Ordering::SeqCst),
                    JobDisposition::Failed => counters.failed.fetch_add(1, Ordering::SeqCst),
                    JobDisposition::Requeued => counters.requeued.fetch_add(1, Ordering::SeqCst),
                };
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Sync worker task panicked");
            }
        }

        Ok(count)
    }

    /// Queue a sync for a folder and wake the orchestrator.
    ///
    /// Active jobs for the folder that have not been touched within the
    /// staleness threshold are failed first. A remaining live job is
    /// returned instead of creating a duplicate.
    #[instrument(skip(self))]
    pub async fn enqueue_sync(&self, folder_id: &str, kind: JobKind) -> Result<SyncJob> {
        if self.ctx.folders.find_by_id(folder_id).await?.is_none() {
            return Err(SyncError::FolderNotFound {
                folder_id: folder_id.to_string(),
            });
        }

        let now = self.ctx.now();
        let threshold = self.ctx.config.stale_job_threshold.as_secs() as i64;
        let stale = self
            .ctx
            .jobs
            .fail_stale_for_folder(folder_id, now - threshold + 1, now)
            .await?;
        if stale > 0 {
            warn!(stale, "Failed stale sync jobs before enqueueing");
        }

        if let Some(active) = self.ctx.jobs.find_active_for_folder(folder_id).await? {
            debug!(job_id = %active.id, status = %active.status, "Reusing active sync job");
            self.trigger.notify();
            return Ok(active);
        }

        let job = SyncJob::new(folder_id, kind, now);
        self.ctx.jobs.insert(&job).await?;
        self.trigger.notify();

        info!(job_id = %job.id, kind = %kind, "Enqueued sync job");
        Ok(job)
    }

    pub async fn find_job(&self, id: &SyncJobId) -> Result<Option<SyncJob>> {
        self.ctx.jobs.find_by_id(id).await
    }

    pub async fn history_for_folder(&self, folder_id: &str, limit: u32) -> Result<Vec<SyncJob>> {
        self.ctx.jobs.history_for_folder(folder_id, limit).await
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            running: self.running.load(Ordering::SeqCst),
            active_jobs: self.counters.active.load(Ordering::SeqCst),
            max_concurrent_jobs: self.ctx.config.max_concurrent_jobs,
            jobs_completed: self.counters.completed.load(Ordering::SeqCst),
            jobs_failed: self.counters.failed.load(Ordering::SeqCst),
            jobs_requeued: self.counters.requeued.load(Ordering::SeqCst),
        }
    }
}

// ============================================================================
// Job processing
// ============================================================================

#[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind))]
async fn process_job(ctx: &SyncContext, job: SyncJob, cancel: &CancellationToken) -> JobDisposition {
    let folder_id = match job.folder_reference() {
        Ok(id) => id.to_string(),
        Err(e) => return fail_job(ctx, job, None, &e).await,
    };

    let folder = match ctx.folders.find_by_id(&folder_id).await {
        Ok(Some(folder)) => folder,
        Ok(None) => {
            let e = SyncError::FolderNotFound { folder_id };
            return fail_job(ctx, job, None, &e).await;
        }
        Err(e) => return fail_job(ctx, job, None, &SyncError::Library(e)).await,
    };

    let started = Instant::now();
    let incremental = !folder.needs_full_sync();

    if let Err(e) = ctx
        .folders
        .update_sync_status(&folder.id, FolderSyncStatus::Syncing, None, ctx.now())
        .await
    {
        warn!(error = %e, "Failed to mark folder syncing");
    }
    ctx.emit(CoreEvent::Sync(SyncEvent::Started {
        job_id: job.id.to_string(),
        folder_id: folder.id.clone(),
        is_incremental: incremental,
    }));
    info!(folder_id = %folder.id, incremental, "Sync job started");

    let mut job = job;
    let result = run_strategy(ctx, &mut job, &folder, incremental, cancel).await;

    match result {
        Ok(SyncOutcome::Completed {
            counts,
            change_token,
            no_changes,
        }) => {
            let now = ctx.now();
            if let Err(e) = ctx.folders.mark_synced(&folder.id, &change_token, now).await {
                return fail_job(ctx, job, Some(&folder), &SyncError::Library(e)).await;
            }

            let is_incremental = job.metadata.is_incremental;
            let job_id = job.id;
            match job.complete(counts, now) {
                Ok(done) => persist_outcome(ctx, &done).await,
                Err(e) => warn!(error = %e, "Completed job rejected transition"),
            }

            ctx.emit(CoreEvent::Sync(SyncEvent::Completed {
                job_id: job_id.to_string(),
                folder_id: folder.id.clone(),
                counts,
                duration_ms: started.elapsed().as_millis() as u64,
                is_incremental,
                no_changes,
            }));
            info!(
                new = counts.new,
                updated = counts.updated,
                deleted = counts.deleted,
                failed = counts.failed,
                no_changes,
                "Sync job completed"
            );
            JobDisposition::Completed
        }
        Ok(SyncOutcome::Interrupted { .. }) | Err(SyncError::Cancelled) => {
            requeue_job(ctx, job, &folder).await
        }
        Err(e) => fail_job(ctx, job, Some(&folder), &e).await,
    }
}

/// Incremental when possible; a rejected change token clears the token and
/// runs a full sync in the same job.
async fn run_strategy(
    ctx: &SyncContext,
    job: &mut SyncJob,
    folder: &SyncedFolder,
    incremental: bool,
    cancel: &CancellationToken,
) -> Result<SyncOutcome> {
    if !incremental {
        return run_full_sync(ctx, job, folder, cancel).await;
    }

    match run_incremental_sync(ctx, job, folder, cancel).await {
        Err(SyncError::Remote(e)) if e.is_invalid_cursor() => {
            warn!(
                token = %truncate_token(&folder.change_token),
                error = %e,
                "Change token rejected, falling back to full sync"
            );
            ctx.folders
                .update_change_token(&folder.id, "", ctx.now())
                .await?;

            let mut folder = folder.clone();
            folder.change_token.clear();
            job.metadata.clear_checkpoint();
            run_full_sync(ctx, job, &folder, cancel).await
        }
        other => other,
    }
}

/// Store a job leaving `running`. A job force-failed as stale meanwhile keeps
/// its failed status.
async fn persist_outcome(ctx: &SyncContext, job: &SyncJob) {
    match ctx.jobs.finish_running(job).await {
        Ok(true) => {}
        Ok(false) => warn!(
            job_id = %job.id,
            status = %job.status,
            "Job was failed as stale while running, outcome not stored"
        ),
        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to persist job outcome"),
    }
}

async fn requeue_job(ctx: &SyncContext, job: SyncJob, folder: &SyncedFolder) -> JobDisposition {
    let job_id = job.id;
    match job.requeue(ctx.now()) {
        Ok(pending) => persist_outcome(ctx, &pending).await,
        Err(e) => warn!(error = %e, "Interrupted job rejected requeue"),
    }
    if let Err(e) = ctx
        .folders
        .update_sync_status(&folder.id, FolderSyncStatus::Idle, None, ctx.now())
        .await
    {
        warn!(error = %e, "Failed to reset folder status");
    }

    info!(job_id = %job_id, "Sync job interrupted, requeued");
    JobDisposition::Requeued
}

async fn fail_job(
    ctx: &SyncContext,
    job: SyncJob,
    folder: Option<&SyncedFolder>,
    error: &SyncError,
) -> JobDisposition {
    let credentials_expired = matches!(error, SyncError::CredentialsExpired { .. });
    let message = if credentials_expired {
        CREDENTIALS_EXPIRED_MESSAGE.to_string()
    } else {
        error.to_string()
    };

    let job_id = job.id;
    let folder_id = folder
        .map(|f| f.id.clone())
        .or_else(|| job.folder_id.clone())
        .unwrap_or_default();
    let processed = job.counts.processed;

    error!(job_id = %job_id, folder_id = %folder_id, error = %error, "Sync job failed");

    match job.fail(message.clone(), ctx.now()) {
        Ok(failed) => persist_outcome(ctx, &failed).await,
        Err(e) => warn!(error = %e, "Failed job rejected transition"),
    }

    if let Some(folder) = folder {
        if let Err(e) = ctx
            .folders
            .update_sync_status(&folder.id, FolderSyncStatus::Error, Some(&message), ctx.now())
            .await
        {
            warn!(error = %e, "Failed to mark folder error");
        }
    }

    ctx.emit(CoreEvent::Sync(SyncEvent::Failed {
        job_id: job_id.to_string(),
        folder_id: folder_id.clone(),
        message: message.clone(),
        processed,
    }));

    if credentials_expired {
        ctx.emit(CoreEvent::Folder(FolderEvent::CredentialsExpired {
            folder_id,
            job_id: Some(job_id.to_string()),
            message,
        }));
    }

    JobDisposition::Failed
}
