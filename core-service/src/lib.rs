//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided collaborators (the remote file store
//! client, the detection service client, a clock) into the shared Rust core:
//! it opens the SQLite store, builds the repositories, and owns the two
//! background workers (sync and analysis) together with their cancellation.
//!
//! Hosts call into [`CoreService`] to add or remove folders, request syncs,
//! forward webhook notifications and read status; everything else is
//! reported through the event bus.

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::change_feed::{ChangeFeedClient, FolderCredentials};
use bridge_traits::detection::DetectionClient;
use bridge_traits::time::{Clock, SystemClock};
use core_analysis::{AnalysisOrchestrator, AnalysisStats};
use core_library::db::{create_pool, DatabaseConfig, SqlitePool};
use core_library::models::{AnalysisCounts, SyncedFolder};
use core_library::repositories::{
    AnalysisResultRepository, SqliteAnalysisResultRepository, SqliteSyncedFolderRepository,
    SqliteSyncedItemRepository, SyncedFolderRepository, SyncedItemRepository,
};
use core_runtime::config::WorkerConfig;
use core_runtime::events::{EventBus, EventStream};
use core_sync::{
    JobKind, SqliteSyncJobRepository, SyncJob, SyncJobId, SyncJobRepository, SyncOrchestrator,
    SyncStats,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators supplied by the host.
pub struct CoreDependencies {
    pub change_feed: Arc<dyn ChangeFeedClient>,
    pub detector: Arc<dyn DetectionClient>,
    pub clock: Arc<dyn Clock>,
}

impl CoreDependencies {
    pub fn new(change_feed: Arc<dyn ChangeFeedClient>, detector: Arc<dyn DetectionClient>) -> Self {
        Self {
            change_feed,
            detector,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Combined worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub sync: SyncStats,
    pub analysis: AnalysisStats,
    pub items: AnalysisCounts,
}

struct Workers {
    cancel: CancellationToken,
    sync: JoinHandle<core_sync::Result<()>>,
    analysis: JoinHandle<core_analysis::Result<()>>,
}

/// Primary façade exposed to host applications.
pub struct CoreService {
    folders: Arc<dyn SyncedFolderRepository>,
    items: Arc<dyn SyncedItemRepository>,
    results: Arc<dyn AnalysisResultRepository>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    sync: Arc<SyncOrchestrator>,
    analysis: Arc<AnalysisOrchestrator>,
    workers: Mutex<Option<Workers>>,
}

impl CoreService {
    /// Open the database at `config.database_path` and build the service.
    pub async fn bootstrap(config: WorkerConfig, deps: CoreDependencies) -> Result<Self> {
        config.validate()?;

        let pool = create_pool(DatabaseConfig::new(config.database_path.clone()))
            .await
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;

        info!(database = %config.database_path.display(), "Core service initialized");
        Ok(Self::with_pool(config, deps, pool))
    }

    /// Build the service on an existing (migrated) pool.
    pub fn with_pool(config: WorkerConfig, deps: CoreDependencies, pool: SqlitePool) -> Self {
        let folders: Arc<dyn SyncedFolderRepository> =
            Arc::new(SqliteSyncedFolderRepository::new(pool.clone()));
        let items: Arc<dyn SyncedItemRepository> =
            Arc::new(SqliteSyncedItemRepository::new(pool.clone()));
        let results: Arc<dyn AnalysisResultRepository> =
            Arc::new(SqliteAnalysisResultRepository::new(pool.clone()));
        let jobs: Arc<dyn SyncJobRepository> = Arc::new(SqliteSyncJobRepository::new(pool));
        let events = Arc::new(EventBus::new(config.event_buffer_size));

        let sync = Arc::new(SyncOrchestrator::new(
            config.sync.clone(),
            deps.change_feed.clone(),
            folders.clone(),
            items.clone(),
            jobs,
            events.clone(),
            deps.clock.clone(),
        ));
        let analysis = Arc::new(AnalysisOrchestrator::new(
            config.analysis.clone(),
            deps.detector,
            deps.change_feed,
            folders.clone(),
            items.clone(),
            results.clone(),
            events.clone(),
            deps.clock.clone(),
        ));

        Self {
            folders,
            items,
            results,
            events,
            clock: deps.clock,
            sync,
            analysis,
            workers: Mutex::new(None),
        }
    }

    // ========================================================================
    // Worker lifecycle
    // ========================================================================

    /// Spawn the sync and analysis workers. Calling `start` twice is a no-op.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            debug!("Workers already running");
            return;
        }

        let cancel = CancellationToken::new();
        let sync = tokio::spawn({
            let sync = self.sync.clone();
            let cancel = cancel.clone();
            async move { sync.run(cancel).await }
        });
        let analysis = tokio::spawn({
            let analysis = self.analysis.clone();
            let cancel = cancel.clone();
            async move { analysis.run(cancel).await }
        });

        *workers = Some(Workers {
            cancel,
            sync,
            analysis,
        });
        info!("Background workers started");
    }

    /// Signal both workers and wait for them to persist their progress and exit.
    pub async fn stop(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };
        workers.cancel.cancel();

        match workers.sync.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Sync worker exited with error"),
            Err(e) => error!(error = %e, "Sync worker panicked"),
        }
        match workers.analysis.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Analysis worker exited with error"),
            Err(e) => error!(error = %e, "Analysis worker panicked"),
        }
        info!("Background workers stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    // ========================================================================
    // Folders
    // ========================================================================

    /// Start syncing a remote folder. The initial full sync is queued right away.
    #[instrument(skip(self, credentials))]
    pub async fn add_folder(
        &self,
        remote_folder_id: &str,
        name: &str,
        credentials: FolderCredentials,
    ) -> Result<SyncedFolder> {
        if !credentials.is_usable() {
            return Err(CoreError::InvalidInput(
                "Folder credentials need a refresh token".to_string(),
            ));
        }
        if let Some(existing) = self.folders.find_by_remote_id(remote_folder_id).await? {
            return Err(CoreError::FolderAlreadySynced {
                remote_folder_id: remote_folder_id.to_string(),
                folder_id: existing.id,
            });
        }

        let folder = SyncedFolder::new(
            remote_folder_id,
            name,
            credentials,
            self.clock.unix_timestamp(),
        );
        self.folders.insert(&folder).await?;
        self.sync.enqueue_sync(&folder.id, JobKind::Initial).await?;

        info!(folder_id = %folder.id, "Folder added");
        Ok(folder)
    }

    /// Stop syncing a folder and drop its items and analysis results.
    pub async fn remove_folder(&self, folder_id: &str) -> Result<bool> {
        let removed = self.folders.delete(folder_id).await?;
        if removed {
            info!(folder_id, "Folder removed");
        }
        Ok(removed)
    }

    /// Store fresh credentials after a `folder:credentials_expired` event and
    /// queue a sync to catch up.
    #[instrument(skip(self, credentials))]
    pub async fn reconnect_folder(
        &self,
        folder_id: &str,
        credentials: FolderCredentials,
    ) -> Result<SyncJob> {
        if !credentials.is_usable() {
            return Err(CoreError::InvalidInput(
                "Folder credentials need a refresh token".to_string(),
            ));
        }
        self.folders
            .update_credentials(folder_id, &credentials, self.clock.unix_timestamp())
            .await?;
        Ok(self.sync.enqueue_sync(folder_id, JobKind::Manual).await?)
    }

    pub async fn folders(&self) -> Result<Vec<SyncedFolder>> {
        Ok(self.folders.list().await?)
    }

    pub async fn folder(&self, folder_id: &str) -> Result<Option<SyncedFolder>> {
        Ok(self.folders.find_by_id(folder_id).await?)
    }

    // ========================================================================
    // Sync requests
    // ========================================================================

    /// "Sync now".
    pub async fn request_sync(&self, folder_id: &str) -> Result<SyncJob> {
        Ok(self.sync.enqueue_sync(folder_id, JobKind::Manual).await?)
    }

    /// Handle a remote push notification for a folder.
    ///
    /// `sync` (channel established) and `change` notifications queue a sync;
    /// any other resource state is acknowledged and ignored.
    #[instrument(skip(self))]
    pub async fn handle_webhook(
        &self,
        folder_id: &str,
        resource_state: &str,
    ) -> Result<Option<SyncJob>> {
        match resource_state {
            "sync" | "change" => {
                let job = self.sync.enqueue_sync(folder_id, JobKind::Webhook).await?;
                Ok(Some(job))
            }
            other => {
                debug!(resource_state = other, "Ignoring webhook notification");
                Ok(None)
            }
        }
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let id = SyncJobId::from_string(job_id)?;
        Ok(self.sync.find_job(&id).await?)
    }

    pub async fn sync_history(&self, folder_id: &str, limit: u32) -> Result<Vec<SyncJob>> {
        Ok(self.sync.history_for_folder(folder_id, limit).await?)
    }

    // ========================================================================
    // Events and status
    // ========================================================================

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Subscribe to the events of one folder.
    pub fn subscribe_folder(&self, folder_id: &str) -> EventStream {
        EventStream::new(self.events.subscribe()).for_folder(folder_id)
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let items = match self.items.analysis_counts(None).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "Failed to count items");
                AnalysisCounts::default()
            }
        };
        Ok(ServiceStats {
            sync: self.sync.stats(),
            analysis: self.analysis.stats(),
            items,
        })
    }

    /// Number of analysis results stored for a folder.
    pub async fn result_count(&self, folder_id: &str) -> Result<i64> {
        Ok(self.results.count_by_folder(folder_id).await?)
    }
}
