//! Integration tests for the sync orchestrator
//!
//! These tests drive real SQLite repositories against an in-memory remote
//! folder and verify:
//! - Full sync ingestion, batching and idempotence
//! - Orphan cleanup and checkpoint resume
//! - Incremental sync (add/trash/rename, empty diffs, rejected tokens)
//! - Failure handling (credentials, missing folder reference)
//! - Job queueing (deduplication, stale jobs, cancellation)

use async_trait::async_trait;
use bridge_traits::change_feed::{
    ChangeEntry, ChangeFeedClient, DownloadedImage, FolderCredentials, RemoteFile, RemoteFolder,
    FOLDER_MIME_TYPE,
};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::time::{Clock, ManualClock};
use bridge_traits::BridgeError;
use chrono::{TimeZone, Utc};
use core_library::db::create_test_pool;
use core_library::models::{AnalysisCounts, AnalysisStatus, FolderSyncStatus, SyncedFolder, SyncedItem};
use core_library::{LibraryError, Result as LibraryResult};
use core_library::repositories::{
    SqliteSyncedFolderRepository, SqliteSyncedItemRepository, SyncedFolderRepository,
    SyncedItemRepository,
};
use core_runtime::config::SyncWorkerConfig;
use core_runtime::events::{CoreEvent, EventBus, FolderEvent, ItemEvent, SyncCounts, SyncEvent};
use core_runtime::retry::RetryPolicy;
use core_sync::{
    JobKind, SqliteSyncJobRepository, SyncJob, SyncJobRepository, SyncOrchestrator, SyncStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::Receiver;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// In-memory remote folder
// ============================================================================

#[derive(Default)]
struct RemoteState {
    folders: Vec<RemoteFolder>,
    files: Vec<RemoteFile>,
    changes: Vec<ChangeEntry>,
    next_token: String,
    start_token: String,
    rejected_token: Option<String>,
    credentials_revoked: bool,
    parents: HashMap<String, Vec<String>>,
    unreachable_parents: HashSet<String>,
    cancel_on_changes: Option<CancellationToken>,
    listing_gate: Option<ListingGate>,
}

/// Holds each listing call until the test releases it.
#[derive(Clone, Default)]
struct ListingGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl ListingGate {
    /// Wait for the next listing call, run `f`, then let the call finish.
    async fn step<T>(&self, f: impl std::future::Future<Output = T>) -> T {
        self.entered.notified().await;
        let out = f.await;
        self.release.notify_one();
        out
    }
}

#[derive(Default)]
struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    fn new() -> Self {
        let remote = Self::default();
        remote.update(|s| s.start_token = "start-1".to_string());
        remote
    }

    fn update(&self, f: impl FnOnce(&mut RemoteState)) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
    }

    fn set_files(&self, files: Vec<RemoteFile>) {
        self.update(|s| s.files = files);
    }

    fn set_changes(&self, changes: Vec<ChangeEntry>, next_token: &str) {
        self.update(|s| {
            s.changes = changes;
            s.next_token = next_token.to_string();
        });
    }

    async fn pause_listing(&self) {
        let gate = self.state.lock().unwrap().listing_gate.clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    fn check_credentials(&self) -> BridgeResult<()> {
        if self.state.lock().unwrap().credentials_revoked {
            return Err(BridgeError::CredentialsInvalid("invalid_grant".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeedClient for FakeRemote {
    async fn list_folders_recursive(
        &self,
        _: &FolderCredentials,
        _: &str,
    ) -> BridgeResult<Vec<RemoteFolder>> {
        self.pause_listing().await;
        self.check_credentials()?;
        Ok(self.state.lock().unwrap().folders.clone())
    }

    async fn list_images_recursive(
        &self,
        _: &FolderCredentials,
        _: &str,
    ) -> BridgeResult<Vec<RemoteFile>> {
        self.pause_listing().await;
        self.check_credentials()?;
        Ok(self.state.lock().unwrap().files.clone())
    }

    async fn get_changes(
        &self,
        _: &FolderCredentials,
        token: &str,
    ) -> BridgeResult<(Vec<ChangeEntry>, String)> {
        self.check_credentials()?;
        let state = self.state.lock().unwrap();
        if state.rejected_token.as_deref() == Some(token) {
            return Err(BridgeError::InvalidCursor(token.to_string()));
        }
        if let Some(cancel) = &state.cancel_on_changes {
            cancel.cancel();
        }
        Ok((state.changes.clone(), state.next_token.clone()))
    }

    async fn get_start_token(&self, _: &FolderCredentials) -> BridgeResult<String> {
        self.check_credentials()?;
        Ok(self.state.lock().unwrap().start_token.clone())
    }

    async fn resolve_folder_path(&self, _: &FolderCredentials, folder_id: &str) -> BridgeResult<String> {
        Err(BridgeError::NotFound(folder_id.to_string()))
    }

    async fn get_parent_ids(&self, _: &FolderCredentials, entry_id: &str) -> BridgeResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.unreachable_parents.contains(entry_id) {
            return Err(BridgeError::NotFound(entry_id.to_string()));
        }
        Ok(state
            .parents
            .get(entry_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_thumbnail(
        &self,
        _: &FolderCredentials,
        file_id: &str,
        _: u32,
    ) -> BridgeResult<DownloadedImage> {
        Err(BridgeError::NotFound(file_id.to_string()))
    }

    async fn download_file(&self, _: &FolderCredentials, file_id: &str) -> BridgeResult<DownloadedImage> {
        Err(BridgeError::NotFound(file_id.to_string()))
    }
}

/// Item store that fails writes and lookups for chosen remote ids.
struct FailingItems {
    inner: Arc<SqliteSyncedItemRepository>,
    failing: HashSet<String>,
}

impl FailingItems {
    fn wrap(ids: &[&str]) -> impl FnOnce(Arc<SqliteSyncedItemRepository>) -> Arc<dyn SyncedItemRepository> {
        let failing: HashSet<String> = ids.iter().map(|id| id.to_string()).collect();
        move |inner| Arc::new(FailingItems { inner, failing }) as Arc<dyn SyncedItemRepository>
    }

    fn check(&self, remote_id: &str) -> LibraryResult<()> {
        if self.failing.contains(remote_id) {
            return Err(LibraryError::Decode(format!("unreadable row {}", remote_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncedItemRepository for FailingItems {
    async fn find_by_id(&self, id: &str) -> LibraryResult<Option<SyncedItem>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_remote_id(&self, folder_id: &str, remote_id: &str) -> LibraryResult<Option<SyncedItem>> {
        self.check(remote_id)?;
        self.inner.find_by_remote_id(folder_id, remote_id).await
    }

    async fn insert_batch(&self, items: &[SyncedItem]) -> LibraryResult<Vec<String>> {
        for item in items {
            self.check(&item.remote_id)?;
        }
        self.inner.insert_batch(items).await
    }

    async fn update(&self, item: &SyncedItem) -> LibraryResult<()> {
        self.check(&item.remote_id)?;
        self.inner.update(item).await
    }

    async fn delete_by_remote_id(&self, folder_id: &str, remote_id: &str) -> LibraryResult<bool> {
        self.check(remote_id)?;
        self.inner.delete_by_remote_id(folder_id, remote_id).await
    }

    async fn delete_by_remote_folder_id(&self, folder_id: &str, remote_folder_id: &str) -> LibraryResult<u64> {
        self.inner.delete_by_remote_folder_id(folder_id, remote_folder_id).await
    }

    async fn delete_not_in(&self, folder_id: &str, keep: &HashSet<String>) -> LibraryResult<u64> {
        self.inner.delete_not_in(folder_id, keep).await
    }

    async fn find_by_analysis_status(&self, status: AnalysisStatus, limit: u32) -> LibraryResult<Vec<SyncedItem>> {
        self.inner.find_by_analysis_status(status, limit).await
    }

    async fn update_analysis_status(
        &self,
        id: &str,
        status: AnalysisStatus,
        result_count: i64,
        error: Option<&str>,
        now: i64,
    ) -> LibraryResult<()> {
        self.inner
            .update_analysis_status(id, status, result_count, error, now)
            .await
    }

    async fn reset_stuck_processing(&self, updated_before: i64) -> LibraryResult<u64> {
        self.inner.reset_stuck_processing(updated_before).await
    }

    async fn count_by_folder(&self, folder_id: &str) -> LibraryResult<i64> {
        self.inner.count_by_folder(folder_id).await
    }

    async fn analysis_counts(&self, folder_id: Option<&str>) -> LibraryResult<AnalysisCounts> {
        self.inner.analysis_counts(folder_id).await
    }
}

// ============================================================================
// Harness
// ============================================================================

const ROOT: &str = "root";

struct Harness {
    orchestrator: SyncOrchestrator,
    remote: Arc<FakeRemote>,
    folders: Arc<SqliteSyncedFolderRepository>,
    items: Arc<SqliteSyncedItemRepository>,
    jobs: Arc<SqliteSyncJobRepository>,
    clock: Arc<ManualClock>,
    events: Receiver<CoreEvent>,
    folder: SyncedFolder,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(SyncWorkerConfig::default()).await
    }

    async fn with_config(config: SyncWorkerConfig) -> Self {
        Self::with_item_store(config, |items| items as Arc<dyn SyncedItemRepository>).await
    }

    /// Let the orchestrator see the item store through `wrap`; assertions
    /// still read the real store.
    async fn with_item_store(
        config: SyncWorkerConfig,
        wrap: impl FnOnce(Arc<SqliteSyncedItemRepository>) -> Arc<dyn SyncedItemRepository>,
    ) -> Self {
        let pool = create_test_pool().await.unwrap();
        let remote = Arc::new(FakeRemote::new());
        let folders = Arc::new(SqliteSyncedFolderRepository::new(pool.clone()));
        let items = Arc::new(SqliteSyncedItemRepository::new(pool.clone()));
        let jobs = Arc::new(SqliteSyncJobRepository::new(pool));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()));
        let bus = Arc::new(EventBus::new(1024));
        let events = bus.subscribe();

        let folder = SyncedFolder::new(
            ROOT,
            "Family",
            FolderCredentials::new("access", "refresh"),
            clock.unix_timestamp(),
        );
        folders.insert(&folder).await.unwrap();

        let orchestrator = SyncOrchestrator::new(
            config.with_retry(RetryPolicy::none()),
            remote.clone(),
            folders.clone(),
            wrap(items.clone()),
            jobs.clone(),
            bus,
            clock.clone(),
        );

        Self {
            orchestrator,
            remote,
            folders,
            items,
            jobs,
            clock,
            events,
            folder,
        }
    }

    /// Enqueue a manual sync and run one cycle to completion.
    async fn sync(&mut self) -> SyncJob {
        let job = self
            .orchestrator
            .enqueue_sync(&self.folder.id, JobKind::Manual)
            .await
            .unwrap();
        self.orchestrator.run_once(&CancellationToken::new()).await.unwrap();
        self.jobs.find_by_id(&job.id).await.unwrap().unwrap()
    }

    fn drain_events(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn stored_folder(&self) -> SyncedFolder {
        self.folders.find_by_id(&self.folder.id).await.unwrap().unwrap()
    }

    async fn item(&self, remote_id: &str) -> Option<SyncedItem> {
        self.items.find_by_remote_id(&self.folder.id, remote_id).await.unwrap()
    }

    async fn item_count(&self) -> i64 {
        self.items.count_by_folder(&self.folder.id).await.unwrap()
    }
}

fn image(id: &str, parent: &str) -> RemoteFile {
    RemoteFile {
        id: id.to_string(),
        name: format!("{}.jpg", id),
        mime_type: "image/jpeg".to_string(),
        size: 2048,
        parent_id: Some(parent.to_string()),
        created_time: None,
        modified_time: None,
        thumbnail_url: None,
        web_view_url: None,
        trashed: false,
    }
}

fn images(count: usize) -> Vec<RemoteFile> {
    (0..count).map(|i| image(&format!("img-{:03}", i), ROOT)).collect()
}

fn completed(events: &[CoreEvent]) -> Option<(SyncCounts, bool, bool)> {
    events.iter().find_map(|e| match e {
        CoreEvent::Sync(SyncEvent::Completed {
            counts,
            is_incremental,
            no_changes,
            ..
        }) => Some((*counts, *is_incremental, *no_changes)),
        _ => None,
    })
}

fn added_ids(events: &[CoreEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::Item(ItemEvent::Added { item_ids, .. }) => Some(item_ids.clone()),
            _ => None,
        })
        .collect()
}

fn deletions(events: &[CoreEvent]) -> Vec<(u64, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::Item(ItemEvent::Deleted { count, reason, .. }) => Some((*count, reason.clone())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Full sync
// ============================================================================

#[tokio::test]
async fn test_first_sync_ingests_every_image_in_batches() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(120));

    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(h.item_count().await, 120);

    let batches: Vec<usize> = added_ids(&events).iter().map(Vec::len).collect();
    assert_eq!(batches, vec![100, 20]);

    let (counts, is_incremental, no_changes) = completed(&events).unwrap();
    assert_eq!(counts.new, 120);
    assert_eq!(counts.processed, 120);
    assert!(!is_incremental);
    assert!(!no_changes);

    assert!(matches!(
        events.first(),
        Some(CoreEvent::Sync(SyncEvent::Started { is_incremental: false, .. }))
    ));
    let last_progress = events
        .iter()
        .filter_map(|e| match e {
            CoreEvent::Sync(SyncEvent::Progress { percent, .. }) => Some(*percent),
            _ => None,
        })
        .last();
    assert_eq!(last_progress, Some(100));

    let folder = h.stored_folder().await;
    assert_eq!(folder.sync_status, FolderSyncStatus::Idle);
    assert_eq!(folder.change_token, "start-1");
    assert!(folder.last_synced_at.is_some());

    let item = h.item("img-007").await.unwrap();
    assert_eq!(item.path, "Family");
}

#[tokio::test]
async fn test_nested_images_get_folder_paths() {
    let mut h = Harness::new().await;
    h.remote.update(|s| {
        s.folders = vec![
            RemoteFolder {
                id: "trips".to_string(),
                name: "Trips".to_string(),
                parent_id: Some(ROOT.to_string()),
            },
            RemoteFolder {
                id: "y2024".to_string(),
                name: "2024".to_string(),
                parent_id: Some("trips".to_string()),
            },
        ];
        s.files = vec![image("a", ROOT), image("b", "trips"), image("c", "y2024")];
    });

    h.sync().await;

    assert_eq!(h.item("a").await.unwrap().path, "Family");
    assert_eq!(h.item("b").await.unwrap().path, "Family/Trips");
    assert_eq!(h.item("c").await.unwrap().path, "Family/Trips/2024");
}

#[tokio::test]
async fn test_repeated_full_sync_is_idempotent() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(10));
    h.sync().await;
    h.drain_events();

    // Forget the change token so the next run lists everything again
    h.folders
        .update_change_token(&h.folder.id, "", h.clock.unix_timestamp())
        .await
        .unwrap();
    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(h.item_count().await, 10);
    assert!(added_ids(&events).is_empty());

    let (counts, _, _) = completed(&events).unwrap();
    assert_eq!(counts.new, 0);
    assert_eq!(counts.updated, 0);
    assert_eq!(counts.deleted, 0);
}

#[tokio::test]
async fn test_full_sync_removes_orphaned_items() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(5));
    h.sync().await;
    h.drain_events();

    h.remote.set_files(images(3));
    h.folders
        .update_change_token(&h.folder.id, "", h.clock.unix_timestamp())
        .await
        .unwrap();
    h.sync().await;
    let events = h.drain_events();

    assert_eq!(h.item_count().await, 3);
    assert!(h.item("img-004").await.is_none());
    assert_eq!(deletions(&events), vec![(2, "cleanup_orphaned".to_string())]);
    assert_eq!(completed(&events).unwrap().0.deleted, 2);
}

#[tokio::test]
async fn test_full_sync_resumes_after_checkpoint() {
    let mut h = Harness::new().await;
    let files = images(120);
    h.remote.set_files(files.clone());

    // A previous run stored the first 50 items and checkpointed
    let now = h.clock.unix_timestamp();
    let already: Vec<SyncedItem> = files[..50]
        .iter()
        .map(|f| SyncedItem::from_remote(&h.folder.id, f, "Family", now))
        .collect();
    h.items.insert_batch(&already).await.unwrap();

    let mut job = SyncJob::new(h.folder.id.clone(), JobKind::Manual, now);
    job.metadata.checkpoint("img-049", 50);
    job.counts = SyncCounts {
        processed: 50,
        total: 120,
        new: 50,
        ..SyncCounts::default()
    };
    h.jobs.insert(&job).await.unwrap();

    h.orchestrator.run_once(&CancellationToken::new()).await.unwrap();
    let events = h.drain_events();

    let added: Vec<String> = added_ids(&events).into_iter().flatten().collect();
    assert_eq!(added.len(), 70);
    assert!(already.iter().all(|item| !added.contains(&item.id)));

    let (counts, _, _) = completed(&events).unwrap();
    assert_eq!(counts.new, 120);
    assert_eq!(counts.processed, 120);
    assert_eq!(h.item_count().await, 120);

    let stored = h.jobs.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Completed);
    assert!(stored.metadata.last_processed_id.is_none());
}

#[tokio::test]
async fn test_store_failures_are_counted_per_item() {
    let config = SyncWorkerConfig {
        insert_batch_size: 2,
        ..SyncWorkerConfig::default()
    };
    let mut h = Harness::with_item_store(config, FailingItems::wrap(&["img-002", "img-004"])).await;
    h.remote.set_files(images(6));

    let job = h.sync().await;
    let events = h.drain_events();

    // img-002 fails its lookup; the batch holding img-004 fails as a whole
    assert_eq!(job.status, SyncStatus::Completed);
    let (counts, _, _) = completed(&events).unwrap();
    assert_eq!(counts.processed, 6);
    assert_eq!(counts.new, 3);
    assert_eq!(counts.failed, 3);
    assert_eq!(job.counts.failed, 3);

    assert_eq!(h.item_count().await, 3);
    for id in ["img-000", "img-001", "img-005"] {
        assert!(h.item(id).await.is_some(), "{} should be stored", id);
    }
    assert_eq!(h.stored_folder().await.sync_status, FolderSyncStatus::Idle);
}

// ============================================================================
// Incremental sync
// ============================================================================

#[tokio::test]
async fn test_empty_change_feed_completes_without_changes() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(2));
    h.sync().await;
    h.drain_events();

    h.remote.set_changes(Vec::new(), "tok-2");
    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    assert!(job.metadata.is_incremental);
    let (counts, is_incremental, no_changes) = completed(&events).unwrap();
    assert_eq!(counts, SyncCounts::default());
    assert!(is_incremental);
    assert!(no_changes);
    assert_eq!(h.stored_folder().await.change_token, "tok-2");
}

#[tokio::test]
async fn test_trashed_file_is_deleted_incrementally() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(3));
    h.sync().await;
    h.drain_events();

    let mut trashed = image("img-001", ROOT);
    trashed.trashed = true;
    h.remote.set_changes(
        vec![ChangeEntry {
            file_id: "img-001".to_string(),
            removed: false,
            file: Some(trashed),
        }],
        "tok-2",
    );

    h.sync().await;
    let events = h.drain_events();

    let (counts, is_incremental, _) = completed(&events).unwrap();
    assert_eq!(counts.deleted, 1);
    assert!(is_incremental);
    assert_eq!(deletions(&events), vec![(1, "trashed".to_string())]);
    assert!(h.item("img-001").await.is_none());
    assert_eq!(h.item_count().await, 2);
    assert_eq!(h.stored_folder().await.change_token, "tok-2");
}

#[tokio::test]
async fn test_incremental_adds_new_images_inside_the_folder_only() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(1));
    h.sync().await;
    h.drain_events();

    h.remote.update(|s| {
        s.parents.insert("elsewhere".to_string(), vec!["other-root".to_string()]);
    });
    h.remote.set_changes(
        vec![
            ChangeEntry {
                file_id: "new-1".to_string(),
                removed: false,
                file: Some(image("new-1", ROOT)),
            },
            ChangeEntry {
                file_id: "outside".to_string(),
                removed: false,
                file: Some(image("outside", "elsewhere")),
            },
        ],
        "tok-2",
    );

    h.sync().await;
    let events = h.drain_events();

    assert_eq!(completed(&events).unwrap().0.new, 1);
    assert_eq!(added_ids(&events).len(), 1);
    assert!(h.item("new-1").await.is_some());
    assert!(h.item("outside").await.is_none());
}

#[tokio::test]
async fn test_folder_rename_rewrites_item_paths() {
    let mut h = Harness::new().await;
    h.remote.update(|s| {
        s.folders = vec![RemoteFolder {
            id: "trips".to_string(),
            name: "Trips".to_string(),
            parent_id: Some(ROOT.to_string()),
        }];
        s.files = vec![image("beach", "trips")];
    });
    h.sync().await;
    assert_eq!(h.item("beach").await.unwrap().path, "Family/Trips");

    let renamed = RemoteFile {
        id: "trips".to_string(),
        name: "Holidays".to_string(),
        mime_type: FOLDER_MIME_TYPE.to_string(),
        size: 0,
        parent_id: Some(ROOT.to_string()),
        created_time: None,
        modified_time: None,
        thumbnail_url: None,
        web_view_url: None,
        trashed: false,
    };
    h.remote.set_changes(
        vec![ChangeEntry {
            file_id: "trips".to_string(),
            removed: false,
            file: Some(renamed),
        }],
        "tok-2",
    );

    let job = h.sync().await;

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(h.item("beach").await.unwrap().path, "Family/Holidays");
}

#[tokio::test]
async fn test_unresolvable_change_does_not_block_the_feed() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(3));
    h.sync().await;
    h.drain_events();

    // "sub-x" is inside the folder but its path cannot be resolved;
    // "sub-y" cannot even be placed in the tree
    h.remote.update(|s| {
        s.parents.insert("sub-x".to_string(), vec![ROOT.to_string()]);
        s.unreachable_parents.insert("sub-y".to_string());
    });
    let mut trashed = image("img-001", ROOT);
    trashed.trashed = true;
    h.remote.set_changes(
        vec![
            ChangeEntry {
                file_id: "new-1".to_string(),
                removed: false,
                file: Some(image("new-1", "sub-x")),
            },
            ChangeEntry {
                file_id: "lost-1".to_string(),
                removed: false,
                file: Some(image("lost-1", "sub-y")),
            },
            ChangeEntry {
                file_id: "img-001".to_string(),
                removed: false,
                file: Some(trashed),
            },
        ],
        "tok-2",
    );

    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    let (counts, is_incremental, _) = completed(&events).unwrap();
    assert!(is_incremental);
    assert_eq!(counts.new, 1);
    assert_eq!(counts.deleted, 1);
    assert_eq!(counts.processed, 3);

    assert_eq!(h.item("new-1").await.unwrap().path, "Family");
    assert!(h.item("lost-1").await.is_none());
    assert!(h.item("img-001").await.is_none());

    let folder = h.stored_folder().await;
    assert_eq!(folder.sync_status, FolderSyncStatus::Idle);
    assert_eq!(folder.change_token, "tok-2");
}

#[tokio::test]
async fn test_unresolvable_folder_rename_counts_as_failed_item() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(1));
    h.sync().await;
    h.drain_events();

    // Parent of the renamed folder is inside the tree but has no known path
    h.remote.update(|s| {
        s.parents.insert("sub-x".to_string(), vec![ROOT.to_string()]);
    });
    let renamed = RemoteFile {
        id: "nested".to_string(),
        name: "Renamed".to_string(),
        mime_type: FOLDER_MIME_TYPE.to_string(),
        size: 0,
        parent_id: Some("sub-x".to_string()),
        created_time: None,
        modified_time: None,
        thumbnail_url: None,
        web_view_url: None,
        trashed: false,
    };
    h.remote.set_changes(
        vec![ChangeEntry {
            file_id: "nested".to_string(),
            removed: false,
            file: Some(renamed),
        }],
        "tok-2",
    );

    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    assert_eq!(completed(&events).unwrap().0.failed, 1);
    assert_eq!(h.stored_folder().await.change_token, "tok-2");
}

#[tokio::test]
async fn test_incremental_store_failure_counts_and_advances_token() {
    let mut h = Harness::with_item_store(SyncWorkerConfig::default(), FailingItems::wrap(&["img-000"])).await;
    h.remote.set_files(images(2));
    h.items
        .insert_batch(&[SyncedItem::from_remote(
            &h.folder.id,
            &image("img-000", ROOT),
            "Family",
            h.clock.unix_timestamp(),
        )])
        .await
        .unwrap();
    h.sync().await;
    h.drain_events();

    h.remote.set_changes(
        vec![
            ChangeEntry {
                file_id: "img-000".to_string(),
                removed: true,
                file: None,
            },
            ChangeEntry {
                file_id: "new-1".to_string(),
                removed: false,
                file: Some(image("new-1", ROOT)),
            },
        ],
        "tok-2",
    );
    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    let (counts, is_incremental, _) = completed(&events).unwrap();
    assert!(is_incremental);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.new, 1);
    assert!(h.item("img-000").await.is_some());
    assert!(h.item("new-1").await.is_some());
    assert_eq!(h.stored_folder().await.change_token, "tok-2");
}

#[tokio::test]
async fn test_rejected_change_token_falls_back_to_full_sync() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(4));
    h.sync().await;
    h.drain_events();

    h.remote.update(|s| {
        s.rejected_token = Some("start-1".to_string());
        s.start_token = "start-2".to_string();
    });
    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Completed);
    let (counts, is_incremental, _) = completed(&events).unwrap();
    assert!(!is_incremental);
    assert_eq!(counts.processed, 4);
    assert_eq!(h.stored_folder().await.change_token, "start-2");
}

// ============================================================================
// Failures and queueing
// ============================================================================

#[tokio::test]
async fn test_revoked_credentials_fail_job_and_notify() {
    let mut h = Harness::new().await;
    h.remote.update(|s| s.credentials_revoked = true);

    let job = h.sync().await;
    let events = h.drain_events();

    assert_eq!(job.status, SyncStatus::Failed);
    assert!(job.error_message.is_some());

    let folder = h.stored_folder().await;
    assert_eq!(folder.sync_status, FolderSyncStatus::Error);
    assert!(folder.last_error.is_some());

    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::Sync(SyncEvent::Failed { .. }))));
    let expired = events.iter().find_map(|e| match e {
        CoreEvent::Folder(FolderEvent::CredentialsExpired { folder_id, job_id, .. }) => {
            Some((folder_id.clone(), job_id.clone()))
        }
        _ => None,
    });
    assert_eq!(expired, Some((h.folder.id.clone(), Some(job.id.to_string()))));

    assert_eq!(h.orchestrator.stats().jobs_failed, 1);
}

#[tokio::test]
async fn test_job_without_folder_fails() {
    let mut h = Harness::new().await;
    let mut job = SyncJob::new(h.folder.id.clone(), JobKind::Scheduled, h.clock.unix_timestamp());
    job.folder_id = None;
    h.jobs.insert(&job).await.unwrap();

    let claimed = h.orchestrator.run_once(&CancellationToken::new()).await.unwrap();
    let events = h.drain_events();

    assert_eq!(claimed, 1);
    let stored = h.jobs.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Failed);
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::Sync(SyncEvent::Failed { .. }))));
    assert!(!events
        .iter()
        .any(|e| matches!(e, CoreEvent::Sync(SyncEvent::Started { .. }))));
}

#[tokio::test]
async fn test_enqueue_reuses_live_job_and_replaces_stale_one() {
    let h = Harness::new().await;

    let first = h
        .orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Manual)
        .await
        .unwrap();
    let again = h
        .orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Webhook)
        .await
        .unwrap();
    assert_eq!(first.id, again.id);

    h.clock.advance(std::time::Duration::from_secs(31 * 60));
    let fresh = h
        .orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Manual)
        .await
        .unwrap();

    assert_ne!(fresh.id, first.id);
    let stale = h.jobs.find_by_id(&first.id).await.unwrap().unwrap();
    assert_eq!(stale.status, SyncStatus::Failed);
}

#[tokio::test]
async fn test_listing_heartbeat_keeps_long_job_alive() {
    let h = Harness::new().await;
    h.remote.set_files(images(2));
    let gate = ListingGate::default();
    h.remote.update(|s| s.listing_gate = Some(gate.clone()));
    let first = h
        .orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Manual)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let driver = async {
        gate.step(async { h.clock.advance(std::time::Duration::from_secs(20 * 60)) })
            .await;
        // 40 minutes since the claim, 20 since the heartbeat after the folder listing
        gate.step(async {
            h.clock.advance(std::time::Duration::from_secs(20 * 60));
            h.orchestrator
                .enqueue_sync(&h.folder.id, JobKind::Webhook)
                .await
                .unwrap()
        })
        .await
    };
    let (ran, during) = tokio::join!(h.orchestrator.run_once(&cancel), driver);

    assert_eq!(ran.unwrap(), 1);
    assert_eq!(during.id, first.id);
    let stored = h.jobs.find_by_id(&first.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Completed);
    assert_eq!(h.item_count().await, 2);
}

#[tokio::test]
async fn test_job_failed_as_stale_mid_listing_is_not_resurrected() {
    let h = Harness::new().await;
    h.remote.set_files(images(2));
    let gate = ListingGate::default();
    h.remote.update(|s| s.listing_gate = Some(gate.clone()));
    let first = h
        .orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Manual)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let driver = async {
        let replacement = gate
            .step(async {
                h.clock.advance(std::time::Duration::from_secs(31 * 60));
                h.orchestrator
                    .enqueue_sync(&h.folder.id, JobKind::Manual)
                    .await
                    .unwrap()
            })
            .await;
        gate.step(async {}).await;
        replacement
    };
    let (ran, replacement) = tokio::join!(h.orchestrator.run_once(&cancel), driver);
    ran.unwrap();

    assert_ne!(replacement.id, first.id);
    let stale = h.jobs.find_by_id(&first.id).await.unwrap().unwrap();
    assert_eq!(stale.status, SyncStatus::Failed);
    assert!(stale.error_message.unwrap().contains("staleness"));

    let queued = h.jobs.find_by_id(&replacement.id).await.unwrap().unwrap();
    assert_eq!(queued.status, SyncStatus::Pending);
}

#[tokio::test]
async fn test_enqueue_unknown_folder_is_rejected() {
    let h = Harness::new().await;
    let result = h.orchestrator.enqueue_sync("missing", JobKind::Manual).await;
    assert!(matches!(result, Err(core_sync::SyncError::FolderNotFound { .. })));
}

#[tokio::test]
async fn test_cancelled_incremental_requeues_without_advancing_token() {
    let mut h = Harness::new().await;
    h.remote.set_files(images(2));
    h.sync().await;

    let cancel = CancellationToken::new();
    h.remote.update(|s| s.cancel_on_changes = Some(cancel.clone()));
    h.remote.set_changes(
        vec![ChangeEntry {
            file_id: "img-000".to_string(),
            removed: true,
            file: None,
        }],
        "tok-2",
    );

    let job = h
        .orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Manual)
        .await
        .unwrap();
    h.orchestrator.run_once(&cancel).await.unwrap();

    let stored = h.jobs.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncStatus::Pending);

    let folder = h.stored_folder().await;
    assert_eq!(folder.change_token, "start-1");
    assert_eq!(folder.sync_status, FolderSyncStatus::Idle);
    assert!(h.item("img-000").await.is_some());
    assert_eq!(h.orchestrator.stats().jobs_requeued, 1);
}

#[tokio::test]
async fn test_run_loop_processes_triggered_jobs_and_stops() {
    let h = Harness::new().await;
    h.remote.set_files(images(3));
    let orchestrator = Arc::new(h.orchestrator);
    let cancel = CancellationToken::new();

    let worker = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    let job = orchestrator
        .enqueue_sync(&h.folder.id, JobKind::Manual)
        .await
        .unwrap();

    let mut status = SyncStatus::Pending;
    for _ in 0..100 {
        status = h.jobs.find_by_id(&job.id).await.unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(status, SyncStatus::Completed);
    assert!(orchestrator.stats().running);

    cancel.cancel();
    worker.await.unwrap().unwrap();
    assert!(!orchestrator.stats().running);
    assert_eq!(h.items.count_by_folder(&h.folder.id).await.unwrap(), 3);
}
