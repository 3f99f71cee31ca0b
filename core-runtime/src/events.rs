//! # Event Bus System
//!
//! Provides the notification broadcaster for the sync and analysis workers
//! using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for sync, item and folder events
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering (per folder, per kind)
//!
//! Every event names the folder it concerns, so a transport that pushes
//! events to clients (websocket, SSE) can route them to the subscribers of
//! that folder with [`CoreEvent::folder_id`]. [`CoreEvent::name`] yields the
//! wire name (`sync:progress`, `item:updated`, ...).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    emit     ┌───────────┐
//! │ Sync worker     ├────────────>│           │     subscribe    ┌────────────┐
//! └─────────────────┘             │ EventBus  ├─────────────────>│ Subscriber │
//! ┌─────────────────┐    emit     │ (broadcast│                  └────────────┘
//! │ Analysis worker ├────────────>│  channel) │
//! └─────────────────┘             └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, EventStream, FolderEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = EventStream::new(event_bus.subscribe()).for_folder("folder-1");
//!
//! event_bus
//!     .emit(CoreEvent::Folder(FolderEvent::CredentialsExpired {
//!         folder_id: "folder-1".to_string(),
//!         job_id: None,
//!         message: "Reconnect the folder".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.name(), "folder:credentials_expired");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal; the subscriber can continue receiving new events.
//! - **`RecvError::Closed`**: All senders have been dropped. This indicates shutdown.
//!
//! Publishers ignore the "no subscribers" error (`emit(..).ok()`): events are
//! advisory and nobody waits on them.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync job lifecycle events
    Sync(SyncEvent),
    /// Per-item events (ingest, deletion, analysis)
    Item(ItemEvent),
    /// Folder-level events
    Folder(FolderEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Item(e) => e.description(),
            CoreEvent::Folder(e) => e.description(),
        }
    }

    /// Wire name of the event as delivered to clients.
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::Sync(SyncEvent::Started { .. }) => "sync:started",
            CoreEvent::Sync(SyncEvent::Progress { .. }) => "sync:progress",
            CoreEvent::Sync(SyncEvent::Completed { .. }) => "sync:completed",
            CoreEvent::Sync(SyncEvent::Failed { .. }) => "sync:failed",
            CoreEvent::Item(ItemEvent::Updated { .. }) => "item:updated",
            CoreEvent::Item(ItemEvent::Added { .. }) => "items:added",
            CoreEvent::Item(ItemEvent::Deleted { .. }) => "items:deleted",
            CoreEvent::Folder(FolderEvent::CredentialsExpired { .. }) => {
                "folder:credentials_expired"
            }
        }
    }

    /// The synced folder this event concerns.
    pub fn folder_id(&self) -> &str {
        match self {
            CoreEvent::Sync(SyncEvent::Started { folder_id, .. })
            | CoreEvent::Sync(SyncEvent::Progress { folder_id, .. })
            | CoreEvent::Sync(SyncEvent::Completed { folder_id, .. })
            | CoreEvent::Sync(SyncEvent::Failed { folder_id, .. })
            | CoreEvent::Item(ItemEvent::Updated { folder_id, .. })
            | CoreEvent::Item(ItemEvent::Added { folder_id, .. })
            | CoreEvent::Item(ItemEvent::Deleted { folder_id, .. })
            | CoreEvent::Folder(FolderEvent::CredentialsExpired { folder_id, .. }) => folder_id,
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Folder(FolderEvent::CredentialsExpired { .. }) => EventSeverity::Error,
            CoreEvent::Item(ItemEvent::Updated { error: Some(_), .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Started { .. })
            | CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Item counters reported by sync progress and completion events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    /// Items (or change entries) handled so far
    pub processed: u64,
    /// Items (or change entries) in this run
    pub total: u64,
    /// Newly ingested items
    pub new: u64,
    /// Items updated in place
    pub updated: u64,
    /// Items deleted
    pub deleted: u64,
    /// Items whose store write failed
    pub failed: u64,
}

/// Events related to folder synchronization jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// Sync job picked up by a worker.
    Started {
        job_id: String,
        folder_id: String,
        /// Whether the job starts as an incremental diff.
        is_incremental: bool,
    },
    /// Progress update during a sync.
    Progress {
        job_id: String,
        folder_id: String,
        counts: SyncCounts,
        /// Progress percentage (0-100).
        percent: u8,
        is_incremental: bool,
    },
    /// Sync finished successfully.
    Completed {
        job_id: String,
        folder_id: String,
        counts: SyncCounts,
        duration_ms: u64,
        is_incremental: bool,
        /// The incremental diff was empty.
        no_changes: bool,
    },
    /// Sync stopped with an error.
    Failed {
        job_id: String,
        folder_id: String,
        /// Human-readable error message.
        message: String,
        /// Items processed before failure.
        processed: u64,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::Progress { .. } => "Sync in progress",
            SyncEvent::Completed { .. } => "Sync completed successfully",
            SyncEvent::Failed { .. } => "Sync failed",
        }
    }
}

// ============================================================================
// Item Events
// ============================================================================

/// Events about individual synced items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ItemEvent {
    /// Analysis status of an item changed.
    Updated {
        item_id: String,
        folder_id: String,
        /// New analysis status (`pending`, `processing`, `completed`, `failed`).
        status: String,
        /// Number of analysis results stored for the item.
        result_count: u32,
        /// Failure text when the status is `failed`.
        error: Option<String>,
    },
    /// A batch of items was ingested.
    Added {
        folder_id: String,
        item_ids: Vec<String>,
    },
    /// Items were removed from the store.
    Deleted {
        folder_id: String,
        count: u64,
        /// Why the items went away (e.g. `cleanup_orphaned`).
        reason: String,
    },
}

impl ItemEvent {
    fn description(&self) -> &str {
        match self {
            ItemEvent::Updated { .. } => "Item analysis status changed",
            ItemEvent::Added { .. } => "Items added",
            ItemEvent::Deleted { .. } => "Items deleted",
        }
    }
}

// ============================================================================
// Folder Events
// ============================================================================

/// Events about a synced folder as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FolderEvent {
    /// The folder's remote credentials were rejected; the user must reconnect.
    CredentialsExpired {
        folder_id: String,
        job_id: Option<String>,
        message: String,
    },
}

impl FolderEvent {
    fn description(&self) -> &str {
        match self {
            FolderEvent::CredentialsExpired { .. } => "Folder credentials expired",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast channel shared by both workers and every client subscription.
///
/// Emitting never blocks. A subscriber that falls more than `capacity`
/// events behind gets `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fails only when nobody is subscribed; workers ignore that with `.ok()`.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Subscription with an optional predicate, e.g. one folder's events.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Restrict the stream to events about one folder.
    pub fn for_folder(self, folder_id: impl Into<String>) -> Self {
        let folder_id = folder_id.into();
        self.filter(move |event| event.folder_id() == folder_id)
    }

    /// Next event passing the filter. `Lagged(n)` means `n` events were skipped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// `None` when nothing matching is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    /// Drain every event currently buffered that passes the filter.
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Some(result) = self.try_recv() {
            match result {
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        events
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn started(folder: &str) -> CoreEvent {
        CoreEvent::Sync(SyncEvent::Started {
            job_id: "job-1".to_string(),
            folder_id: folder.to_string(),
            is_incremental: false,
        })
    }

    fn completed(folder: &str) -> CoreEvent {
        CoreEvent::Sync(SyncEvent::Completed {
            job_id: "job-1".to_string(),
            folder_id: folder.to_string(),
            counts: SyncCounts {
                processed: 120,
                total: 120,
                new: 120,
                ..Default::default()
            },
            duration_ms: 1500,
            is_incremental: false,
            no_changes: false,
        })
    }

    #[tokio::test]
    async fn test_event_bus_creation() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(started("folder-1")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        let event = started("folder-1");
        assert_eq!(bus.emit(event.clone()).unwrap(), 2);

        assert_eq!(sub1.recv().await.unwrap(), event);
        assert_eq!(sub2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_stream_for_folder_skips_other_folders() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe()).for_folder("folder-b");

        bus.emit(started("folder-a")).ok();
        bus.emit(completed("folder-b")).ok();

        let received = stream.recv().await.unwrap();
        assert_eq!(received, completed("folder-b"));
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for _ in 0..5 {
            bus.emit(started("folder-1")).ok();
        }

        let result = sub.recv().await;
        assert!(matches!(result, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(started("f").name(), "sync:started");
        assert_eq!(completed("f").name(), "sync:completed");
        let updated = CoreEvent::Item(ItemEvent::Updated {
            item_id: "i".to_string(),
            folder_id: "f".to_string(),
            status: "completed".to_string(),
            result_count: 2,
            error: None,
        });
        assert_eq!(updated.name(), "item:updated");
        assert_eq!(updated.folder_id(), "f");
    }

    #[test]
    fn test_event_severity() {
        let failed = CoreEvent::Sync(SyncEvent::Failed {
            job_id: "job-1".to_string(),
            folder_id: "f".to_string(),
            message: "boom".to_string(),
            processed: 3,
        });
        assert_eq!(failed.severity(), EventSeverity::Error);
        assert_eq!(completed("f").severity(), EventSeverity::Info);

        let added = CoreEvent::Item(ItemEvent::Added {
            folder_id: "f".to_string(),
            item_ids: vec!["a".to_string()],
        });
        assert_eq!(added.severity(), EventSeverity::Debug);
    }

    #[tokio::test]
    async fn test_event_serialization() {
        let event = completed("folder-1");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Sync\""));
        assert!(json.contains("\"event\":\"Completed\""));

        let deserialized: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[tokio::test]
    async fn test_drain_collects_buffered_events() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe());

        bus.emit(started("f")).ok();
        bus.emit(completed("f")).ok();

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        assert!(stream.try_recv().is_none());
    }
}
