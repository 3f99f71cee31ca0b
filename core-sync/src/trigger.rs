//! Wake-up channel for the sync orchestrator.
//!
//! Webhooks and manual requests call [`SyncTrigger::notify`] so queued jobs
//! run immediately instead of at the next poll. Signals carry no payload and
//! are coalesced: many notifications while a cycle is pending produce at
//! least one cycle, not one cycle each.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Sending half, cheap to clone.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    tx: mpsc::Sender<()>,
}

/// Receiving half, owned by the orchestrator loop.
#[derive(Debug)]
pub struct TriggerReceiver {
    rx: mpsc::Receiver<()>,
}

/// Create a trigger channel buffering up to `capacity` signals.
pub fn trigger_channel(capacity: usize) -> (SyncTrigger, TriggerReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SyncTrigger { tx }, TriggerReceiver { rx })
}

impl SyncTrigger {
    /// Request a sync cycle without blocking.
    ///
    /// Returns `false` only when the orchestrator has shut down. A full
    /// buffer already guarantees a pending cycle, so the signal is dropped.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                trace!("Sync trigger coalesced");
                true
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

impl TriggerReceiver {
    /// Wait for the next signal, then swallow any that queued up behind it.
    ///
    /// Returns `None` once every [`SyncTrigger`] is dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await?;
        self.drain();
        Some(())
    }

    /// Discard queued signals; returns how many were discarded.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}
