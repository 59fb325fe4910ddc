//! UI-facing events emitted by the preload engine.
//!
//! Subscribers receive every event published after they subscribe. Slow
//! subscribers may observe `Lagged` from the broadcast channel; the engine never
//! blocks on them.

use crate::error::PrepareError;
use tokio::sync::broadcast;

/// Events from the feed engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// An item's resource became ready to play, or stopped being ready.
    ReadinessChanged { id: String, ready: bool },
    /// The current index moved.
    IndexChanged { old: Option<usize>, new: usize },
    /// More items were requested from the feed source.
    LoadMoreRequested { cursor: u64 },
    /// A batch was appended to the feed.
    ItemsAppended { count: usize, total: usize },
    /// Preparing an item failed; the UI shows a placeholder with retry.
    PreparationFailed { id: String, error: PrepareError },
}

/// Broadcast bus for [`FeedEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FeedEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: FeedEvent) {
        tracing::trace!("Event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
