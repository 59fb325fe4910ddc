//! Eviction sweep: drop every resource outside the window around the current item.

use crate::feed::FeedState;
use crate::pool::ResourcePool;
use crate::window::Window;
use std::collections::HashSet;
use std::sync::Arc;

/// Removes handles that fell out of the keep set.
pub struct EvictionSweep {
    pool: Arc<ResourcePool>,
}

impl EvictionSweep {
    pub fn new(pool: Arc<ResourcePool>) -> Self {
        Self { pool }
    }

    /// Evict everything outside `window`, never the item at its center.
    ///
    /// In-flight preparations are cancelled, playing players paused, and all
    /// removed handles released. Returns the evicted ids.
    pub fn sweep(&self, feed: &FeedState, window: &Window) -> Vec<String> {
        let keep: HashSet<&str> = window
            .keep_set(feed.len())
            .into_iter()
            .filter_map(|index| feed.id_at(index))
            .collect();
        let current = feed.id_at(window.center);

        let mut evicted = Vec::new();
        for id in self.pool.ids() {
            if keep.contains(id.as_str()) || current == Some(id.as_str()) {
                continue;
            }
            // Already gone is fine: another sweep or a failed preparation got there first.
            if let Some(handle) = self.pool.remove(&id) {
                tracing::debug!("Evicting {} ({:?})", id, handle.state);
                handle.release();
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            tracing::debug!(
                "Evicted {} resource(s) around index {}",
                evicted.len(),
                window.center
            );
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowSettings;
    use crate::events::EventBus;
    use crate::feed::FeedBatch;
    use crate::player::PlaybackSink;
    use crate::pool::{BeginPrepare, HandleState, ResourceHandle};
    use crate::testing::{id, item, RecordingPlayer};
    use crate::window::Direction;
    use tokio_util::sync::CancellationToken;

    fn feed(n: usize) -> FeedState {
        let mut feed = FeedState::new();
        feed.append_batch(
            FeedBatch {
                items: (0..n).map(item).collect(),
            },
            n,
        );
        feed
    }

    fn window(center: usize, radius: usize) -> Window {
        let settings = WindowSettings {
            backward_radius: radius,
            forward_radius: radius,
            preload_extra: 0,
        };
        Window::new(center, &settings, Direction::Unknown)
    }

    fn ready(pool: &ResourcePool, id: &str) -> Arc<RecordingPlayer> {
        let BeginPrepare::Started(ticket) =
            pool.begin_preparing(id, pool.latest_token(), CancellationToken::new())
        else {
            panic!("{} already tracked", id);
        };
        let player = Arc::new(RecordingPlayer::default());
        pool.promote(&ticket, player.clone(), None).unwrap();
        player
    }

    #[test]
    fn test_sweep_removes_outside_window() {
        let pool = Arc::new(ResourcePool::new(EventBus::default()));
        let feed = feed(10);
        for i in 0..10 {
            ready(&pool, &id(i));
        }

        let mut evicted = EvictionSweep::new(pool.clone()).sweep(&feed, &window(9, 3));
        evicted.sort();
        assert_eq!(evicted, (0..6).map(id).collect::<Vec<_>>());

        let mut remaining = pool.ids();
        remaining.sort();
        assert_eq!(remaining, (6..10).map(id).collect::<Vec<_>>());
    }

    #[test]
    fn test_sweep_never_evicts_current() {
        let pool = Arc::new(ResourcePool::new(EventBus::default()));
        let feed = feed(10);
        for i in [0, 4, 5, 9] {
            ready(&pool, &id(i));
        }

        let evicted = EvictionSweep::new(pool.clone()).sweep(&feed, &window(5, 0));
        assert!(!evicted.contains(&id(5)));
        assert_eq!(pool.ids(), vec![id(5)]);
    }

    #[test]
    fn test_sweep_cancels_in_flight_and_releases_players() {
        let pool = Arc::new(ResourcePool::new(EventBus::default()));
        let feed = feed(10);
        let far = ready(&pool, &id(8));
        far.play().unwrap();
        let BeginPrepare::Started(pending) =
            pool.begin_preparing(&id(9), pool.latest_token(), CancellationToken::new())
        else {
            panic!("expected a new preparation");
        };
        pool.upsert(&id(0), ResourceHandle::idle(id(0), CancellationToken::new()));

        EvictionSweep::new(pool.clone()).sweep(&feed, &window(0, 1));

        assert!(pending.cancel.is_cancelled());
        assert!(!far.is_playing());
        assert!(far.is_released());
        assert_eq!(pool.get(&id(0)).unwrap().state, HandleState::Idle);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_sweep_on_empty_pool_is_noop() {
        let pool = Arc::new(ResourcePool::new(EventBus::default()));
        assert!(EvictionSweep::new(pool)
            .sweep(&feed(3), &window(1, 1))
            .is_empty());
    }
}
