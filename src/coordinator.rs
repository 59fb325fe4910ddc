//! Index-change coordination.
//!
//! Each index change mints a new operation token and then, in order:
//!
//! 1. pauses the previous item and moves the current index,
//! 2. prepares the current item and waits for it (the priority path),
//! 3. schedules preloads for the rest of the window, closest first,
//! 4. sweeps resources that left the window,
//! 5. asks the feed source for more items when close to the end.
//!
//! A cycle whose token is no longer the latest stops mutating anything: the
//! pool rejects its registrations, and every playback or eviction step checks
//! the token under the same lock that newer index changes take first.

use crate::config::Settings;
use crate::error::{CoordinatorError, PrepareError};
use crate::events::{EventBus, FeedEvent};
use crate::eviction::EvictionSweep;
use crate::feed::{FeedSource, FeedState};
use crate::pipeline::{PreparationPipeline, Prepared};
use crate::pool::{HandleState, OperationToken, ResourcePool};
use crate::window::{Direction, Window};
use anyhow::Result;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of one index change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub token: OperationToken,
    pub index: usize,
    /// The current item had a ready player when the priority path finished.
    pub current_ready: bool,
    /// A newer index change took over before this one finished.
    pub superseded: bool,
}

struct CycleState {
    token: OperationToken,
    center: Option<usize>,
    direction: Direction,
    cancel: CancellationToken,
}

/// Drives preparation, eviction and pagination from index changes.
pub struct IndexChangeCoordinator {
    feed: Arc<RwLock<FeedState>>,
    pool: Arc<ResourcePool>,
    pipeline: Arc<PreparationPipeline>,
    eviction: EvictionSweep,
    source: Arc<dyn FeedSource>,
    events: EventBus,
    settings: Settings,
    cycle: Mutex<CycleState>,
    loading: AtomicBool,
    shutdown: CancellationToken,
}

impl IndexChangeCoordinator {
    pub fn new(
        pool: Arc<ResourcePool>,
        pipeline: Arc<PreparationPipeline>,
        source: Arc<dyn FeedSource>,
        events: EventBus,
        settings: Settings,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            feed: Arc::new(RwLock::new(FeedState::new())),
            eviction: EvictionSweep::new(pool.clone()),
            pool,
            pipeline,
            source,
            events,
            settings,
            cycle: Mutex::new(CycleState {
                token: 0,
                center: None,
                direction: Direction::Unknown,
                cancel: shutdown.child_token(),
            }),
            loading: AtomicBool::new(false),
            shutdown,
        })
    }

    fn cycle(&self) -> MutexGuard<'_, CycleState> {
        self.cycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_feed(&self) -> RwLockReadGuard<'_, FeedState> {
        self.feed.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_feed(&self) -> RwLockWriteGuard<'_, FeedState> {
        self.feed.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared, read-only view of the feed.
    pub fn feed(&self) -> RwLockReadGuard<'_, FeedState> {
        self.read_feed()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.read_feed().current_index()
    }

    /// Change the index in the background and return immediately.
    pub fn request_index(
        self: &Arc<Self>,
        index: usize,
    ) -> JoinHandle<Result<CycleOutcome, CoordinatorError>> {
        let this = self.clone();
        tokio::spawn(async move { this.change_index(index).await })
    }

    /// Make `index` the current item.
    ///
    /// Resolves once the current item is ready (or failed), or as soon as a newer
    /// index change supersedes this one. Preloads continue in the background.
    pub async fn change_index(
        self: &Arc<Self>,
        index: usize,
    ) -> Result<CycleOutcome, CoordinatorError> {
        let (token, current_id, direction, cancel) = {
            let mut cycle = self.cycle();
            let mut feed = self.write_feed();
            if feed.is_empty() {
                return Err(CoordinatorError::EmptyFeed);
            }
            if index >= feed.len() {
                return Err(CoordinatorError::IndexOutOfRange {
                    index,
                    len: feed.len(),
                });
            }

            let old = feed.current_index();
            let (token, stale) = self.pool.supersede();
            cycle.cancel.cancel();
            cycle.cancel = self.shutdown.child_token();
            cycle.token = token;
            cycle.center = Some(index);
            cycle.direction = Direction::between(old, index);
            feed.set_current_index(index);

            for handle in stale {
                handle.release();
            }

            if old.is_some_and(|o| o != index) {
                if let Some(paused) = self.pool.pause_active() {
                    tracing::debug!("Paused {}", paused);
                }
            }

            tracing::info!("Index {:?} -> {} (token {})", old, index, token);
            self.events.emit(FeedEvent::IndexChanged { old, new: index });

            let current_id = feed.id_at(index).unwrap_or_default().to_string();
            (token, current_id, cycle.direction, cycle.cancel.clone())
        };

        let current_ready = self.prepare_current(&current_id, token, &cancel).await;

        if !self.pool.is_current(token) {
            tracing::debug!("Cycle {} superseded before scheduling preloads", token);
            return Ok(CycleOutcome {
                token,
                index,
                current_ready: false,
                superseded: true,
            });
        }

        if current_ready {
            self.start_playback(&current_id, token);
        }
        self.schedule_preloads(token, index, direction, cancel);
        self.evict(token);
        self.maybe_load_more(index);

        Ok(CycleOutcome {
            token,
            index,
            current_ready,
            superseded: !self.pool.is_current(token),
        })
    }

    /// Priority path: get the current item ready before anything else.
    async fn prepare_current(
        &self,
        id: &str,
        token: OperationToken,
        cancel: &CancellationToken,
    ) -> bool {
        if let Some(handle) = self.pool.get(id) {
            if handle.state == HandleState::Ready {
                return true;
            }
        }

        let pipeline = self.pipeline.clone();
        let task_id = id.to_string();
        let task_cancel = cancel.clone();
        let task =
            tokio::spawn(async move { pipeline.prepare(&task_id, token, &task_cancel).await });

        match task.await {
            Ok(Ok(Prepared::Ready(_))) => true,
            Ok(Ok(Prepared::InFlight(_))) => self.wait_until_ready(id, token).await,
            Ok(Err(_)) => false,
            Err(e) => {
                tracing::error!("Preparation task for {} panicked: {}", id, e);
                false
            }
        }
    }

    /// Wait for another task's preparation of `id` to settle.
    async fn wait_until_ready(&self, id: &str, token: OperationToken) -> bool {
        let mut changes = self.pool.subscribe_changes();
        let wait = async {
            loop {
                if !self.pool.is_current(token) {
                    return false;
                }
                match self.pool.get(id) {
                    Some(handle) if handle.state == HandleState::Ready => return true,
                    Some(handle) if handle.is_in_flight() => {}
                    _ => return false,
                }
                if changes.changed().await.is_err() {
                    return false;
                }
            }
        };

        tokio::time::timeout(self.settings.timeouts.current_wait(), wait)
            .await
            .unwrap_or(false)
    }

    /// Play the current item, unless a newer index change already took over.
    fn start_playback(&self, id: &str, token: OperationToken) {
        let cycle = self.cycle();
        if cycle.token != token {
            return;
        }
        let Some(player) = self.pool.activate(id) else {
            return;
        };

        let volume = self.settings.playback.volume;
        if let Err(e) = player.set_volume(volume).and_then(|_| player.play()) {
            tracing::warn!("Failed to start playback of {}: {}", id, e);
        }
    }

    /// Background path: start preparations for the window, closest first.
    fn schedule_preloads(
        self: &Arc<Self>,
        token: OperationToken,
        center: usize,
        direction: Direction,
        cancel: CancellationToken,
    ) {
        let ids: Vec<String> = {
            let feed = self.read_feed();
            Window::new(center, &self.settings.window, direction)
                .priority_order(feed.len())
                .into_iter()
                .filter(|&i| i != center)
                .filter_map(|i| feed.id_at(i).map(str::to_string))
                .collect()
        };
        if ids.is_empty() {
            return;
        }

        let this = self.clone();
        let stagger = self.settings.timeouts.stagger();
        tokio::spawn(async move {
            let mut started = 0usize;
            for id in ids {
                if cancel.is_cancelled() || !this.pool.is_current(token) {
                    tracing::debug!("Preload scheduling for token {} superseded", token);
                    return;
                }
                if this.pool.contains(&id) {
                    continue;
                }
                if started > 0 && !stagger.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(stagger) => {}
                    }
                }
                started += 1;

                let pipeline = this.pipeline.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.prepare(&id, token, &cancel).await {
                        if e == PrepareError::Superseded {
                            tracing::debug!("Preload of {} superseded", id);
                        }
                    }
                });
            }
            tracing::debug!("Scheduled {} preload(s) for token {}", started, token);
        });
    }

    fn evict(&self, token: OperationToken) -> Vec<String> {
        let cycle = self.cycle();
        let Some(center) = cycle.center.filter(|_| cycle.token == token) else {
            return Vec::new();
        };
        let feed = self.read_feed();
        let window = Window::new(center, &self.settings.window, cycle.direction);
        self.eviction.sweep(&feed, &window)
    }

    fn maybe_load_more(self: &Arc<Self>, index: usize) {
        {
            let feed = self.read_feed();
            if feed.is_exhausted() || index + self.settings.pagination.threshold < feed.len() {
                return;
            }
        }
        if self.loading.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.fetch_next_page().await;
            this.loading.store(false, Ordering::SeqCst);
            match result {
                Ok(appended) if appended > 0 => this.extend_window(),
                Ok(_) => {}
                Err(e) => tracing::warn!("Giving up on loading more items: {:#}", e),
            }
        });
    }

    /// Fold appended items into the latest cycle's window.
    ///
    /// The cycle that triggered the fetch may have been superseded meanwhile;
    /// whichever cycle is current now gets the preloads and the next threshold check.
    fn extend_window(self: &Arc<Self>) {
        let (token, center, direction, cancel) = {
            let cycle = self.cycle();
            let Some(center) = cycle.center else {
                return;
            };
            (cycle.token, center, cycle.direction, cycle.cancel.clone())
        };
        if !self.pool.is_current(token) {
            return;
        }
        self.schedule_preloads(token, center, direction, cancel);
        self.maybe_load_more(center);
    }

    /// Load the first page unless items are already loaded.
    pub async fn load_initial(&self) -> Result<usize> {
        if !self.read_feed().is_empty() {
            return Ok(0);
        }
        if self.loading.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let result = self.fetch_next_page().await;
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    /// Fetch and append the next page, retrying with exponential backoff.
    async fn fetch_next_page(&self) -> Result<usize> {
        let pagination = self.settings.pagination;
        let cursor = self.read_feed().load_cursor();
        self.events.emit(FeedEvent::LoadMoreRequested { cursor });
        tracing::info!("Loading feed page {}", cursor);

        let mut attempt = 0;
        let batch = loop {
            match self.source.fetch_batch(cursor, pagination.page_size).await {
                Ok(batch) => break batch,
                Err(e) => {
                    attempt += 1;
                    if attempt >= pagination.max_attempts.max(1) {
                        return Err(e.context(format!("Failed to load page {}", cursor)));
                    }
                    let delay = backoff(pagination.backoff_ms, attempt);
                    tracing::warn!(
                        "Failed to load page {} (attempt {}): {:#}, retrying in {:?}",
                        cursor,
                        attempt,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => anyhow::bail!("shutting down"),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        let (appended, total) = {
            let mut feed = self.write_feed();
            let appended = feed.append_batch(batch, pagination.page_size);
            (appended, feed.len())
        };
        tracing::info!("Appended {} items (feed now {})", appended, total);
        self.events.emit(FeedEvent::ItemsAppended {
            count: appended,
            total,
        });
        Ok(appended)
    }

    /// Re-run preparation for an item after a failure.
    ///
    /// Only items inside the current window are retried. Returns whether the item is ready.
    pub async fn retry(self: &Arc<Self>, id: &str) -> Result<bool, CoordinatorError> {
        let (token, cancel, is_current) = {
            let cycle = self.cycle();
            let feed = self.read_feed();
            let index = feed
                .index_of(id)
                .ok_or_else(|| CoordinatorError::UnknownItem(id.to_string()))?;
            let Some(center) = cycle.center else {
                return Ok(false);
            };
            let window = Window::new(center, &self.settings.window, cycle.direction);
            if !window.keep_set(feed.len()).contains(&index) {
                tracing::debug!("Not retrying {}: outside the window", id);
                return Ok(false);
            }
            (cycle.token, cycle.cancel.clone(), index == center)
        };

        tracing::info!("Retrying {}", id);
        let ready = match self.pipeline.prepare(id, token, &cancel).await {
            Ok(Prepared::Ready(_)) => true,
            Ok(Prepared::InFlight(_)) => self.wait_until_ready(id, token).await,
            Err(_) => false,
        };
        if ready && is_current {
            self.start_playback(id, token);
        }
        Ok(ready)
    }

    /// Cancel all work and release every resource.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down feed coordinator");
        let _cycle = self.cycle();
        self.shutdown.cancel();
        self.pool.supersede();
        for id in self.pool.ids() {
            if let Some(handle) = self.pool.remove(&id) {
                handle.release();
            }
        }
    }
}

/// Exponential backoff with up to 50% jitter.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}
