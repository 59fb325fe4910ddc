//! Resource pool: the single source of truth for per-item player handles.
//!
//! Every mutation happens under one mutex and leaves the map consistent, so
//! concurrent callers never observe a half-applied change. The pool also mints
//! the operation tokens used to detect superseded index changes; minting and
//! the matching cleanup happen under the same lock as promotion, so a task
//! holding an old token can never register a result after a newer token exists.
//!
//! Handles are returned by value (cheap clones sharing the player). Removal
//! hands the handle back so the caller can [`ResourceHandle::release`] the
//! player outside the lock.

use crate::error::PrepareError;
use crate::events::{EventBus, FeedEvent};
use crate::player::PlaybackSink;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Monotonic id of an index-change request.
pub type OperationToken = u64;

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Preparing,
    Ready,
    Failed,
}

/// A per-item resource slot.
#[derive(Clone)]
pub struct ResourceHandle {
    pub id: String,
    pub state: HandleState,
    pub player: Option<Arc<dyn PlaybackSink>>,
    pub ready: bool,
    pub created_at: Instant,
    generation: u64,
    token: OperationToken,
    cancel: CancellationToken,
    observer: Option<AbortHandle>,
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ready", &self.ready)
            .field("has_player", &self.player.is_some())
            .field("generation", &self.generation)
            .field("token", &self.token)
            .finish()
    }
}

impl ResourceHandle {
    /// A fresh idle handle. Generation and token are assigned on insertion.
    pub fn idle(id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: id.into(),
            state: HandleState::Idle,
            player: None,
            ready: false,
            created_at: Instant::now(),
            generation: 0,
            token: 0,
            cancel,
            observer: None,
        }
    }

    /// Unique id of this slot instance; a re-prepared item gets a new generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Operation token that created this handle.
    pub fn token(&self) -> OperationToken {
        self.token
    }

    /// Cancellation signal of the preparation filling this handle.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, HandleState::Idle | HandleState::Preparing)
    }

    /// Whether `other` refers to the same slot instance.
    pub fn same_slot(&self, other: &ResourceHandle) -> bool {
        self.id == other.id && self.generation == other.generation
    }

    /// Cancel pending preparation, drop observers and free the player.
    ///
    /// Best-effort and idempotent; a handle without a player only cancels.
    pub fn release(&self) {
        self.cancel.cancel();
        if let Some(observer) = &self.observer {
            observer.abort();
        }
        if let Some(player) = &self.player {
            if player.is_playing() {
                if let Err(e) = player.pause() {
                    tracing::debug!("Failed to pause {} before release: {}", self.id, e);
                }
            }
            player.release();
        }
    }
}

/// Outcome of [`ResourcePool::begin_preparing`].
#[derive(Debug)]
pub enum BeginPrepare {
    /// A new Preparing handle was inserted; the caller owns filling it.
    Started(PrepareTicket),
    /// The item is already ready.
    Ready(ResourceHandle),
    /// Another task is already preparing the item.
    InFlight(ResourceHandle),
    /// The caller's token is no longer the latest.
    Superseded,
}

/// Proof of ownership of a Preparing handle.
#[derive(Debug, Clone)]
pub struct PrepareTicket {
    pub id: String,
    pub generation: u64,
    pub token: OperationToken,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    handles: HashMap<String, ResourceHandle>,
    latest_token: OperationToken,
    next_generation: u64,
    /// Slot (id, generation) allowed to drive playback.
    active: Option<(String, u64)>,
}

impl PoolState {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn active_player(&self) -> Option<Arc<dyn PlaybackSink>> {
        let (id, generation) = self.active.as_ref()?;
        self.handles
            .get(id)
            .filter(|h| h.generation == *generation)
            .and_then(|h| h.player.clone())
    }
}

/// Concurrency-safe store of resource handles keyed by item id.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    events: EventBus,
    changes: watch::Sender<u64>,
}

impl ResourcePool {
    pub fn new(events: EventBus) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(PoolState::default()),
            events,
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Receiver that changes after every pool mutation.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<ResourceHandle> {
        self.lock().handles.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }

    /// Ids currently tracked, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.lock().handles.keys().cloned().collect()
    }

    /// Consistent copy of every handle.
    pub fn snapshot(&self) -> HashMap<String, ResourceHandle> {
        self.lock().handles.clone()
    }

    /// Insert `handle` unless the id is already tracked. Returns whether it was inserted.
    pub fn upsert(&self, id: &str, mut handle: ResourceHandle) -> bool {
        let inserted = {
            let mut state = self.lock();
            if state.handles.contains_key(id) {
                false
            } else {
                handle.id = id.to_string();
                handle.generation = state.next_generation();
                handle.token = state.latest_token;
                state.handles.insert(id.to_string(), handle);
                true
            }
        };
        if inserted {
            self.notify();
        }
        inserted
    }

    /// Flip the readiness flag of a handle. No-op for unknown ids.
    pub fn set_ready(&self, id: &str, ready: bool) {
        let changed = {
            let mut state = self.lock();
            match state.handles.get_mut(id) {
                Some(handle) if handle.ready != ready => {
                    handle.ready = ready;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.events.emit(FeedEvent::ReadinessChanged {
                id: id.to_string(),
                ready,
            });
            self.notify();
        }
    }

    /// Remove and return a handle. The caller releases it.
    pub fn remove(&self, id: &str) -> Option<ResourceHandle> {
        let removed = self.lock().handles.remove(id);
        if let Some(handle) = &removed {
            tracing::debug!("Removed handle {} ({:?})", id, handle.state);
            self.after_removal(handle);
        }
        removed
    }

    fn after_removal(&self, handle: &ResourceHandle) {
        if handle.ready {
            self.events.emit(FeedEvent::ReadinessChanged {
                id: handle.id.clone(),
                ready: false,
            });
        }
        self.notify();
    }

    /// Latest minted operation token.
    pub fn latest_token(&self) -> OperationToken {
        self.lock().latest_token
    }

    pub fn is_current(&self, token: OperationToken) -> bool {
        self.lock().latest_token == token
    }

    /// Mint a new operation token and drop every in-flight handle created under an older one.
    ///
    /// The returned handles must be released by the caller.
    pub fn supersede(&self) -> (OperationToken, Vec<ResourceHandle>) {
        let (token, stale) = {
            let mut state = self.lock();
            state.latest_token += 1;
            let token = state.latest_token;
            let stale_ids: Vec<String> = state
                .handles
                .values()
                .filter(|h| h.is_in_flight() && h.token < token)
                .map(|h| h.id.clone())
                .collect();
            let stale: Vec<ResourceHandle> = stale_ids
                .iter()
                .filter_map(|id| state.handles.remove(id))
                .collect();
            (token, stale)
        };

        if !stale.is_empty() {
            tracing::debug!(
                "Token {} superseded {} in-flight preparation(s)",
                token,
                stale.len()
            );
            self.notify();
        }
        (token, stale)
    }

    /// Atomically check for an existing handle or create a Preparing one.
    pub fn begin_preparing(
        &self,
        id: &str,
        token: OperationToken,
        cancel: CancellationToken,
    ) -> BeginPrepare {
        let (outcome, violation) = {
            let mut state = self.lock();
            if state.latest_token != token {
                return BeginPrepare::Superseded;
            }

            let mut violation = None;
            match state.handles.get(id).map(|h| h.state) {
                Some(HandleState::Ready) => {
                    return BeginPrepare::Ready(state.handles[id].clone());
                }
                Some(HandleState::Idle | HandleState::Preparing) => {
                    return BeginPrepare::InFlight(state.handles[id].clone());
                }
                Some(HandleState::Failed) => {
                    violation =
                        invariant_violation(&mut state, id, "failed handle still tracked".into());
                }
                None => {}
            }

            let mut handle = ResourceHandle::idle(id, cancel.clone());
            handle.generation = state.next_generation();
            handle.token = token;
            handle.state = HandleState::Preparing;
            let ticket = PrepareTicket {
                id: id.to_string(),
                generation: handle.generation,
                token,
                cancel,
            };
            state.handles.insert(id.to_string(), handle);
            (BeginPrepare::Started(ticket), violation)
        };

        if let Some(stale) = violation {
            stale.release();
        }
        tracing::debug!("Preparing {}", id);
        self.notify();
        outcome
    }

    /// Register a finished player into the ticket's handle and mark it Ready.
    ///
    /// Fails without touching the pool if the ticket's token was superseded or
    /// its handle was cancelled, evicted or replaced; the caller then owns the
    /// player and must release it.
    pub fn promote(
        &self,
        ticket: &PrepareTicket,
        player: Arc<dyn PlaybackSink>,
        observer: Option<AbortHandle>,
    ) -> Result<ResourceHandle, PrepareError> {
        let (result, violation) = {
            let mut state = self.lock();
            if state.latest_token != ticket.token {
                return Err(PrepareError::Superseded);
            }

            let current = match state.handles.get(&ticket.id) {
                Some(h) if h.generation == ticket.generation && !h.cancel.is_cancelled() => h.state,
                _ => return Err(PrepareError::Cancelled),
            };

            if current != HandleState::Preparing {
                let what = format!("promoting handle in state {:?}", current);
                let violation = invariant_violation(&mut state, &ticket.id, what.clone());
                (Err(PrepareError::PoolInvariantViolation(what)), violation)
            } else if let Some(handle) = state.handles.get_mut(&ticket.id) {
                handle.player = Some(player);
                handle.observer = observer;
                handle.ready = true;
                handle.state = HandleState::Ready;
                (Ok(handle.clone()), None)
            } else {
                return Err(PrepareError::Cancelled);
            }
        };

        if let Some(stale) = violation {
            stale.release();
            self.notify();
        }
        if result.is_ok() {
            tracing::debug!("{} is ready", ticket.id);
            self.events.emit(FeedEvent::ReadinessChanged {
                id: ticket.id.clone(),
                ready: true,
            });
            self.notify();
        }
        result
    }

    /// Demote the ticket's handle to Failed and remove it.
    ///
    /// Returns the removed handle, or `None` if the slot was already gone or replaced.
    pub fn discard(&self, id: &str, generation: u64) -> Option<ResourceHandle> {
        let removed = {
            let mut state = self.lock();
            match state.handles.get(id) {
                Some(handle) if handle.generation == generation => {
                    state.handles.remove(id).map(|mut handle| {
                        handle.state = HandleState::Failed;
                        handle
                    })
                }
                _ => None,
            }
        };
        if let Some(handle) = &removed {
            tracing::debug!("Discarded handle {}", id);
            self.after_removal(handle);
        }
        removed
    }

    /// Hand playback ownership to the Ready handle of `id` and return its player.
    ///
    /// Returns `None` (and leaves ownership unchanged) if `id` has no ready player.
    pub fn activate(&self, id: &str) -> Option<Arc<dyn PlaybackSink>> {
        let mut state = self.lock();
        let (generation, player) = match state.handles.get(id) {
            Some(h) if h.state == HandleState::Ready => (h.generation, h.player.clone()?),
            _ => return None,
        };
        state.active = Some((id.to_string(), generation));
        Some(player)
    }

    /// Revoke playback ownership and pause the owning player.
    ///
    /// The pause runs under the pool lock, so a concurrent [`with_active`](Self::with_active)
    /// either completes before it or observes that the slot is no longer active.
    pub fn pause_active(&self) -> Option<String> {
        let mut state = self.lock();
        let player = state.active_player();
        let (id, _) = state.active.take()?;
        if let Some(player) = player.filter(|p| p.is_playing()) {
            if let Err(e) = player.pause() {
                tracing::warn!("Failed to pause {}: {}", id, e);
            }
        }
        Some(id)
    }

    /// Run `f` on the player of slot (`id`, `generation`) only while it owns playback.
    pub fn with_active<R>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&dyn PlaybackSink) -> R,
    ) -> Option<R> {
        let state = self.lock();
        match &state.active {
            Some((active, g)) if active == id && *g == generation => {}
            _ => return None,
        }
        let player = state.active_player()?;
        Some(f(player.as_ref()))
    }
}

/// Log a broken invariant and forcibly clear the offending handle.
///
/// Fatal in debug builds.
fn invariant_violation(state: &mut PoolState, id: &str, what: String) -> Option<ResourceHandle> {
    tracing::error!("Pool invariant violated for {}: {}", id, what);
    debug_assert!(false, "pool invariant violated for {}: {}", id, what);
    state.handles.remove(id)
}
