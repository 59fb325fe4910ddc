//! Preparation pipeline: item id in, ready player handle out.
//!
//! Steps, each bounded and cancellable:
//!
//! 1. claim the item in the pool (or return the existing handle),
//! 2. resolve the media URL,
//! 3. load the asset and its metadata,
//! 4. build the player and attach its observer,
//! 5. promote the handle to Ready.
//!
//! Any failure or cancellation removes the Preparing handle and releases
//! whatever was built, so no half-prepared state outlives the call.

use crate::config::{PlaybackSettings, TimeoutSettings};
use crate::error::PrepareError;
use crate::events::{EventBus, FeedEvent};
use crate::player::{MediaBackend, PlaybackSink, PlayerEvent};
use crate::pool::{BeginPrepare, OperationToken, PrepareTicket, ResourceHandle, ResourcePool};
use crate::resolver::MediaResolver;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Result of a successful [`PreparationPipeline::prepare`] call.
#[derive(Debug)]
pub enum Prepared {
    /// The item has a ready handle (new or pre-existing).
    Ready(ResourceHandle),
    /// Another task is already preparing the item; nothing was started.
    InFlight(ResourceHandle),
}

/// Turns item ids into ready-to-play resources registered in the pool.
pub struct PreparationPipeline {
    pool: Arc<ResourcePool>,
    resolver: Arc<dyn MediaResolver>,
    backend: Arc<dyn MediaBackend>,
    events: EventBus,
    timeouts: TimeoutSettings,
    playback: PlaybackSettings,
}

impl PreparationPipeline {
    pub fn new(
        pool: Arc<ResourcePool>,
        resolver: Arc<dyn MediaResolver>,
        backend: Arc<dyn MediaBackend>,
        events: EventBus,
        timeouts: TimeoutSettings,
        playback: PlaybackSettings,
    ) -> Self {
        Self {
            pool,
            resolver,
            backend,
            events,
            timeouts,
            playback,
        }
    }

    /// Prepare `id` under operation `token`.
    ///
    /// Cancelling `cancel` (or evicting the handle) aborts the preparation and
    /// removes its handle. Failures are logged and published as
    /// [`FeedEvent::PreparationFailed`] before being returned.
    pub async fn prepare(
        &self,
        id: &str,
        token: OperationToken,
        cancel: &CancellationToken,
    ) -> Result<Prepared, PrepareError> {
        let ticket = match self.pool.begin_preparing(id, token, cancel.child_token()) {
            BeginPrepare::Started(ticket) => ticket,
            BeginPrepare::Ready(handle) => return Ok(Prepared::Ready(handle)),
            BeginPrepare::InFlight(handle) => return Ok(Prepared::InFlight(handle)),
            BeginPrepare::Superseded => return Err(PrepareError::Superseded),
        };

        match self.run(&ticket).await {
            Ok(handle) => Ok(Prepared::Ready(handle)),
            Err(err) => {
                if let Some(handle) = self.pool.discard(id, ticket.generation) {
                    handle.release();
                }
                if err.is_failure() {
                    tracing::warn!("Failed to prepare {}: {}", id, err);
                    self.events.emit(FeedEvent::PreparationFailed {
                        id: id.to_string(),
                        error: err.clone(),
                    });
                } else {
                    tracing::debug!("Preparation of {} stopped: {}", id, err);
                }
                Err(err)
            }
        }
    }

    async fn run(&self, ticket: &PrepareTicket) -> Result<ResourceHandle, PrepareError> {
        let url = bounded(
            &ticket.cancel,
            self.timeouts.resolve(),
            async { self.resolver.resolve_url(&ticket.id).await.map_err(PrepareError::from) },
            || format!("resolving {}", ticket.id),
        )
        .await?;
        self.ensure_valid(ticket)?;
        tracing::debug!("Resolved {} to {}", ticket.id, url);

        let asset = bounded(
            &ticket.cancel,
            self.timeouts.metadata(),
            self.backend.load_asset(&url),
            || format!("loading {}", url),
        )
        .await?;
        self.ensure_valid(ticket)?;

        let player = bounded(
            &ticket.cancel,
            self.timeouts.metadata(),
            self.backend.create_player(&asset),
            || format!("creating player for {}", url),
        )
        .await?;

        if let Err(err) = self.ensure_valid(ticket) {
            player.release();
            return Err(err);
        }

        let observer = self.spawn_observer(ticket, player.as_ref());
        match self.pool.promote(ticket, player.clone(), Some(observer.clone())) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                observer.abort();
                player.release();
                Err(err)
            }
        }
    }

    fn ensure_valid(&self, ticket: &PrepareTicket) -> Result<(), PrepareError> {
        if ticket.cancel.is_cancelled() {
            Err(PrepareError::Cancelled)
        } else if !self.pool.is_current(ticket.token) {
            Err(PrepareError::Superseded)
        } else {
            Ok(())
        }
    }

    /// Watch the player for the lifetime of the handle.
    ///
    /// Ended loops the item when looping is enabled and the slot still owns
    /// playback; an error demotes the handle.
    fn spawn_observer(&self, ticket: &PrepareTicket, player: &dyn PlaybackSink) -> AbortHandle {
        let mut rx = player.subscribe();
        let pool = self.pool.clone();
        let events = self.events.clone();
        let looping = self.playback.looping;
        let id = ticket.id.clone();
        let generation = ticket.generation;

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PlayerEvent::Ended) => {
                        if !looping {
                            continue;
                        }
                        let restarted = pool.with_active(&id, generation, |p| {
                            p.seek(Duration::ZERO).and_then(|_| p.play())
                        });
                        match restarted {
                            Some(Err(e)) => tracing::warn!("Failed to loop {}: {}", id, e),
                            Some(Ok(())) => {}
                            None => tracing::debug!("{} ended while not playing, not looping", id),
                        }
                    }
                    Ok(PlayerEvent::Stalled) => {
                        tracing::warn!("Playback of {} stalled", id);
                    }
                    Ok(PlayerEvent::Error(message)) => {
                        tracing::warn!("Player error for {}: {}", id, message);
                        if let Some(handle) = pool.discard(&id, generation) {
                            events.emit(FeedEvent::PreparationFailed {
                                id: id.clone(),
                                error: PrepareError::Unplayable(message),
                            });
                            handle.release();
                        }
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Observer for {} skipped {} events", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
        .abort_handle()
    }
}

/// Run `fut` unless `cancel` fires first or `limit` elapses.
async fn bounded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
    describe: impl FnOnce() -> String,
) -> Result<T, PrepareError>
where
    F: Future<Output = Result<T, PrepareError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PrepareError::Cancelled),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(res) => res,
            Err(_) => Err(PrepareError::PrepareTimeout(format!(
                "{} exceeded {:?}",
                describe(),
                limit
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::HandleState;
    use crate::testing::{FakeBackend, ScriptedResolver};

    struct Harness {
        pool: Arc<ResourcePool>,
        resolver: Arc<ScriptedResolver>,
        backend: Arc<FakeBackend>,
        events: EventBus,
        pipeline: Arc<PreparationPipeline>,
    }

    fn harness() -> Harness {
        let events = EventBus::default();
        let pool = Arc::new(ResourcePool::new(events.clone()));
        let resolver = Arc::new(ScriptedResolver::default());
        let backend = Arc::new(FakeBackend::default());
        let pipeline = Arc::new(PreparationPipeline::new(
            pool.clone(),
            resolver.clone(),
            backend.clone(),
            events.clone(),
            TimeoutSettings::default(),
            PlaybackSettings::default(),
        ));
        Harness {
            pool,
            resolver,
            backend,
            events,
            pipeline,
        }
    }

    impl Harness {
        async fn prepare(&self, id: &str) -> Result<Prepared, PrepareError> {
            self.pipeline
                .prepare(id, self.pool.latest_token(), &CancellationToken::new())
                .await
        }
    }

    fn ready(prepared: Prepared) -> ResourceHandle {
        match prepared {
            Prepared::Ready(handle) => handle,
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_registers_ready_handle() {
        let h = harness();
        let handle = ready(h.prepare("item-1").await.unwrap());
        assert_eq!(handle.state, HandleState::Ready);
        assert!(handle.ready);
        assert!(handle.player.is_some());
        assert_eq!(h.pool.get("item-1").unwrap().state, HandleState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_ready_item_is_noop() {
        let h = harness();
        let first = ready(h.prepare("item-1").await.unwrap());
        let second = ready(h.prepare("item-1").await.unwrap());
        assert!(first.same_slot(&second));
        assert_eq!(h.resolver.calls("item-1"), 1);
        assert_eq!(h.backend.players_for("item-1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_prepares_run_once() {
        let h = harness();
        let token = h.pool.latest_token();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move {
                    pipeline
                        .prepare("item-1", token, &CancellationToken::new())
                        .await
                })
            })
            .collect();

        let mut started = 0;
        for task in tasks {
            if let Ok(Prepared::Ready(_)) = task.await.unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(h.resolver.calls("item-1"), 1);
        assert_eq!(h.resolver.max_in_flight("item-1"), 1);
        assert_eq!(h.pool.get("item-1").unwrap().state, HandleState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_timeout_leaves_no_handle() {
        let h = harness();
        h.resolver.hang("item-1");
        let mut events = h.events.subscribe();

        let err = h.prepare("item-1").await.unwrap_err();
        assert!(matches!(err, PrepareError::PrepareTimeout(_)));
        assert!(h.pool.get("item-1").is_none());

        loop {
            if let FeedEvent::PreparationFailed { id, .. } = events.recv().await.unwrap() {
                assert_eq!(id, "item-1");
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_failure_is_reported() {
        let h = harness();
        h.resolver.fail("item-1");
        let err = h.prepare("item-1").await.unwrap_err();
        assert!(matches!(err, PrepareError::ResolveFailure(_)));
        assert!(h.pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplayable_asset_is_removed() {
        let h = harness();
        h.backend.reject("item-1");
        let err = h.prepare("item-1").await.unwrap_err();
        assert!(matches!(err, PrepareError::Unplayable(_)));
        assert!(h.pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_preparation_removes_handle() {
        let h = harness();
        let cancel = CancellationToken::new();
        let token = h.pool.latest_token();
        let pipeline = h.pipeline.clone();
        let child = cancel.clone();
        let task = tokio::spawn(async move { pipeline.prepare("item-1", token, &child).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.pool.get("item-1").unwrap().state, HandleState::Preparing);
        cancel.cancel();

        assert_eq!(task.await.unwrap().unwrap_err(), PrepareError::Cancelled);
        assert!(h.pool.is_empty());
        assert!(h.backend.players_for("item-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_during_load_releases_player() {
        let h = harness();
        let token = h.pool.latest_token();
        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            pipeline
                .prepare("item-1", token, &CancellationToken::new())
                .await
        });

        // Resolution takes 50ms; evict while the asset is loading.
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.pool.remove("item-1").unwrap().release();

        assert_eq!(task.await.unwrap().unwrap_err(), PrepareError::Cancelled);
        assert!(h.pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_preparation_never_promotes() {
        let h = harness();
        let token = h.pool.latest_token();
        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            pipeline
                .prepare("item-1", token, &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let (_, stale) = h.pool.supersede();
        for handle in stale {
            handle.release();
        }

        assert!(task.await.unwrap().is_err());
        assert!(h.pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_evict_prepare_yields_fresh_handle() {
        let h = harness();
        let first = ready(h.prepare("item-1").await.unwrap());
        h.pool.remove("item-1").unwrap().release();
        let first_player = h.backend.latest_player("item-1").unwrap();
        assert!(first_player.is_released());

        let second = ready(h.prepare("item-1").await.unwrap());
        assert!(!first.same_slot(&second));
        let second_player = h.backend.latest_player("item-1").unwrap();
        assert!(!Arc::ptr_eq(&first_player, &second_player));
        assert!(!second_player.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_loops_on_end() {
        let h = harness();
        ready(h.prepare("item-1").await.unwrap());
        let player = h.backend.latest_player("item-1").unwrap();
        h.pool.activate("item-1").unwrap().play().unwrap();

        player.emit(PlayerEvent::Ended);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(player.seeks(), vec![Duration::ZERO]);
        assert!(player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_does_not_restart_paused_item() {
        let h = harness();
        ready(h.prepare("item-1").await.unwrap());
        let player = h.backend.latest_player("item-1").unwrap();
        h.pool.activate("item-1").unwrap().play().unwrap();

        player.emit(PlayerEvent::Ended);
        h.pool.pause_active();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(player.seeks().is_empty());
        assert!(!player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_error_demotes_handle() {
        let h = harness();
        ready(h.prepare("item-1").await.unwrap());
        let player = h.backend.latest_player("item-1").unwrap();

        player.emit(PlayerEvent::Error("decoder crashed".into()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(h.pool.get("item-1").is_none());
        assert!(player.is_released());
    }
}
