//! Scripted collaborators shared by the unit tests.

use crate::error::{PrepareError, ResolveError};
use crate::feed::{FeedBatch, FeedItem, FeedSource, Media};
use crate::player::{AssetInfo, MediaBackend, PlaybackSink, PlayerEvent};
use crate::resolver::MediaResolver;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

pub fn item(n: usize) -> FeedItem {
    FeedItem::new(
        n as u64,
        Media {
            id: format!("item-{}", n),
            media_type: "video".into(),
            display_url: None,
            video_url: Some(format!("/video/item-{}.mp4", n)),
            poster_url: None,
            duration: Some(8.0),
        },
    )
}

pub fn id(n: usize) -> String {
    format!("item-{}", n)
}

#[derive(Default)]
struct PlayerState {
    playing: bool,
    released: bool,
    volume: Option<f32>,
    seeks: Vec<Duration>,
    pauses: usize,
}

/// Player that records every call.
pub struct RecordingPlayer {
    state: Mutex<PlayerState>,
    events: broadcast::Sender<PlayerEvent>,
}

impl Default for RecordingPlayer {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(PlayerState::default()),
            events,
        }
    }
}

impl RecordingPlayer {
    fn state(&self) -> std::sync::MutexGuard<'_, PlayerState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_released(&self) -> bool {
        self.state().released
    }

    pub fn volume(&self) -> Option<f32> {
        self.state().volume
    }

    pub fn seeks(&self) -> Vec<Duration> {
        self.state().seeks.clone()
    }

    pub fn pauses(&self) -> usize {
        self.state().pauses
    }
}

impl PlaybackSink for RecordingPlayer {
    fn play(&self) -> anyhow::Result<()> {
        let mut state = self.state();
        anyhow::ensure!(!state.released, "released");
        state.playing = true;
        Ok(())
    }

    fn pause(&self) -> anyhow::Result<()> {
        let mut state = self.state();
        state.playing = false;
        state.pauses += 1;
        Ok(())
    }

    fn seek(&self, position: Duration) -> anyhow::Result<()> {
        self.state().seeks.push(position);
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.state().volume = Some(volume);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.state().playing
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn release(&self) {
        let mut state = self.state();
        state.playing = false;
        state.released = true;
    }
}

/// Resolver with per-id scripted behaviour and call accounting.
pub struct ScriptedResolver {
    delay: Duration,
    hanging: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
}

impl Default for ScriptedResolver {
    fn default() -> Self {
        Self::with_delay(Duration::from_millis(50))
    }
}

impl ScriptedResolver {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            hanging: Mutex::default(),
            failing: Mutex::default(),
            calls: Mutex::default(),
            in_flight: Mutex::default(),
            max_in_flight: Mutex::default(),
        }
    }

    /// Never answer for `id`.
    pub fn hang(&self, id: &str) {
        self.hanging.lock().unwrap().insert(id.to_string());
    }

    /// Answer `NotFound` for `id`.
    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
        self.hanging.lock().unwrap().remove(id);
    }

    pub fn calls(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, id: &str) -> usize {
        self.max_in_flight.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

struct InFlight<'a> {
    resolver: &'a ScriptedResolver,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(n) = self.resolver.in_flight.lock().unwrap().get_mut(&self.id) {
            *n -= 1;
        }
    }
}

#[async_trait]
impl MediaResolver for ScriptedResolver {
    async fn resolve_url(&self, item_id: &str) -> Result<Url, ResolveError> {
        *self.calls.lock().unwrap().entry(item_id.to_string()).or_default() += 1;
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let n = in_flight.entry(item_id.to_string()).or_default();
            *n += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            let m = max.entry(item_id.to_string()).or_default();
            *m = (*m).max(*n);
        }
        let _guard = InFlight {
            resolver: self,
            id: item_id.to_string(),
        };

        if self.hanging.lock().unwrap().contains(item_id) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        if self.failing.lock().unwrap().contains(item_id) {
            return Err(ResolveError::NotFound(item_id.to_string()));
        }
        Ok(Url::parse(&format!("https://media.test/{}.mp4", item_id)).unwrap())
    }
}

/// Backend that hands out [`RecordingPlayer`]s and remembers them by item.
pub struct FakeBackend {
    load_delay: Duration,
    unplayable: Mutex<HashSet<String>>,
    players: Mutex<Vec<(String, Arc<RecordingPlayer>)>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            load_delay: Duration::from_millis(30),
            unplayable: Mutex::default(),
            players: Mutex::default(),
        }
    }
}

impl FakeBackend {
    pub fn with_load_delay(load_delay: Duration) -> Self {
        Self {
            load_delay,
            ..Default::default()
        }
    }

    pub fn reject(&self, id: &str) {
        self.unplayable.lock().unwrap().insert(id.to_string());
    }

    /// Every player created for `id`, oldest first.
    pub fn players_for(&self, id: &str) -> Vec<Arc<RecordingPlayer>> {
        self.players
            .lock()
            .unwrap()
            .iter()
            .filter(|(item, _)| item == id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn latest_player(&self, id: &str) -> Option<Arc<RecordingPlayer>> {
        self.players_for(id).pop()
    }
}

fn item_of(url: &Url) -> String {
    url.path()
        .trim_start_matches('/')
        .trim_end_matches(".mp4")
        .to_string()
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn load_asset(&self, url: &Url) -> Result<AssetInfo, PrepareError> {
        tokio::time::sleep(self.load_delay).await;
        if self.unplayable.lock().unwrap().contains(&item_of(url)) {
            return Err(PrepareError::Unplayable(url.to_string()));
        }
        Ok(AssetInfo {
            url: url.clone(),
            content_type: Some("video/mp4".into()),
            size: Some(1024),
            duration: Some(Duration::from_secs(8)),
        })
    }

    async fn create_player(&self, asset: &AssetInfo) -> Result<Arc<dyn PlaybackSink>, PrepareError> {
        let player = Arc::new(RecordingPlayer::default());
        self.players
            .lock()
            .unwrap()
            .push((item_of(&asset.url), player.clone()));
        Ok(player)
    }
}

/// Feed source serving `total` generated items, optionally failing the first calls.
pub struct StaticFeed {
    total: usize,
    failures_left: AtomicU32,
    fetches: AtomicUsize,
}

impl StaticFeed {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            failures_left: AtomicU32::new(0),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(total: usize, failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            ..Self::new(total)
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch_batch(&self, cursor: u64, limit: usize) -> anyhow::Result<FeedBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("connection reset");
        }

        let start = (cursor as usize * limit).min(self.total);
        let end = (start + limit).min(self.total);
        Ok(FeedBatch {
            items: (start..end).map(item).collect(),
        })
    }
}
