//! Playback abstractions consumed by prepared resources, and the headless backend.
//!
//! A [`MediaBackend`] turns a resolved URL into a loaded asset and then into a
//! [`PlaybackSink`]. The headless backend verifies the asset is reachable and
//! playable but only records playback state; the GStreamer backend in
//! [`crate::video`] decodes for real.

use crate::error::PrepareError;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

/// Notifications published by a player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Playback reached the end of the media.
    Ended,
    /// Playback is waiting on data.
    Stalled,
    /// The player hit an unrecoverable error.
    Error(String),
}

/// Playback controls of a prepared player.
pub trait PlaybackSink: Send + Sync {
    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn seek(&self, position: Duration) -> Result<()>;
    fn set_volume(&self, volume: f32) -> Result<()>;
    fn is_playing(&self) -> bool;
    /// Subscribe to this player's events.
    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent>;
    /// Stop playback and free the underlying resources. Idempotent.
    fn release(&self);
}

/// Metadata of a loaded asset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetInfo {
    pub url: Url,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub duration: Option<Duration>,
}

/// Builds players for resolved media URLs.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Load the asset behind `url` and read the metadata needed before playback.
    async fn load_asset(&self, url: &Url) -> Result<AssetInfo, PrepareError>;

    /// Construct a player for a loaded asset.
    async fn create_player(&self, asset: &AssetInfo) -> Result<Arc<dyn PlaybackSink>, PrepareError>;
}

/// Whether a content type is something a player can present.
pub fn is_playable_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("video/")
        || essence.starts_with("image/")
        || essence.starts_with("audio/")
        || essence == "application/vnd.apple.mpegurl"
        || essence == "application/x-mpegurl"
        || essence == "application/octet-stream"
}

/// Guess a content type from a path's extension.
pub fn content_type_from_extension(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Backend that probes assets over HTTP or the filesystem without decoding them.
pub struct HeadlessBackend {
    client: reqwest::Client,
}

impl HeadlessBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn probe_file(&self, url: &Url) -> Result<AssetInfo, PrepareError> {
        let path = url
            .to_file_path()
            .map_err(|_| PrepareError::Unplayable(format!("Invalid file URL {}", url)))?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PrepareError::Unplayable(format!("{}: {}", path.display(), e)))?;
        if metadata.len() == 0 {
            return Err(PrepareError::Unplayable(format!("{} is empty", path.display())));
        }

        Ok(AssetInfo {
            url: url.clone(),
            content_type: content_type_from_extension(url.path()).map(str::to_string),
            size: Some(metadata.len()),
            duration: None,
        })
    }

    async fn probe_http(&self, url: &Url) -> Result<AssetInfo, PrepareError> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PrepareError::Unplayable(format!("{}: {}", url, e)))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| content_type_from_extension(url.path()).map(str::to_string));

        if let Some(ct) = &content_type {
            if !is_playable_content_type(ct) {
                return Err(PrepareError::Unplayable(format!("{} has content type {}", url, ct)));
            }
        }

        Ok(AssetInfo {
            url: url.clone(),
            content_type,
            size: response.content_length(),
            duration: None,
        })
    }
}

#[async_trait]
impl MediaBackend for HeadlessBackend {
    async fn load_asset(&self, url: &Url) -> Result<AssetInfo, PrepareError> {
        match url.scheme() {
            "file" => self.probe_file(url).await,
            "http" | "https" => self.probe_http(url).await,
            other => Err(PrepareError::Unplayable(format!("Unsupported scheme {}", other))),
        }
    }

    async fn create_player(&self, asset: &AssetInfo) -> Result<Arc<dyn PlaybackSink>, PrepareError> {
        tracing::debug!("Creating headless player for {}", asset.url);
        Ok(Arc::new(HeadlessPlayer::new(asset.duration)))
    }
}

#[derive(Debug, Default)]
struct HeadlessState {
    playing: bool,
    position: Duration,
    volume: f32,
    released: bool,
}

/// Player that tracks playback state in memory.
pub struct HeadlessPlayer {
    state: Mutex<HeadlessState>,
    duration: Option<Duration>,
    events: broadcast::Sender<PlayerEvent>,
}

impl HeadlessPlayer {
    pub fn new(duration: Option<Duration>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(HeadlessState {
                volume: 1.0,
                ..Default::default()
            }),
            duration,
            events,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HeadlessState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn ensure_live(state: &HeadlessState) -> Result<()> {
        if state.released {
            anyhow::bail!("Player already released");
        }
        Ok(())
    }

    pub fn position(&self) -> Duration {
        self.with_state(|s| s.position)
    }

    pub fn volume(&self) -> f32 {
        self.with_state(|s| s.volume)
    }

    pub fn is_released(&self) -> bool {
        self.with_state(|s| s.released)
    }
}

impl PlaybackSink for HeadlessPlayer {
    fn play(&self) -> Result<()> {
        self.with_state(|s| {
            Self::ensure_live(s)?;
            s.playing = true;
            Ok(())
        })
    }

    fn pause(&self) -> Result<()> {
        self.with_state(|s| {
            Self::ensure_live(s)?;
            s.playing = false;
            Ok(())
        })
    }

    fn seek(&self, position: Duration) -> Result<()> {
        let position = match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        };
        self.with_state(|s| {
            Self::ensure_live(s)?;
            s.position = position;
            Ok(())
        })
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.with_state(|s| {
            Self::ensure_live(s)?;
            s.volume = volume.clamp(0.0, 1.0);
            Ok(())
        })
    }

    fn is_playing(&self) -> bool {
        self.with_state(|s| s.playing)
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn release(&self) {
        self.with_state(|s| {
            s.playing = false;
            s.released = true;
        });
    }
}
