//! Layered settings: an optional TOML file overridden by `FEED_*` environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "feed-viewer.toml";

/// Top-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// PocketBase server base URL.
    pub pocketbase_url: String,
    /// Optional bearer token for PocketBase requests.
    pub auth_token: Option<String>,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
    pub window: WindowSettings,
    pub timeouts: TimeoutSettings,
    pub pagination: PaginationSettings,
    pub playback: PlaybackSettings,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pocketbase_url: "http://localhost:8090".into(),
            auth_token: None,
            log_filter: "feed_viewer=info".into(),
            window: WindowSettings::default(),
            timeouts: TimeoutSettings::default(),
            pagination: PaginationSettings::default(),
            playback: PlaybackSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

/// Radii of the live window around the current item.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    pub backward_radius: usize,
    pub forward_radius: usize,
    /// Extra items kept in the direction of travel.
    pub preload_extra: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            backward_radius: 3,
            forward_radius: 3,
            preload_extra: 0,
        }
    }
}

/// Time bounds for the preparation pipeline, in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub resolve_ms: u64,
    pub metadata_ms: u64,
    /// Delay between starting consecutive preloads.
    pub stagger_ms: u64,
    /// Upper bound on waiting for another task already preparing the current item.
    pub current_wait_ms: u64,
}

impl TimeoutSettings {
    pub fn resolve(&self) -> Duration {
        Duration::from_millis(self.resolve_ms)
    }

    pub fn metadata(&self) -> Duration {
        Duration::from_millis(self.metadata_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn current_wait(&self) -> Duration {
        Duration::from_millis(self.current_wait_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            resolve_ms: 4500,
            metadata_ms: 5000,
            stagger_ms: 150,
            current_wait_ms: 10_000,
        }
    }
}

/// Feed pagination behaviour.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PaginationSettings {
    pub page_size: usize,
    /// Load more once the current index is this close to the end.
    pub threshold: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            page_size: 10,
            threshold: 3,
            max_attempts: 4,
            backoff_ms: 500,
        }
    }
}

/// Playback defaults applied when an item becomes current.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub volume: f32,
    pub looping: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            looping: true,
        }
    }
}

/// On-disk media cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub max_size_gb: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
            .unwrap_or_else(std::env::temp_dir);
        Self {
            enabled: false,
            dir: base.join("feed-viewer").join("media"),
            max_size_gb: 2,
        }
    }
}

impl Settings {
    /// Load settings from `path` (if it exists) and the environment.
    ///
    /// Environment variables use the `FEED_` prefix and `__` between sections,
    /// e.g. `FEED_WINDOW__FORWARD_RADIUS=5`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(file.clone()).required(false))
            .add_source(
                config::Environment::with_prefix("FEED")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read settings from {:?}", file))?
            .try_deserialize()
            .context("Invalid settings")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.pagination.page_size == 0 {
            anyhow::bail!("pagination.page_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.playback.volume) {
            anyhow::bail!("playback.volume must be between 0.0 and 1.0");
        }
        Ok(())
    }
}
