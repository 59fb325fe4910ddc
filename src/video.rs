//! GStreamer-based media backend.
//!
//! Assets are probed by prerolling a throwaway `playbin` with fake sinks to
//! read the duration; players are `playbin` pipelines whose bus messages are
//! forwarded as [`PlayerEvent`]s.

use crate::error::PrepareError;
use crate::player::{AssetInfo, MediaBackend, PlaybackSink, PlayerEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use gstreamer as gst;
use gstreamer::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

/// Backend that decodes and plays media with GStreamer.
pub struct GstBackend {
    preroll_wait: Duration,
}

impl GstBackend {
    /// Initialize GStreamer (once per process) and create the backend.
    pub fn new(preroll_wait: Duration) -> Result<Self> {
        gst::init().context("Failed to initialize GStreamer")?;
        tracing::info!("GStreamer initialized: {}", gst::version_string());
        Ok(Self { preroll_wait })
    }
}

fn make_playbin(uri: &str) -> Result<gst::Pipeline, PrepareError> {
    gst::ElementFactory::make("playbin")
        .property("uri", uri)
        .build()
        .map_err(|e| PrepareError::Unplayable(format!("Failed to create playbin: {}", e)))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| PrepareError::Unplayable("playbin is not a pipeline".into()))
}

fn fake_sink() -> Result<gst::Element, PrepareError> {
    gst::ElementFactory::make("fakesink")
        .build()
        .map_err(|e| PrepareError::Unplayable(format!("Failed to create fakesink: {}", e)))
}

/// Preroll `uri` and read its duration. Blocks for at most `wait`.
fn probe(uri: &str, wait: Duration) -> Result<Option<Duration>, PrepareError> {
    let playbin = make_playbin(uri)?;
    playbin.set_property("video-sink", fake_sink()?);
    playbin.set_property("audio-sink", fake_sink()?);

    let result = preroll(&playbin, uri, wait).map(|_| {
        playbin
            .query_duration::<gst::ClockTime>()
            .map(|d| Duration::from_nanos(d.nseconds()))
    });
    let _ = playbin.set_state(gst::State::Null);
    result
}

fn preroll(pipeline: &gst::Pipeline, uri: &str, wait: Duration) -> Result<(), PrepareError> {
    pipeline
        .set_state(gst::State::Paused)
        .map_err(|_| PrepareError::Unplayable(format!("{} cannot be opened", uri)))?;

    let (result, current, _) =
        pipeline.state(gst::ClockTime::from_mseconds(wait.as_millis() as u64));
    match result {
        Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => Ok(()),
        Ok(gst::StateChangeSuccess::Async) => Err(PrepareError::PrepareTimeout(format!(
            "{} still prerolling in state {:?}",
            uri, current
        ))),
        Err(_) => Err(PrepareError::Unplayable(format!("{} failed to preroll", uri))),
    }
}

#[async_trait]
impl MediaBackend for GstBackend {
    async fn load_asset(&self, url: &Url) -> Result<AssetInfo, PrepareError> {
        let uri = url.to_string();
        let wait = self.preroll_wait;
        let duration = tokio::task::spawn_blocking(move || probe(&uri, wait))
            .await
            .map_err(|e| PrepareError::Unplayable(format!("Probe task failed: {}", e)))??;

        Ok(AssetInfo {
            url: url.clone(),
            content_type: None,
            size: None,
            duration,
        })
    }

    async fn create_player(&self, asset: &AssetInfo) -> Result<Arc<dyn PlaybackSink>, PrepareError> {
        let uri = asset.url.to_string();
        let wait = self.preroll_wait;
        // An abandoned task's output still drops the player, which nulls the pipeline.
        let player = tokio::task::spawn_blocking(move || {
            let player = GstPlayer::new(make_playbin(&uri)?)?;
            preroll(&player.pipeline, &uri, wait)?;
            Ok::<_, PrepareError>(player)
        })
        .await
        .map_err(|e| PrepareError::Unplayable(format!("Player task failed: {}", e)))??;

        tracing::debug!("Created GStreamer player for {}", asset.url);
        Ok(Arc::new(player))
    }
}

/// Player wrapping a prerolled `playbin`.
pub struct GstPlayer {
    pipeline: gst::Pipeline,
    playing: AtomicBool,
    released: AtomicBool,
    events: broadcast::Sender<PlayerEvent>,
    bus_task: Mutex<Option<JoinHandle<()>>>,
}

impl GstPlayer {
    fn new(pipeline: gst::Pipeline) -> Result<Self, PrepareError> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| PrepareError::Unplayable("Pipeline has no bus".into()))?;
        let (events, _) = broadcast::channel(16);

        let tx = events.clone();
        let bus_task = tokio::spawn(async move {
            let mut messages = bus.stream();
            while let Some(msg) = messages.next().await {
                let event = match msg.view() {
                    gst::MessageView::Eos(_) => Some(PlayerEvent::Ended),
                    gst::MessageView::Buffering(b) if b.percent() < 100 => {
                        Some(PlayerEvent::Stalled)
                    }
                    gst::MessageView::Error(err) => {
                        tracing::error!("GStreamer error: {} ({:?})", err.error(), err.debug());
                        Some(PlayerEvent::Error(err.error().to_string()))
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = tx.send(event);
                }
            }
        });

        Ok(Self {
            pipeline,
            playing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            events,
            bus_task: Mutex::new(Some(bus_task)),
        })
    }

    fn set_state(&self, state: gst::State) -> Result<()> {
        anyhow::ensure!(!self.released.load(Ordering::SeqCst), "Player already released");
        self.pipeline
            .set_state(state)
            .with_context(|| format!("Failed to set pipeline to {:?}", state))?;
        Ok(())
    }

    /// Get current playback position.
    pub fn position(&self) -> Option<Duration> {
        self.pipeline
            .query_position::<gst::ClockTime>()
            .map(|p| Duration::from_nanos(p.nseconds()))
    }
}

impl PlaybackSink for GstPlayer {
    fn play(&self) -> Result<()> {
        self.set_state(gst::State::Playing)?;
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.set_state(gst::State::Paused)?;
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn seek(&self, position: Duration) -> Result<()> {
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::from_nseconds(position.as_nanos() as u64),
            )
            .context("Failed to seek")
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.pipeline
            .set_property("volume", f64::from(volume.clamp(0.0, 1.0)));
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.playing.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .bus_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for GstPlayer {
    fn drop(&mut self) {
        self.release();
    }
}
