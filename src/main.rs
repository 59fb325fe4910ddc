use anyhow::{Context, Result};
use feed_viewer::cache::Cache;
use feed_viewer::feed::PocketBaseFeed;
use feed_viewer::player::MediaBackend;
use feed_viewer::resolver::{CachingResolver, MediaResolver, PocketBaseResolver};
use feed_viewer::{EventBus, FeedEvent, IndexChangeCoordinator, PreparationPipeline, ResourcePool, Settings};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load(config_path().as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .init();

    tracing::info!("Starting feed viewer against {}", settings.pocketbase_url);

    let client = Client::new();
    let token = settings.auth_token.clone();
    let records = Arc::new(PocketBaseResolver::new(
        client.clone(),
        settings.pocketbase_url.clone(),
        token.clone(),
    ));
    let source = Arc::new(
        PocketBaseFeed::new(
            client.clone(),
            settings.pocketbase_url.clone(),
            token.clone(),
        )
        .with_resolver(records.clone()),
    );

    let mut resolver: Arc<dyn MediaResolver> = records;
    if settings.cache.enabled {
        let max_size = settings.cache.max_size_gb * 1024 * 1024 * 1024;
        let cache = Cache::new(settings.cache.dir.clone(), max_size)
            .context("Failed to open media cache")?;
        resolver = Arc::new(CachingResolver::new(
            resolver,
            Arc::new(tokio::sync::RwLock::new(cache)),
            client.clone(),
            token,
        ));
    }

    let backend = media_backend(&settings, &client)?;
    let events = EventBus::default();
    let pool = Arc::new(ResourcePool::new(events.clone()));
    let pipeline = Arc::new(PreparationPipeline::new(
        pool.clone(),
        resolver,
        backend,
        events.clone(),
        settings.timeouts,
        settings.playback,
    ));
    let coordinator = IndexChangeCoordinator::new(pool, pipeline, source, events.clone(), settings);

    tokio::spawn(log_events(events.subscribe()));

    let loaded = coordinator.load_initial().await?;
    if loaded == 0 {
        tracing::warn!("Feed is empty, nothing to show");
    } else {
        coordinator.change_index(0).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let current = coordinator.current_index().unwrap_or(0);
        let target = match line.trim() {
            "q" => break,
            "n" | "" => current + 1,
            "p" => current.saturating_sub(1),
            other => match other.parse::<usize>() {
                Ok(index) => index,
                Err(_) => {
                    println!("commands: n (next), p (previous), <index>, q (quit)");
                    continue;
                }
            },
        };

        let len = coordinator.feed().len();
        if target >= len {
            println!("index {} out of range (feed has {} items)", target, len);
            continue;
        }
        coordinator.request_index(target);
    }

    coordinator.shutdown();
    Ok(())
}

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    std::env::var_os("FEED_CONFIG").map(PathBuf::from)
}

#[cfg(feature = "gstreamer")]
fn media_backend(settings: &Settings, _client: &Client) -> Result<Arc<dyn MediaBackend>> {
    Ok(Arc::new(feed_viewer::video::GstBackend::new(
        settings.timeouts.metadata(),
    )?))
}

#[cfg(not(feature = "gstreamer"))]
fn media_backend(_settings: &Settings, client: &Client) -> Result<Arc<dyn MediaBackend>> {
    Ok(Arc::new(feed_viewer::player::HeadlessBackend::new(
        client.clone(),
    )))
}

async fn log_events(mut rx: broadcast::Receiver<FeedEvent>) {
    loop {
        match rx.recv().await {
            Ok(FeedEvent::IndexChanged { old, new }) => {
                println!("-> item {} (was {:?})", new, old)
            }
            Ok(FeedEvent::ReadinessChanged { id, ready }) => {
                tracing::debug!("{} ready={}", id, ready)
            }
            Ok(FeedEvent::PreparationFailed { id, error }) => {
                println!("!! {} failed: {}", id, error)
            }
            Ok(FeedEvent::ItemsAppended { count, total }) => {
                tracing::info!("+{} items ({} total)", count, total)
            }
            Ok(FeedEvent::LoadMoreRequested { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged by {} events", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
