//! Resolution of feed item ids to playable URLs.

use crate::cache::{self, Cache};
use crate::error::ResolveError;
use crate::feed::Media;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use url::Url;

/// Resolves an item id to the URL its player should load.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve_url(&self, item_id: &str) -> Result<Url, ResolveError>;
}

/// Turn a possibly relative asset URL into an absolute one against `base`.
pub fn full_url(base: &str, relative_url: &str) -> Result<Url, ResolveError> {
    let joined = if relative_url.starts_with("http://") || relative_url.starts_with("https://") {
        relative_url.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            relative_url.trim_start_matches('/')
        )
    };
    Url::parse(&joined).map_err(|e| ResolveError::Network(format!("Invalid media URL {}: {}", joined, e)))
}

/// Resolver that reads the item's record from PocketBase.
///
/// Resolved URLs are remembered for the lifetime of the resolver.
pub struct PocketBaseResolver {
    client: reqwest::Client,
    pb_url: String,
    token: Option<String>,
    resolved: RwLock<HashMap<String, Url>>,
}

impl PocketBaseResolver {
    pub fn new(client: reqwest::Client, pb_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            pb_url: pb_url.into(),
            token,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Record the playable URL of an already fetched record, so resolving it
    /// needs no further request. Records without a playable URL are skipped.
    pub async fn remember(&self, media: &Media) {
        let Some(relative) = media.playable_url() else {
            return;
        };
        match full_url(&self.pb_url, relative) {
            Ok(url) => {
                self.resolved.write().await.insert(media.id.clone(), url);
            }
            Err(e) => tracing::debug!("Not remembering {}: {}", media.id, e),
        }
    }

    async fn fetch_media(&self, item_id: &str) -> Result<Media, ResolveError> {
        let url = format!(
            "{}/api/collections/media/records/{}",
            self.pb_url.trim_end_matches('/'),
            urlencoding::encode(item_id)
        );

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::Network(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound(item_id.to_string()));
        }
        response
            .error_for_status()
            .map_err(|e| ResolveError::Network(e.to_string()))?
            .json::<Media>()
            .await
            .map_err(|e| ResolveError::Network(format!("Failed to parse media record: {}", e)))
    }
}

#[async_trait]
impl MediaResolver for PocketBaseResolver {
    async fn resolve_url(&self, item_id: &str) -> Result<Url, ResolveError> {
        if let Some(url) = self.resolved.read().await.get(item_id) {
            return Ok(url.clone());
        }

        let media = self.fetch_media(item_id).await?;
        let relative = media
            .playable_url()
            .ok_or_else(|| ResolveError::NotFound(item_id.to_string()))?;
        let url = full_url(&self.pb_url, relative)?;

        tracing::debug!("Resolved {} to {}", item_id, url);
        self.resolved
            .write()
            .await
            .insert(item_id.to_string(), url.clone());
        Ok(url)
    }
}

/// Resolver that serves media from the disk cache when possible.
///
/// A cache hit resolves to a `file://` URL. A miss resolves through the inner
/// resolver and downloads the media in the background for next time.
pub struct CachingResolver {
    inner: Arc<dyn MediaResolver>,
    cache: Arc<RwLock<Cache>>,
    client: reqwest::Client,
    token: Option<String>,
    downloading: Arc<Mutex<HashSet<String>>>,
}

impl CachingResolver {
    pub fn new(
        inner: Arc<dyn MediaResolver>,
        cache: Arc<RwLock<Cache>>,
        client: reqwest::Client,
        token: Option<String>,
    ) -> Self {
        Self {
            inner,
            cache,
            client,
            token,
            downloading: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn warm(&self, item_id: &str, url: &Url) {
        {
            let mut downloading = self.downloading.lock().unwrap_or_else(|e| e.into_inner());
            if !downloading.insert(item_id.to_string()) {
                return;
            }
        }

        let item_id = item_id.to_string();
        let url = url.to_string();
        let cache = self.cache.clone();
        let client = self.client.clone();
        let token = self.token.clone();
        let downloading = self.downloading.clone();

        tokio::spawn(async move {
            let path = cache.read().await.path_for(&item_id, &url);
            match cache::download_to(&client, &url, &path, token.as_deref()).await {
                Ok(size) => cache.write().await.commit(&item_id, path, size),
                Err(e) => tracing::warn!("Failed to cache media for {}: {:#}", item_id, e),
            }
            downloading
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&item_id);
        });
    }
}

#[async_trait]
impl MediaResolver for CachingResolver {
    async fn resolve_url(&self, item_id: &str) -> Result<Url, ResolveError> {
        {
            let mut cache = self.cache.write().await;
            if let Some(path) = cache.get_cached_path(item_id) {
                cache.touch(item_id);
                if let Ok(url) = Url::from_file_path(&path) {
                    tracing::debug!("Resolved {} from cache", item_id);
                    return Ok(url);
                }
            }
        }

        let url = self.inner.resolve_url(item_id).await?;
        if matches!(url.scheme(), "http" | "https") {
            self.warm(item_id, &url);
        }
        Ok(url)
    }
}
