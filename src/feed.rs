//! Feed items and their paginated source.
//!
//! The feed is append-only: pagination extends it, nothing reorders or removes items.

use crate::resolver::PocketBaseResolver;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Media descriptor of a feed item, as stored in PocketBase.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub display_url: Option<String>,
    pub video_url: Option<String>,
    pub poster_url: Option<String>,
    pub duration: Option<f32>,
}

impl Media {
    /// Check if this is a video media type.
    pub fn is_video(&self) -> bool {
        self.media_type == "video"
    }

    /// URL of the asset a player should load: the video for videos, the display image otherwise.
    pub fn playable_url(&self) -> Option<&str> {
        if self.is_video() {
            self.video_url.as_deref()
        } else {
            self.display_url.as_deref()
        }
    }
}

/// One entry of the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: String,
    /// Position assigned by the source; display order follows insertion order.
    pub order: u64,
    pub media: Media,
}

impl FeedItem {
    pub fn new(order: u64, media: Media) -> Self {
        Self {
            id: media.id.clone(),
            order,
            media,
        }
    }
}

/// A page of items returned by a [`FeedSource`].
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    pub items: Vec<FeedItem>,
}

/// Supplies ordered batches of feed items.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch the page at `cursor` (zero-based). Returns fewer than `limit` items at the end
    /// of the data; an empty page is not an error.
    async fn fetch_batch(&self, cursor: u64, limit: usize) -> Result<FeedBatch>;
}

/// Ordered items plus the current position and pagination cursor.
#[derive(Debug, Default)]
pub struct FeedState {
    items: Vec<FeedItem>,
    ids: HashSet<String>,
    current_index: Option<usize>,
    load_cursor: u64,
    exhausted: bool,
}

impl FeedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&FeedItem> {
        self.items.get(index)
    }

    pub fn id_at(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(|item| item.id.as_str())
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_item(&self) -> Option<&FeedItem> {
        self.current_index.and_then(|i| self.items.get(i))
    }

    /// Move the current position. Only the index-change coordinator calls this.
    pub(crate) fn set_current_index(&mut self, index: usize) {
        debug_assert!(index < self.items.len());
        self.current_index = Some(index);
    }

    /// Cursor of the next page to fetch.
    pub fn load_cursor(&self) -> u64 {
        self.load_cursor
    }

    /// Whether the source has reported the end of its data.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Append a fetched page and advance the cursor.
    ///
    /// Items whose id is already in the feed are skipped. A page shorter than
    /// `limit` marks the feed exhausted. Returns the number of items appended.
    pub fn append_batch(&mut self, batch: FeedBatch, limit: usize) -> usize {
        let fetched = batch.items.len();
        let mut appended = 0;

        for item in batch.items {
            if !self.ids.insert(item.id.clone()) {
                tracing::warn!("Skipping duplicate feed item {}", item.id);
                continue;
            }
            self.items.push(item);
            appended += 1;
        }

        self.load_cursor += 1;
        if fetched < limit {
            tracing::info!("Feed exhausted after {} items", self.items.len());
            self.exhausted = true;
        }

        appended
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

/// [`FeedSource`] backed by the PocketBase `media` collection.
pub struct PocketBaseFeed {
    client: Client,
    api: String,
    token: Option<String>,
    resolver: Option<Arc<PocketBaseResolver>>,
}

impl PocketBaseFeed {
    pub fn new(client: Client, api: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            api: api.into().trim_end_matches('/').to_string(),
            token,
            resolver: None,
        }
    }

    /// Seed `resolver` with every fetched record.
    pub fn with_resolver(mut self, resolver: Arc<PocketBaseResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn page_url(&self, cursor: u64, limit: usize) -> String {
        format!(
            "{}/api/collections/media/records?filter={}&sort=created&page={}&perPage={}",
            self.api,
            urlencoding::encode("status='published'"),
            cursor + 1,
            limit
        )
    }
}

#[async_trait]
impl FeedSource for PocketBaseFeed {
    async fn fetch_batch(&self, cursor: u64, limit: usize) -> Result<FeedBatch> {
        let url = self.page_url(cursor, limit);
        tracing::debug!("Fetching feed page {}", url);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let res = request
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Server returned error")?;
        let parsed: ListResponse<Media> = res.json().await.context("Failed to parse feed page")?;
        if let Some(resolver) = &self.resolver {
            for media in &parsed.items {
                resolver.remember(media).await;
            }
        }

        let base = cursor * limit as u64;
        let items = parsed
            .items
            .into_iter()
            .enumerate()
            .map(|(i, media)| FeedItem::new(base + i as u64, media))
            .collect();

        Ok(FeedBatch { items })
    }
}
