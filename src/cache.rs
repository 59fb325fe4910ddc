//! LRU disk cache for downloaded feed media.
//!
//! One file per item, stored as `<dir>/<item id>/<url hash>.<ext>`. The index is
//! rebuilt from disk at startup; the least recently used files are deleted
//! once the cache exceeds its size budget.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Metadata for a cached asset.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
}

/// LRU cache of media files keyed by item id.
pub struct Cache {
    /// Base directory for cached files.
    cache_dir: PathBuf,
    /// Maximum cache size in bytes.
    max_size: u64,
    /// Current cache size in bytes.
    current_size: u64,
    lru: LruCache<String, CacheEntry>,
}

impl Cache {
    /// Create a cache rooted at `cache_dir` holding at most `max_size` bytes.
    pub fn new(cache_dir: PathBuf, max_size: u64) -> Result<Self> {
        fs::create_dir_all(&cache_dir).context("Failed to create cache directory")?;

        let mut cache = Self {
            cache_dir,
            max_size,
            current_size: 0,
            lru: LruCache::unbounded(),
        };

        cache.scan_existing();

        tracing::info!(
            "Cache initialized: {:.2} MB / {:.2} MB used ({} items)",
            cache.current_size as f64 / 1024.0 / 1024.0,
            max_size as f64 / 1024.0 / 1024.0,
            cache.lru.len()
        );

        Ok(cache)
    }

    /// Populate the index from files already on disk.
    fn scan_existing(&mut self) {
        for entry in WalkDir::new(&self.cache_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path().to_path_buf();
            if is_partial(&path) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(item_id) = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
            else {
                continue;
            };
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            let size = metadata.len();
            if let Some((_, replaced)) = self.lru.push(item_id, CacheEntry { path, size }) {
                // Two files for one item: keep whichever was scanned last.
                self.current_size = self.current_size.saturating_sub(replaced.size);
                let _ = fs::remove_file(&replaced.path);
            }
            self.current_size += size;
        }
    }

    /// Path where the media at `url` for `item_id` is stored.
    pub fn path_for(&self, item_id: &str, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let hash = format!("{:x}", digest);
        let ext = url
            .rsplit('/')
            .next()
            .and_then(|name| name.split('?').next())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 5)
            .unwrap_or("bin");
        self.cache_dir
            .join(item_id)
            .join(format!("{}.{}", &hash[..16], ext))
    }

    /// Cached file for an item, if present on disk.
    pub fn get_cached_path(&self, item_id: &str) -> Option<PathBuf> {
        self.lru
            .peek(item_id)
            .map(|entry| entry.path.clone())
            .filter(|path| path.exists())
    }

    /// Mark an item as recently used.
    pub fn touch(&mut self, item_id: &str) {
        let _ = self.lru.get(item_id);
    }

    /// Record a fully written file, evicting older entries to stay within budget.
    pub fn commit(&mut self, item_id: &str, path: PathBuf, size: u64) {
        if let Some(previous) = self.lru.pop(item_id) {
            self.current_size = self.current_size.saturating_sub(previous.size);
            if previous.path != path {
                let _ = fs::remove_file(&previous.path);
            }
        }

        while self.current_size + size > self.max_size {
            if !self.evict_lru() {
                tracing::warn!("Cache full and cannot evict, continuing anyway");
                break;
            }
        }

        self.lru.put(item_id.to_string(), CacheEntry { path, size });
        self.current_size += size;

        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            item_id,
            size as f64 / 1024.0,
            self.current_size as f64 / 1024.0 / 1024.0
        );
    }

    /// Evict the least recently used item.
    fn evict_lru(&mut self) -> bool {
        let Some((item_id, entry)) = self.lru.pop_lru() else {
            return false;
        };
        tracing::debug!("Evicting cached media for {}: {:?}", item_id, entry.path);

        if entry.path.exists() {
            if let Err(e) = fs::remove_file(&entry.path) {
                tracing::warn!("Failed to remove cached file: {}", e);
            }
        }
        // Ignore error if not empty.
        if let Some(parent) = entry.path.parent() {
            let _ = fs::remove_dir(parent);
        }

        self.current_size = self.current_size.saturating_sub(entry.size);
        true
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            current_size: self.current_size,
            max_size: self.max_size,
            item_count: self.lru.len(),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub item_count: usize,
}

fn is_partial(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "part")
}

/// Download `url` to `path`, writing through a `.part` file so a crash never
/// leaves a truncated entry behind. Returns the number of bytes written.
pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    token: Option<&str>,
) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create media cache directory")?;
    }

    tracing::debug!("Downloading {} to {:?}", url, path);

    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .context("Failed to send request")?
        .error_for_status()
        .context("Server returned error")?;

    let partial = path.with_extension("part");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .context("Failed to create cache file")?;

    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Failed to read response")?;
        file.write_all(&chunk)
            .await
            .context("Failed to write cache file")?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("Failed to flush cache file")?;
    drop(file);

    tokio::fs::rename(&partial, path)
        .await
        .context("Failed to finalize cache file")?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(cache: &Cache, id: &str, url: &str, len: usize) -> PathBuf {
        let path = cache.path_for(id, url);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0u8; len]).unwrap();
        path
    }

    #[test]
    fn test_path_for_keeps_extension() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().to_path_buf(), 1024).unwrap();
        let path = cache.path_for("abc", "https://cdn.test/media/clip.mp4?sig=1");
        assert_eq!(path.extension().unwrap(), "mp4");
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "abc");

        let other = cache.path_for("abc", "https://cdn.test/media/other");
        assert_eq!(other.extension().unwrap(), "bin");
    }

    #[test]
    fn test_commit_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::new(dir.path().to_path_buf(), 100).unwrap();

        let a = write(&cache, "a", "https://x/a.mp4", 40);
        cache.commit("a", a.clone(), 40);
        let b = write(&cache, "b", "https://x/b.mp4", 40);
        cache.commit("b", b.clone(), 40);
        cache.touch("a");

        let c = write(&cache, "c", "https://x/c.mp4", 40);
        cache.commit("c", c, 40);

        assert!(cache.get_cached_path("a").is_some());
        assert!(cache.get_cached_path("b").is_none());
        assert!(!b.exists());
        assert_eq!(cache.stats().current_size, 80);
        assert_eq!(cache.stats().item_count, 2);
    }

    #[test]
    fn test_rescan_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = Cache::new(dir.path().to_path_buf(), 1000).unwrap();
            let path = write(&cache, "a", "https://x/a.mp4", 10);
            cache.commit("a", path, 10);
            let partial = cache.path_for("b", "https://x/b.mp4").with_extension("part");
            fs::create_dir_all(partial.parent().unwrap()).unwrap();
            fs::write(&partial, b"half").unwrap();
        }

        let cache = Cache::new(dir.path().to_path_buf(), 1000).unwrap();
        assert!(cache.get_cached_path("a").is_some());
        assert!(cache.get_cached_path("b").is_none());
        assert_eq!(cache.stats().current_size, 10);
    }
}
