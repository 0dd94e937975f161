//! Two-tier image cache with coalesced downloads
//!
//! Memory tier: LRU map bounded by entry count and by total encoded-byte
//! cost. Disk tier: an expiring [`BlobStore`] namespace. Concurrent requests
//! for the same URL share a single download; the result (or error) is fanned
//! out to every waiter, and the in-flight entry is removed exactly once, by
//! the finishing download itself.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use image::DynamicImage;
use lru::LruCache;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{CacheError, FetchError};
use crate::fetch::ByteFetcher;
use crate::models::CacheStats;
use crate::store::BlobStore;

/// Namespace directory under the cache root
const NAMESPACE: &str = "images";

/// A decoded image together with the encoded bytes it came from
#[derive(Debug)]
pub struct CachedImage {
    pub bytes: Vec<u8>,
    pub image: DynamicImage,
}

impl CachedImage {
    fn decode(bytes: Vec<u8>) -> Result<Self, CacheError> {
        let image = image::load_from_memory(&bytes)
            .map_err(|e| CacheError::ImageDecode(e.to_string()))?;
        Ok(Self { bytes, image })
    }

    /// Cost charged against the memory tier (encoded byte length)
    fn cost(&self) -> usize {
        self.bytes.len()
    }
}

type SharedDownload = Shared<BoxFuture<'static, Result<Arc<CachedImage>, CacheError>>>;

/// Count- and cost-bounded LRU memory tier
struct MemoryTier {
    entries: LruCache<String, Arc<CachedImage>>,
    max_bytes: usize,
    current_bytes: usize,
}

impl MemoryTier {
    fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_entries.max(1)).unwrap()),
            max_bytes,
            current_bytes: 0,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<CachedImage>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, image: Arc<CachedImage>) {
        // an image costlier than the whole budget never enters the tier
        if image.cost() > self.max_bytes {
            return;
        }

        self.current_bytes += image.cost();
        if let Some((_, displaced)) = self.entries.push(key, image) {
            self.current_bytes = self.current_bytes.saturating_sub(displaced.cost());
        }

        while self.current_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.current_bytes = self.current_bytes.saturating_sub(evicted.cost());
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(removed) = self.entries.pop(key) {
            self.current_bytes = self.current_bytes.saturating_sub(removed.cost());
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }
}

/// Memory + disk image cache with per-URL download coalescing
///
/// Cheap to clone; clones share both tiers and the in-flight table.
#[derive(Clone)]
pub struct ImageCache {
    memory: Arc<Mutex<MemoryTier>>,
    disk: BlobStore,
    inflight: Arc<Mutex<HashMap<String, SharedDownload>>>,
    fetcher: Arc<dyn ByteFetcher>,
}

impl ImageCache {
    /// Open the image cache and kick off a background sweep of the disk tier
    pub async fn open(
        config: &CacheConfig,
        fetcher: Arc<dyn ByteFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let disk = BlobStore::open(
            config.cache_root.join(NAMESPACE),
            config.image_ttl,
            clock,
        )
        .await?;

        let cache = Self {
            memory: Arc::new(Mutex::new(MemoryTier::new(
                config.image_memory_max_entries,
                config.image_memory_max_bytes,
            ))),
            disk,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            fetcher,
        };

        // sweep off the startup path
        let sweeper = cache.disk.clone();
        tokio::spawn(async move {
            let swept = sweeper.sweep_expired().await;
            if swept > 0 {
                debug!(cache_gc_expired = swept, "expired image entries removed");
            }
        });

        Ok(cache)
    }

    /// Cache-only lookup: memory tier, then disk tier, never the network
    ///
    /// A disk hit backfills the memory tier. Disk problems are swallowed;
    /// this path only ever answers "have it" or "don't".
    pub async fn cached_image(&self, url: &Url) -> Option<Arc<CachedImage>> {
        let key = cache_key(url);

        if let Some(image) = self.memory.lock().unwrap().get(&key) {
            return Some(image);
        }

        match self.disk.load(&key).await {
            Ok(Some(bytes)) => match CachedImage::decode(bytes) {
                Ok(image) => {
                    let image = Arc::new(image);
                    self.memory.lock().unwrap().insert(key, image.clone());
                    Some(image)
                }
                Err(e) => {
                    debug!("Cached image bytes undecodable for {}: {}", url, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Failed to load image from disk cache: {}", e);
                None
            }
        }
    }

    /// Fetch-or-download path
    ///
    /// Checks both cache tiers, then either attaches to the in-flight
    /// download for this URL or starts one. On success both tiers are
    /// populated (disk asynchronously, off the delivery path); on failure
    /// nothing is written and every waiter sees the same error.
    pub async fn load_image(&self, url: &Url) -> Result<Arc<CachedImage>, CacheError> {
        if let Some(image) = self.cached_image(url).await {
            return Ok(image);
        }

        let key = cache_key(url);
        let download = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(existing) = inflight.get(&key) {
                debug!("Attaching to in-flight download for {}", url);
                existing.clone()
            } else {
                // the download runs on its own task so waiter cancellation
                // never cancels the shared fetch
                let handle = tokio::spawn(self.clone().download(url.clone(), key.clone()));
                let download: SharedDownload = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(CacheError::Fetch(FetchError::Network(format!(
                            "download task failed: {}",
                            e
                        )))),
                    }
                }
                .boxed()
                .shared();

                inflight.insert(key.clone(), download.clone());
                download
            }
        };

        download.await
    }

    async fn download(self, url: Url, key: String) -> Result<Arc<CachedImage>, CacheError> {
        let result = self.fetch_and_decode(&url).await;

        match &result {
            Ok(image) => {
                self.memory.lock().unwrap().insert(key.clone(), image.clone());

                // persist off the delivery path
                let disk = self.disk.clone();
                let disk_key = key.clone();
                let bytes = image.bytes.clone();
                tokio::spawn(async move {
                    if let Err(e) = disk.save(&disk_key, &bytes).await {
                        warn!("Failed to write image to disk cache: {}", e);
                    }
                });
            }
            Err(e) => {
                debug!("Image download failed for {}: {}", url, e);
            }
        }

        // the finishing download is the only remover of its in-flight entry
        self.inflight.lock().unwrap().remove(&key);

        result
    }

    async fn fetch_and_decode(&self, url: &Url) -> Result<Arc<CachedImage>, CacheError> {
        let bytes = self.fetcher.fetch(url.as_str()).await?;
        Ok(Arc::new(CachedImage::decode(bytes)?))
    }

    /// Remove one image from both tiers
    pub async fn remove_image(&self, url: &Url) {
        let key = cache_key(url);
        self.memory.lock().unwrap().remove(&key);
        self.disk.remove(&key).await;
    }

    /// Drop every entry from the memory tier; the disk tier is untouched
    pub fn clear_memory(&self) {
        self.memory.lock().unwrap().clear();
    }

    /// Clear both tiers
    pub async fn clear_cache(&self) -> Result<(), CacheError> {
        self.clear_memory();
        self.disk.remove_all().await
    }

    /// Disk-tier statistics
    pub async fn disk_stats(&self) -> CacheStats {
        self.disk.stats().await
    }
}

fn cache_key(url: &Url) -> String {
    url.as_str().to_string()
}

/// Listen for memory-pressure signals, clearing the memory tier on each one
///
/// Runs until every sender is dropped. Spawn it next to the cache:
/// `tokio::spawn(run_memory_pressure_listener(cache.clone(), rx))`.
pub async fn run_memory_pressure_listener(
    cache: ImageCache,
    mut signals: broadcast::Receiver<()>,
) {
    loop {
        match signals.recv().await {
            Ok(()) => {
                debug!("Memory pressure signal, clearing image memory tier");
                cache.clear_memory();
            }
            // missed signals still mean pressure
            Err(broadcast::error::RecvError::Lagged(_)) => cache.clear_memory(),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> CacheConfig {
        CacheConfig {
            cache_root: root.to_path_buf(),
            content_ttl: Duration::from_secs(3600),
            content_size_budget: 100_000_000,
            image_ttl: Duration::from_secs(3600),
            image_memory_max_entries: 100,
            image_memory_max_bytes: 50 * 1024 * 1024,
            fetch_timeout_ms: 5_000,
            user_agent: "test".to_string(),
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::new(1, 1));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    fn test_image(cost: usize) -> Arc<CachedImage> {
        Arc::new(CachedImage {
            bytes: vec![0; cost],
            image: DynamicImage::ImageRgba8(image::RgbaImage::new(1, 1)),
        })
    }

    struct CountingFetcher {
        calls: AtomicUsize,
        response: Result<Vec<u8>, FetchError>,
        delay: Duration,
    }

    impl CountingFetcher {
        fn ok(bytes: Vec<u8>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response: Ok(bytes),
                delay,
            })
        }

        fn failing(error: FetchError, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response: Err(error),
                delay,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ByteFetcher for CountingFetcher {
        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.response.clone()
        }
    }

    async fn open_cache(dir: &TempDir, fetcher: Arc<dyn ByteFetcher>) -> ImageCache {
        ImageCache::open(&test_config(dir.path()), fetcher, Arc::new(SystemClock))
            .await
            .unwrap()
    }

    fn poster_url(name: &str) -> Url {
        Url::parse(&format!("http://example.com/posters/{}.png", name)).unwrap()
    }

    async fn wait_for_disk_items(cache: &ImageCache, expected: usize) {
        for _ in 0..100 {
            if cache.disk.item_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("disk tier never reached {} items", expected);
    }

    fn memory_len(cache: &ImageCache) -> usize {
        cache.memory.lock().unwrap().entries.len()
    }

    // ============ MemoryTier ============

    #[test]
    fn test_memory_tier_count_bound() {
        let mut tier = MemoryTier::new(3, 1_000_000);
        for i in 0..5 {
            tier.insert(format!("img-{}", i), test_image(10));
        }

        assert_eq!(tier.entries.len(), 3);
        assert!(tier.get("img-0").is_none());
        assert!(tier.get("img-4").is_some());
    }

    #[test]
    fn test_memory_tier_cost_bound() {
        let mut tier = MemoryTier::new(100, 250);
        tier.insert("a".to_string(), test_image(100));
        tier.insert("b".to_string(), test_image(100));
        tier.insert("c".to_string(), test_image(100));

        assert!(tier.current_bytes <= 250);
        assert!(tier.get("a").is_none()); // oldest evicted
        assert!(tier.get("c").is_some());
    }

    #[test]
    fn test_memory_tier_rejects_oversized_entry() {
        let mut tier = MemoryTier::new(100, 50);
        tier.insert("huge".to_string(), test_image(51));

        assert_eq!(tier.entries.len(), 0);
        assert_eq!(tier.current_bytes, 0);
    }

    #[test]
    fn test_memory_tier_replace_same_key_adjusts_cost() {
        let mut tier = MemoryTier::new(100, 1_000);
        tier.insert("k".to_string(), test_image(400));
        tier.insert("k".to_string(), test_image(100));

        assert_eq!(tier.entries.len(), 1);
        assert_eq!(tier.current_bytes, 100);
    }

    // ============ ImageCache ============

    #[tokio::test]
    async fn test_coalesces_concurrent_downloads() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::from_millis(50));
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("movie-1");

        let results = join_all((0..8).map(|_| cache.load_image(&url))).await;

        assert_eq!(fetcher.call_count(), 1);
        for result in results {
            assert_eq!(result.unwrap().bytes, png_bytes());
        }
    }

    #[tokio::test]
    async fn test_fetch_error_reaches_every_waiter() {
        let dir = TempDir::new().unwrap();
        let fetcher =
            CountingFetcher::failing(FetchError::Http(404), Duration::from_millis(50));
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("missing");

        let results = join_all((0..4).map(|_| cache.load_image(&url))).await;

        assert_eq!(fetcher.call_count(), 1);
        for result in results {
            assert_eq!(
                result.unwrap_err(),
                CacheError::Fetch(FetchError::Http(404))
            );
        }

        // a failed download writes to neither tier
        assert_eq!(memory_len(&cache), 0);
        assert_eq!(cache.disk.item_count().await, 0);
        assert!(cache.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_can_be_retried() {
        let dir = TempDir::new().unwrap();
        let fetcher =
            CountingFetcher::failing(FetchError::Http(500), Duration::from_millis(5));
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("flaky");

        assert!(cache.load_image(&url).await.is_err());
        assert!(cache.load_image(&url).await.is_err());

        // the failed entry left the in-flight table, so each call fetched
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_bytes_cache_nothing() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(b"not an image".to_vec(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("garbage");

        let result = cache.load_image(&url).await;
        assert!(matches!(result, Err(CacheError::ImageDecode(_))));
        assert_eq!(memory_len(&cache), 0);
        assert_eq!(cache.disk.item_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_load_hits_memory_tier() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("series-5");

        cache.load_image(&url).await.unwrap();
        cache.load_image(&url).await.unwrap();

        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_disk_tier_survives_memory_clear() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("channel-9");

        cache.load_image(&url).await.unwrap();
        wait_for_disk_items(&cache, 1).await;

        cache.clear_memory();
        assert_eq!(memory_len(&cache), 0);

        // disk hit, no new fetch, memory backfilled
        let image = cache.cached_image(&url).await.unwrap();
        assert_eq!(image.bytes, png_bytes());
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(memory_len(&cache), 1);
    }

    #[tokio::test]
    async fn test_cached_image_never_fetches() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;

        assert!(cache.cached_image(&poster_url("cold")).await.is_none());
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_image_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;
        let url = poster_url("gone");

        cache.load_image(&url).await.unwrap();
        wait_for_disk_items(&cache, 1).await;

        cache.remove_image(&url).await;

        assert!(cache.cached_image(&url).await.is_none());
        assert_eq!(cache.disk.item_count().await, 0);
    }

    #[tokio::test]
    async fn test_clear_cache_clears_both_tiers() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;

        cache.load_image(&poster_url("one")).await.unwrap();
        cache.load_image(&poster_url("two")).await.unwrap();
        wait_for_disk_items(&cache, 2).await;

        cache.clear_cache().await.unwrap();

        assert_eq!(memory_len(&cache), 0);
        assert_eq!(cache.disk.item_count().await, 0);
    }

    #[tokio::test]
    async fn test_memory_pressure_clears_memory_tier_only() {
        let dir = TempDir::new().unwrap();
        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = open_cache(&dir, fetcher.clone()).await;
        let (tx, rx) = broadcast::channel(4);
        tokio::spawn(run_memory_pressure_listener(cache.clone(), rx));

        cache.load_image(&poster_url("warm")).await.unwrap();
        wait_for_disk_items(&cache, 1).await;
        assert_eq!(memory_len(&cache), 1);

        tx.send(()).unwrap();
        for _ in 0..100 {
            if memory_len(&cache) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(memory_len(&cache), 0);
        assert_eq!(cache.disk.item_count().await, 1);
    }

    #[tokio::test]
    async fn test_memory_tier_bound_holds_through_load_image() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        config.image_memory_max_entries = 3;

        let fetcher = CountingFetcher::ok(png_bytes(), Duration::ZERO);
        let cache = ImageCache::open(&config, fetcher, Arc::new(SystemClock))
            .await
            .unwrap();

        for i in 0..6 {
            cache.load_image(&poster_url(&format!("p{}", i))).await.unwrap();
        }

        assert!(memory_len(&cache) <= 3);
    }
}
