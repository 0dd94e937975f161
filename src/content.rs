//! Catalog content cache
//!
//! Couples a long-TTL disk namespace with a soft size budget and the
//! persisted stream-id → container-extension index used to build playback
//! URLs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::models::CacheStats;
use crate::store::BlobStore;
use crate::typed::TypedStore;

/// Namespace directory under the cache root
const NAMESPACE: &str = "content";

/// Store key for the persisted container-extension index
const EXTENSIONS_KEY: &str = "container_extensions";

/// Extension assumed for stream ids missing from the index
const DEFAULT_EXTENSION: &str = "mp4";

/// Catalog cache with a size budget and container-extension lookups
#[derive(Clone)]
pub struct ContentCache {
    store: TypedStore,
    size_budget: u64,
    extensions: Arc<RwLock<HashMap<String, String>>>,
}

impl ContentCache {
    /// Open the content cache, load the persisted extension index, and run
    /// one maintenance pass
    ///
    /// The caller re-runs maintenance on its own cadence (app foreground,
    /// periodic tick); this type has no timer of its own.
    pub async fn open(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let store = BlobStore::open(
            config.cache_root.join(NAMESPACE),
            config.content_ttl,
            clock,
        )
        .await?;

        let cache = Self {
            store: TypedStore::new(store),
            size_budget: config.content_size_budget,
            extensions: Arc::new(RwLock::new(HashMap::new())),
        };

        cache.load_extension_index().await;
        cache.run_maintenance().await;

        Ok(cache)
    }

    // ============ Container Extensions ============

    /// Rebuild the extension index from catalog items and persist it
    ///
    /// Later duplicates of a stream id win. Persistence is best-effort; the
    /// in-memory index is refreshed regardless.
    pub async fn save_container_extensions(&self, items: &[(String, String)]) {
        let map: HashMap<String, String> = items.iter().cloned().collect();

        if let Err(e) = self.store.save(EXTENSIONS_KEY, &map).await {
            warn!("Failed to persist container extension index: {}", e);
        }

        *self.extensions.write().await = map;
    }

    /// Container extension for a stream id, `"mp4"` when unknown
    pub async fn container_extension(&self, stream_id: &str) -> String {
        self.extensions
            .read()
            .await
            .get(stream_id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
    }

    async fn load_extension_index(&self) {
        match self
            .store
            .load::<HashMap<String, String>>(EXTENSIONS_KEY)
            .await
        {
            Ok(Some(map)) => *self.extensions.write().await = map,
            Ok(None) => {}
            Err(e) => warn!("Failed to load container extension index: {}", e),
        }
    }

    // ============ Catalog Payloads ============

    /// Persist a catalog payload (channel/movie/series lists) under `key`
    pub async fn save_catalog<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.store.save(key, value).await
    }

    /// Load a catalog payload; `None` when absent or expired
    pub async fn load_catalog<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        self.store.load(key).await
    }

    // ============ Maintenance ============

    /// Sweep expired entries, then clear the namespace when over budget
    // TODO: partial eviction that drops oldest entries until under budget
    pub async fn run_maintenance(&self) {
        let swept = self.store.raw().sweep_expired().await;
        if swept > 0 {
            info!(cache_gc_expired = swept, "expired content entries removed");
        }

        let size = self.store.raw().total_size_bytes().await;
        if size > self.size_budget {
            info!(
                cache_size = size,
                size_budget = self.size_budget,
                "content cache over budget, clearing"
            );
            if let Err(e) = self.store.raw().remove_all().await {
                warn!("Failed to clear content cache: {}", e);
            }
        }
    }

    /// Remove every cached entry, including the persisted extension index
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.store.raw().remove_all().await?;
        self.extensions.write().await.clear();
        Ok(())
    }

    // ============ Statistics ============

    pub async fn cache_size_bytes(&self) -> u64 {
        self.store.raw().total_size_bytes().await
    }

    pub async fn item_count(&self) -> usize {
        self.store.raw().item_count().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.store.raw().stats().await
    }
}

/// Format a byte count for display (decimal KB/MB/GB)
pub fn format_size(bytes: u64) -> String {
    const UNIT: f64 = 1000.0;
    let bytes = bytes as f64;

    if bytes >= UNIT * UNIT * UNIT {
        format!("{:.1} GB", bytes / (UNIT * UNIT * UNIT))
    } else if bytes >= UNIT * UNIT {
        format!("{:.1} MB", bytes / (UNIT * UNIT))
    } else {
        format!("{:.0} KB", bytes / UNIT)
    }
}
