use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Cache configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory holding one subdirectory per cache namespace
    pub cache_root: PathBuf,

    // Content cache
    pub content_ttl: Duration,
    pub content_size_budget: u64,

    // Image cache
    pub image_ttl: Duration,
    pub image_memory_max_entries: usize,
    pub image_memory_max_bytes: usize,

    // Fetching
    pub fetch_timeout_ms: u64,
    pub user_agent: String,
}

impl CacheConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            cache_root: env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".xtream-cache")),

            // Content cache
            content_ttl: Duration::from_secs(
                env::var("CONTENT_CACHE_TTL_SECS")
                    .unwrap_or_else(|_| "2592000".to_string())
                    .parse()
                    .unwrap_or(2_592_000), // 30 days
            ),
            content_size_budget: env::var("CONTENT_CACHE_MAX_BYTES")
                .unwrap_or_else(|_| "100000000".to_string())
                .parse()
                .unwrap_or(100_000_000), // 100 MB

            // Image cache
            image_ttl: Duration::from_secs(
                env::var("IMAGE_CACHE_TTL_SECS")
                    .unwrap_or_else(|_| "604800".to_string())
                    .parse()
                    .unwrap_or(604_800), // 7 days
            ),
            image_memory_max_entries: env::var("IMAGE_MEMORY_MAX_ENTRIES")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            image_memory_max_bytes: env::var("IMAGE_MEMORY_MAX_BYTES")
                .unwrap_or_else(|_| "52428800".to_string())
                .parse()
                .unwrap_or(50 * 1024 * 1024), // 50 MB

            // Fetching
            fetch_timeout_ms: env::var("FETCH_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .unwrap_or(30_000), // 30 seconds

            // Use VLC user agent to avoid IPTV server blocks
            user_agent: env::var("USER_AGENT")
                .unwrap_or_else(|_| "VLC/3.0.20 LibVLC/3.0.20".to_string()),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
