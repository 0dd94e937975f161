//! Two-tier caching for Xtream IPTV clients
//!
//! [`BlobStore`] persists expiring byte blobs, one directory per namespace.
//! [`ContentCache`] layers a size budget and the container-extension index on
//! top of it for catalog data, and [`ImageCache`] adds a bounded in-memory
//! tier with coalesced downloads for channel logos and poster art.
//!
//! Instances are plain values constructed from a [`CacheConfig`] plus
//! injected [`Clock`] and [`ByteFetcher`] collaborators; the consuming app's
//! composition root owns the process-wide ones.

mod clock;
mod config;
mod content;
mod error;
mod fetch;
mod image_cache;
mod models;
mod store;
mod typed;

pub use clock::{Clock, SystemClock};
pub use config::CacheConfig;
pub use content::{format_size, ContentCache};
pub use error::{CacheError, FetchError};
pub use fetch::{ByteFetcher, HttpFetcher};
pub use image_cache::{run_memory_pressure_listener, CachedImage, ImageCache};
pub use models::{CacheStats, EntryMetadata};
pub use store::BlobStore;
pub use typed::TypedStore;
