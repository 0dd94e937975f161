//! Disk-backed expiring blob store
//!
//! One directory per namespace. Each entry is a `.data` payload file plus a
//! `.meta.json` sidecar carrying the creation timestamp; an entry only exists
//! when both files do. Entries expire a fixed interval after creation and are
//! deleted lazily on load or eagerly by [`BlobStore::sweep_expired`].

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::clock::Clock;
use crate::error::CacheError;
use crate::models::{CacheStats, EntryMetadata};

const DATA_SUFFIX: &str = ".data";
const META_SUFFIX: &str = ".meta.json";

/// Keys longer than this after sanitizing are replaced by their SHA1 hash
const MAX_KEY_LEN: usize = 50;

/// Disk-backed key/value store with per-entry expiration
///
/// Cheap to clone; clones share the same namespace directory.
#[derive(Clone)]
pub struct BlobStore {
    dir: PathBuf,
    ttl_millis: i64,
    clock: Arc<dyn Clock>,
}

impl BlobStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(
        dir: PathBuf,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::WriteFailed(e.to_string()))?;

        Ok(Self {
            dir,
            ttl_millis: ttl.as_millis() as i64,
            clock,
        })
    }

    /// Save a payload under `key`, overwriting any previous entry
    ///
    /// The payload lands before the metadata sidecar, each through a temp
    /// file and rename, so a reader never sees a sidecar without its payload.
    /// Re-saving a key resets its creation time.
    pub async fn save(&self, key: &str, payload: &[u8]) -> Result<(), CacheError> {
        let name = normalized_file_name(key);

        self.write_atomic(&data_name(&name), payload).await?;

        let metadata = EntryMetadata {
            created_at: self.clock.now_millis(),
        };
        let encoded = serde_json::to_vec(&metadata)
            .map_err(|e| CacheError::WriteFailed(e.to_string()))?;
        self.write_atomic(&meta_name(&name), &encoded).await?;

        Ok(())
    }

    /// Load the payload stored under `key`
    ///
    /// `Ok(None)` when the entry is absent or expired; expired and
    /// metadata-corrupt entries are deleted before returning. A payload that
    /// exists but cannot be read is `Err(ReadFailed)`.
    pub async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let name = normalized_file_name(key);

        let meta_bytes = match fs::read(self.dir.join(meta_name(&name))).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::ReadFailed(e.to_string())),
        };

        let fresh = serde_json::from_slice::<EntryMetadata>(&meta_bytes)
            .map(|meta| !self.is_expired(&meta))
            .unwrap_or(false);
        if !fresh {
            self.remove(key).await;
            return Ok(None);
        }

        match fs::read(self.dir.join(data_name(&name))).await {
            Ok(bytes) => Ok(Some(bytes)),
            // sidecar without payload counts as absent
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::ReadFailed(e.to_string())),
        }
    }

    /// Remove the entry for `key`; no-op when absent
    pub async fn remove(&self, key: &str) {
        let name = normalized_file_name(key);
        let _ = fs::remove_file(self.dir.join(data_name(&name))).await;
        let _ = fs::remove_file(self.dir.join(meta_name(&name))).await;
    }

    /// Delete the whole namespace and recreate it empty
    pub async fn remove_all(&self) -> Result<(), CacheError> {
        let _ = fs::remove_dir_all(&self.dir).await;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::WriteFailed(e.to_string()))
    }

    /// Remove every expired entry, returning how many were deleted
    ///
    /// Only `.meta.json` sidecars are enumerated: entries whose metadata does
    /// not parse are skipped in place, and `.data` files that lost their
    /// sidecar are never touched.
    // TODO: sweep_orphans() for payload files without a metadata sidecar
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to enumerate cache dir {}: {}", self.dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file_name.strip_suffix(META_SUFFIX) else {
                continue;
            };

            let meta_bytes = match fs::read(entry.path()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read cache metadata {}: {}", file_name, e);
                    continue;
                }
            };

            match serde_json::from_slice::<EntryMetadata>(&meta_bytes) {
                Ok(meta) if self.is_expired(&meta) => {
                    let _ = fs::remove_file(self.dir.join(data_name(name))).await;
                    let _ = fs::remove_file(entry.path()).await;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Skipping unreadable cache metadata {}: {}", file_name, e);
                }
            }
        }

        removed
    }

    /// Sum of on-disk sizes of all files in the namespace
    pub async fn total_size_bytes(&self) -> u64 {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut total = 0u64;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(metadata) = entry.metadata().await {
                total += metadata.len();
            }
        }

        total
    }

    /// Number of logical entries (payload files) in the namespace
    pub async fn item_count(&self) -> usize {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut count = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().ends_with(DATA_SUFFIX) {
                count += 1;
            }
        }

        count
    }

    /// Item count and total size in one pass
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            item_count: self.item_count().await,
            size_bytes: self.total_size_bytes().await,
        }
    }

    fn is_expired(&self, meta: &EntryMetadata) -> bool {
        self.clock.now_millis() > meta.created_at + self.ttl_millis
    }

    async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.dir.join(file_name);
        let tmp_path = self.dir.join(format!("{}.tmp", file_name));

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);

            // Atomic replace to avoid readers seeing partial writes
            let _ = fs::remove_file(&path).await;
            fs::rename(&tmp_path, &path).await
        };

        write
            .await
            .map_err(|e: std::io::Error| CacheError::WriteFailed(e.to_string()))
    }
}

// ============ Path Helpers ============

fn data_name(name: &str) -> String {
    format!("{}{}", name, DATA_SUFFIX)
}

fn meta_name(name: &str) -> String {
    format!("{}{}", name, META_SUFFIX)
}

/// Build a filesystem-safe file name for a cache key
///
/// Unsafe characters are stripped; keys that sanitize to more than
/// `MAX_KEY_LEN` characters (or to nothing) become the SHA1 hex of the
/// original key. The original key is not recoverable from the name.
fn normalized_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    if sanitized.is_empty() || sanitized.len() > MAX_KEY_LEN {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    } else {
        sanitized
    }
}
