//! Typed facade over the blob store
//!
//! Serializes structured values (catalog lists, metadata maps) to JSON and
//! stores the bytes through an underlying [`BlobStore`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;
use crate::store::BlobStore;

/// Serialize/deserialize structured values over a [`BlobStore`]
#[derive(Clone)]
pub struct TypedStore {
    inner: BlobStore,
}

impl TypedStore {
    pub fn new(inner: BlobStore) -> Self {
        Self { inner }
    }

    /// Access the underlying byte store
    pub fn raw(&self) -> &BlobStore {
        &self.inner
    }

    /// Serialize `value` and persist it under `key`
    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CacheError::EncodingFailed(e.to_string()))?;
        self.inner.save(key, &bytes).await
    }

    /// Load and deserialize the value stored under `key`
    ///
    /// `Ok(None)` means no such entry; a present-but-corrupt entry is
    /// `Err(DecodingFailed)` so the two cases stay distinguishable.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let bytes = match self.inner.load(key).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::DecodingFailed(e.to_string()))
    }
}
