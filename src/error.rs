//! Cache error types
//!
//! Every variant carries an owned payload so results stay `Clone`; a failed
//! download is delivered verbatim to each waiter attached to the shared
//! in-flight handle.

use thiserror::Error;

/// Errors surfaced by the cache layer
///
/// Absence is not an error: lookups return `Ok(None)` for missing or expired
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Local storage write error
    #[error("cache write failed: {0}")]
    WriteFailed(String),

    /// Entry present but unreadable
    #[error("cache read failed: {0}")]
    ReadFailed(String),

    /// Value could not be serialized for storage
    #[error("failed to encode cached value: {0}")]
    EncodingFailed(String),

    /// Stored bytes could not be deserialized (present but corrupt)
    #[error("failed to decode cached value: {0}")]
    DecodingFailed(String),

    /// Downloaded bytes were not a decodable image
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// The underlying network fetch failed
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Errors from the byte-fetching collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network/connection error
    #[error("network error: {0}")]
    Network(String),

    /// HTTP error (non-2xx status)
    #[error("http error: {0}")]
    Http(u16),
}
