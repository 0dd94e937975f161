use serde::{Deserialize, Serialize};

/// Sidecar record persisted next to each cached payload
///
/// Unknown fields are ignored on read so the format can grow without
/// breaking old entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Creation time in epoch milliseconds, set on save and immutable after
    pub created_at: i64,
}

/// Aggregate statistics for one cache namespace
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub item_count: usize,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trip() {
        let meta = EntryMetadata {
            created_at: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("createdAt"));

        let decoded: EntryMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.created_at, meta.created_at);
    }

    #[test]
    fn test_metadata_ignores_unknown_fields() {
        let decoded: EntryMetadata =
            serde_json::from_str(r#"{"createdAt":42,"version":2}"#).unwrap();
        assert_eq!(decoded.created_at, 42);
    }
}
