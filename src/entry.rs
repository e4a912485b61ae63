//! The per-fingerprint cache entry model: the `data`/`meta`/`lock` key
//! triple, the serialised meta record, and the classification of a lookup
//! snapshot into a handling decision.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Prefix shared by every cache key the proxy writes.
const KEY_PREFIX: &str = "rampart";

/// Value stored under a lock key. Only its presence matters.
pub const LOCK_SENTINEL: &[u8] = b"1";

/// 64-bit fingerprint of a canonical target: the first eight bytes of its
/// SHA-256 digest, big-endian. Every instance in a cluster computes the
/// same value for the same canonical URL.
pub fn fingerprint(target: &str) -> u64 {
    let digest = Sha256::digest(target.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The three cache keys belonging to one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKeys {
    /// Key of the raw response body.
    pub data: String,
    /// Key of the serialised [`MetaRecord`].
    pub meta: String,
    /// Key of the advisory refresh lock.
    pub lock: String,
}

impl EntryKeys {
    /// Derives the key triple for a fingerprint.
    pub fn new(fingerprint: u64) -> Self {
        Self {
            data: format!("{KEY_PREFIX}-{fingerprint}-data"),
            meta: format!("{KEY_PREFIX}-{fingerprint}-meta"),
            lock: format!("{KEY_PREFIX}-{fingerprint}-lock"),
        }
    }
}

/// Response metadata cached alongside the body.
///
/// `expires_at` is fixed once at admission and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Absolute expiry instant, milliseconds since the Unix epoch.
    pub expires_at: u64,
    /// Original `Content-Type` value, parameters included.
    pub content_type: String,
    /// Origin `Server` header, when present.
    pub server: Option<String>,
    /// Origin `Content-Encoding` header, when present.
    pub content_encoding: Option<String>,
    /// Origin `ETag` header, when present.
    pub etag: Option<String>,
    /// Canonical URL that produced the entry. Advisory only.
    pub url: String,
}

impl MetaRecord {
    /// Serialises the record into its cache wire form. Every instance in a
    /// cluster must use the same encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a record from its cache wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Whether the entry is still fresh at `now` (milliseconds).
    pub fn is_fresh(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// Snapshot of the three values fetched in parallel for one fingerprint.
///
/// The cache is best-effort, so any subset may be absent; a lookup error on
/// an individual key is reported by the caller and folded in as absence.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    /// Cached body bytes, when present.
    pub data: Option<Vec<u8>>,
    /// Decoded meta record, when present and decodable.
    pub meta: Option<MetaRecord>,
    /// Whether the lock key exists.
    pub locked: bool,
}

/// The handler's three-way-plus-one decision for a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Entry present and fresh: serve from cache.
    Hit,
    /// Entry present but expired while another requester refreshes it:
    /// serve the stale copy.
    Stale,
    /// Entry present, expired, nobody refreshing: take the lock and go to
    /// the origin.
    Update,
    /// No usable entry: go to the origin.
    Miss,
}

/// Classifies a lookup snapshot. The decision is made once from the
/// snapshot and never re-validated against the live cache.
pub fn classify(lookup: &Lookup, now: u64) -> Decision {
    match (&lookup.data, &lookup.meta) {
        (Some(_), Some(meta)) if meta.is_fresh(now) => Decision::Hit,
        (Some(_), Some(_)) if lookup.locked => Decision::Stale,
        (Some(_), Some(_)) => Decision::Update,
        _ => Decision::Miss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(expires_at: u64) -> MetaRecord {
        MetaRecord {
            expires_at,
            content_type: "text/plain".to_string(),
            server: None,
            content_encoding: None,
            etag: None,
            url: "http://example.com/".to_string(),
        }
    }

    #[test]
    fn key_format() {
        let keys = EntryKeys::new(42);
        assert_eq!(keys.data, "rampart-42-data");
        assert_eq!(keys.meta, "rampart-42-meta");
        assert_eq!(keys.lock, "rampart-42-lock");
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint("/a?b=1"), fingerprint("/a?b=1"));
        assert_ne!(fingerprint("/a?b=1"), fingerprint("/a?b=2"));
    }

    #[test]
    fn meta_round_trip() {
        let record = MetaRecord {
            expires_at: 1_700_000_000_000,
            content_type: "application/json; charset=utf-8".to_string(),
            server: Some("origin/1.0".to_string()),
            content_encoding: Some("gzip".to_string()),
            etag: Some("\"abc\"".to_string()),
            url: "http://example.com/a?b=1".to_string(),
        };
        let decoded = MetaRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn classification_table() {
        let now = 1_000_000;
        let fresh = Lookup {
            data: Some(b"x".to_vec()),
            meta: Some(meta(now + 1)),
            locked: false,
        };
        assert_eq!(classify(&fresh, now), Decision::Hit);

        // A fresh entry is a hit regardless of the lock.
        let fresh_locked = Lookup { locked: true, ..fresh.clone() };
        assert_eq!(classify(&fresh_locked, now), Decision::Hit);

        let expired_locked = Lookup {
            data: Some(b"x".to_vec()),
            meta: Some(meta(now)),
            locked: true,
        };
        assert_eq!(classify(&expired_locked, now), Decision::Stale);

        let expired = Lookup { locked: false, ..expired_locked.clone() };
        assert_eq!(classify(&expired, now), Decision::Update);

        let no_meta = Lookup {
            data: Some(b"x".to_vec()),
            meta: None,
            locked: false,
        };
        assert_eq!(classify(&no_meta, now), Decision::Miss);

        let no_data = Lookup {
            data: None,
            meta: Some(meta(now + 5_000)),
            locked: true,
        };
        assert_eq!(classify(&no_data, now), Decision::Miss);

        assert_eq!(classify(&Lookup::default(), now), Decision::Miss);
    }
}
