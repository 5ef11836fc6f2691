//! Pluggable key-value persistence for the relay engines.
//!
//! Two backends satisfy the [`KeyValue`] contract: an in-process map
//! ([`MemoryStore`], used when no Redis URL is configured) and a Redis
//! backend ([`RedisStore`]) for multi-instance deployments. Every stored
//! value is a self-describing JSON record carrying its own `expiresAt`
//! (epoch milliseconds); the typed [`Store`] wrapper applies expiry-on-read
//! and keeps the absent / present-but-stale distinction the HTTP layer
//! needs for its 404 vs 410 split.
//!
//! Versioning is advisory at the backend level. The in-process map does a
//! real compare-and-swap in `put_if_version`; Redis performs full-record
//! overwrites and reports success, so the engines must close races at the
//! record level (a `version` field plus read-back verification after the
//! write). Both mechanisms are used together.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
            StoreError::Serde(e) => write!(f, "store serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

/// A raw value plus the backend's version counter for the key.
/// Backends without native versioning report 0.
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Minimal contract both backends implement.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditional full-record write. `ttl_ms` is a native-expiry hint;
    /// backends may ignore it (record-level expiry still applies).
    async fn put(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError>;

    /// Conditional write. `expected == 0` means "expect absent". Returns
    /// false on a version conflict. Backends without native versioning
    /// overwrite and report true.
    async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected: u64,
        ttl_ms: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Returns true only when this call removed the key, which makes a
    /// concurrent read-and-delete race have exactly one winner.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys under `prefix/`. Sweeper-only; not on any request path.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// A stored record that knows when it expires.
pub trait Record: Serialize + DeserializeOwned {
    fn expires_at_ms(&self) -> u64;
}

/// Outcome of a typed fetch.
pub enum Fetched<T> {
    /// No value under the key.
    Missing,
    /// A value existed but its `expiresAt` has passed; it was deleted
    /// best-effort before returning.
    Stale,
    /// A live record and the backend version it was read at.
    Live { record: T, version: u64 },
}

/// Typed facade over a backend, shared by all engines.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KeyValue>,
}

impl Store {
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    /// Read and classify. Stale records are deleted best-effort; a failed
    /// delete still reports `Stale` so callers never act on a dead record.
    pub async fn fetch<T: Record>(&self, key: &str) -> Result<Fetched<T>, StoreError> {
        let Some(versioned) = self.kv.get(key).await? else {
            return Ok(Fetched::Missing);
        };
        let record: T = serde_json::from_str(&versioned.value)?;
        if record.expires_at_ms() <= now_ms() {
            let _ = self.kv.del(key).await;
            return Ok(Fetched::Stale);
        }
        Ok(Fetched::Live {
            record,
            version: versioned.version,
        })
    }

    /// Like [`fetch`](Self::fetch) where the caller does not care why the
    /// record is gone.
    pub async fn fetch_live<T: Record>(&self, key: &str) -> Result<Option<(T, u64)>, StoreError> {
        match self.fetch(key).await? {
            Fetched::Live { record, version } => Ok(Some((record, version))),
            Fetched::Missing | Fetched::Stale => Ok(None),
        }
    }

    pub async fn put_record<T: Record>(&self, key: &str, record: &T) -> Result<(), StoreError> {
        let value = serde_json::to_string(record)?;
        self.kv.put(key, &value, remaining_ttl_ms(record)).await
    }

    pub async fn put_record_if_version<T: Record>(
        &self,
        key: &str,
        record: &T,
        expected: u64,
    ) -> Result<bool, StoreError> {
        let value = serde_json::to_string(record)?;
        self.kv
            .put_if_version(key, &value, expected, remaining_ttl_ms(record))
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.kv.del(key).await
    }

    /// Delete every record under `prefix/` whose `expiresAt` has passed.
    /// Returns the number removed. Values that fail to parse are removed
    /// too; a record the engines cannot read is garbage.
    pub async fn purge_expired(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = now_ms();
        let mut removed = 0;
        for key in self.kv.list(prefix).await? {
            let Some(versioned) = self.kv.get(&key).await? else {
                continue;
            };
            let expired = serde_json::from_str::<serde_json::Value>(&versioned.value)
                .ok()
                .and_then(|v| v.get("expiresAt").and_then(|e| e.as_u64()))
                .map(|expires_at| expires_at <= now)
                .unwrap_or(true);
            if expired && self.kv.del(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn remaining_ttl_ms<T: Record>(record: &T) -> Option<u64> {
    Some(record.expires_at_ms().saturating_sub(now_ms()).max(1))
}

/// Delay before optimistic-write attempt `attempt + 1`: exponential from
/// 50 ms, capped at 500 ms, with up to 25 ms of jitter.
pub async fn backoff(attempt: u32) {
    let base = 50u64.saturating_mul(1u64 << attempt.min(4)).min(500);
    let jitter = rand::thread_rng().gen_range(0..=25);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Scratch {
        note: String,
        expires_at: u64,
    }

    impl Record for Scratch {
        fn expires_at_ms(&self) -> u64 {
            self.expires_at
        }
    }

    fn scratch(note: &str, ttl_ms: i64) -> Scratch {
        Scratch {
            note: note.to_string(),
            expires_at: (now_ms() as i64 + ttl_ms) as u64,
        }
    }

    #[tokio::test]
    async fn fetch_classifies_missing_stale_live() {
        let store = Store::new(Arc::new(MemoryStore::new()));

        assert!(matches!(
            store.fetch::<Scratch>("sess/a").await.unwrap(),
            Fetched::Missing
        ));

        store
            .put_record("sess/a", &scratch("live", 60_000))
            .await
            .unwrap();
        assert!(matches!(
            store.fetch::<Scratch>("sess/a").await.unwrap(),
            Fetched::Live { .. }
        ));

        store
            .put_record("sess/b", &scratch("stale", -1))
            .await
            .unwrap();
        assert!(matches!(
            store.fetch::<Scratch>("sess/b").await.unwrap(),
            Fetched::Stale
        ));
        // The stale read deleted it; a second read reports Missing.
        assert!(matches!(
            store.fetch::<Scratch>("sess/b").await.unwrap(),
            Fetched::Missing
        ));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        store
            .put_record("sess/live", &scratch("x", 60_000))
            .await
            .unwrap();
        store
            .put_record("sess/dead", &scratch("y", -1))
            .await
            .unwrap();
        store
            .put_record("peer/other", &scratch("z", -1))
            .await
            .unwrap();

        assert_eq!(store.purge_expired("sess").await.unwrap(), 1);
        assert!(store.fetch_live::<Scratch>("sess/live").await.unwrap().is_some());
        // Untouched namespace still holds its (stale) record.
        assert!(matches!(
            store.fetch::<Scratch>("peer/other").await.unwrap(),
            Fetched::Stale
        ));
    }
}
