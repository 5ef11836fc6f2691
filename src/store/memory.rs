//! In-process backend: a mutex-guarded map with per-key version counters.
//!
//! Used when no Redis URL is configured, and by every test. The native TTL
//! hint is ignored; record-level expiry-on-read and the sweeper handle
//! lifetimes. The mutex is only ever held across non-async map operations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{KeyValue, StoreError, Versioned};

struct Entry {
    value: String,
    version: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map means a panic mid-insert; the data is still sound.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValue for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.lock().get(key).map(|entry| Versioned {
            value: entry.value.clone(),
            version: entry.version,
        }))
    }

    async fn put(&self, key: &str, value: &str, _ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let version = entries.get(key).map(|e| e.version).unwrap_or(0) + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
            },
        );
        Ok(())
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        expected: u64,
        _ttl_ms: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        let current = entries.get(key).map(|e| e.version).unwrap_or(0);
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version: current + 1,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let needle = format!("{prefix}/");
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(&needle))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_count_up_per_key() {
        let store = MemoryStore::new();
        store.put("sess/a", "1", None).await.unwrap();
        store.put("sess/a", "2", None).await.unwrap();
        store.put("sess/b", "1", None).await.unwrap();

        assert_eq!(store.get("sess/a").await.unwrap().unwrap().version, 2);
        assert_eq!(store.get("sess/b").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn put_if_version_is_a_real_cas() {
        let store = MemoryStore::new();

        // 0 expects absence.
        assert!(store.put_if_version("pin/x", "a", 0, None).await.unwrap());
        assert!(!store.put_if_version("pin/x", "b", 0, None).await.unwrap());

        // Matching version wins, stale version loses.
        assert!(store.put_if_version("pin/x", "c", 1, None).await.unwrap());
        assert!(!store.put_if_version("pin/x", "d", 1, None).await.unwrap());
        assert_eq!(store.get("pin/x").await.unwrap().unwrap().value, "c");
    }

    #[tokio::test]
    async fn del_reports_single_winner() {
        let store = MemoryStore::new();
        store.put("signal/m", "v", None).await.unwrap();
        assert!(store.del("signal/m").await.unwrap());
        assert!(!store.del("signal/m").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let store = MemoryStore::new();
        store.put("sess/one", "1", None).await.unwrap();
        store.put("sess/two", "2", None).await.unwrap();
        store.put("sessx/three", "3", None).await.unwrap();

        let mut keys = store.list("sess").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["sess/one", "sess/two"]);
    }
}
