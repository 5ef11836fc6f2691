//! Periodic expiry sweeper.
//!
//! Expiry-on-read only reclaims records somebody still asks for; the
//! sweeper walks every namespace on a fixed cadence and deletes what the
//! readers never came back for. It is an ordinary store client with no
//! special privileges.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::keys::ALL_PREFIXES;
use crate::plog;
use crate::store::Store;

/// One full pass over all namespaces. Returns how many records were
/// removed.
pub async fn sweep_once(store: &Store) -> u64 {
    let mut removed = 0;
    for prefix in ALL_PREFIXES {
        match store.purge_expired(prefix).await {
            Ok(count) => removed += count,
            Err(e) => plog!("sweep: {prefix} pass failed: {e}"),
        }
    }
    removed
}

/// Run [`sweep_once`] every `interval_secs` until the shutdown signal
/// fires.
pub fn spawn_sweeper(
    store: Store,
    interval_secs: u64,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = sweep_once(&store).await;
                    if removed > 0 {
                        plog!("sweep: removed {removed} expired record(s)");
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::AckRecord;
    use crate::store::{now_ms, MemoryStore, Record};
    use std::sync::Arc;

    #[tokio::test]
    async fn sweep_reclaims_only_expired_records() {
        let store = Store::new(Arc::new(MemoryStore::new()));

        let live = AckRecord {
            acknowledged: true,
            expires_at: now_ms() + 60_000,
        };
        let dead = AckRecord {
            acknowledged: true,
            expires_at: now_ms().saturating_sub(10),
        };
        store.put_record("ack/live", &live).await.unwrap();
        store.put_record("ack/dead", &dead).await.unwrap();
        store.put_record("sess/dead", &dead).await.unwrap();

        assert_eq!(sweep_once(&store).await, 2);
        assert!(store
            .fetch_live::<AckRecord>("ack/live")
            .await
            .unwrap()
            .is_some());

        // Nothing left to do on a second pass.
        assert_eq!(sweep_once(&store).await, 0);
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_shutdown() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = spawn_sweeper(store, 1, shutdown_rx);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .expect("sweeper should not panic");
    }

    #[tokio::test]
    async fn sweep_discards_unreadable_values() {
        let kv = Arc::new(MemoryStore::new());
        {
            use crate::store::KeyValue;
            kv.put("sess/garbage", "not json", None).await.unwrap();
        }
        let store = Store::new(kv);
        assert_eq!(sweep_once(&store).await, 1);
    }

    // Record impl smoke check: the sweeper reads expiresAt generically.
    #[test]
    fn ack_record_exposes_expiry() {
        let ack = AckRecord {
            acknowledged: true,
            expires_at: 42,
        };
        assert_eq!(ack.expires_at_ms(), 42);
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json.get("expiresAt").and_then(|v| v.as_u64()), Some(42));
    }
}
