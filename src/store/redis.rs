//! Redis backend for multi-instance deployments.
//!
//! Writes are full-record overwrites carrying the record's remaining TTL as
//! a native `PX` expiry, so Redis reaps what expiry-on-read and the sweeper
//! miss. Redis keeps no version counter here; `put_if_version` overwrites
//! and reports success, and the engines close write races at the record
//! level (version field + read-back verification).

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::{KeyValue, StoreError, Versioned};

pub struct RedisStore {
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("redis open: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("redis connect: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Round-trip a PING; used at startup so a bad URL fails fast.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(format!("redis ping: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValue for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(format!("redis get: {e}")))?;
        Ok(value.map(|value| Versioned { value, version: 0 }))
    }

    async fn put(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl_ms) = ttl_ms {
            cmd.arg("PX").arg(ttl_ms.max(1));
        }
        cmd.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(format!("redis set: {e}")))?;
        Ok(())
    }

    async fn put_if_version(
        &self,
        key: &str,
        value: &str,
        _expected: u64,
        ttl_ms: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.put(key, value, ttl_ms).await?;
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().await;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(format!("redis del: {e}")))?;
        Ok(removed > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{prefix}/*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        let mut conn = self.conn.lock().await;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await
                .map_err(|e| StoreError::Backend(format!("redis scan: {e}")))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
