//! Chunk-relay session engine.
//!
//! A relay session is a mailbox keyed by the hash of an invite code and a
//! client-supplied password hash (the password hash separates the two
//! directions of a bidirectional transfer). Senders push ciphertext chunks
//! by index, the receiver polls them out in ascending order, and an
//! explicit acknowledgment survives the session so the sender can confirm
//! delivery after the receiver has torn everything down.
//!
//! Pushes go through an optimistic retry loop: read, apply, conditional
//! write, then read back and verify the chunk landed. The read-back is what
//! closes the race on backends whose conditional write is a plain
//! overwrite; when several senders race on distinct indices, losers observe
//! the winner's merge on the next read and re-apply their own index onto it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::{
    chunk_session_ttl_ms, ACK_TTL_SECS, CAS_MAX_ATTEMPTS, MAX_CHUNK_BYTES, MAX_TOTAL_CHUNKS,
};
use crate::keys::{ack_key, is_valid_invite_code, is_valid_password_hash, session_key};
use crate::logging::key_tag;
use crate::plog;
use crate::store::{backoff, now_ms, Fetched, Record, Store, StoreError};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySession {
    /// Fixed by the first successful push; null only for a placeholder
    /// created by a receiver polling before any sender arrived.
    pub total_chunks: Option<u32>,
    /// Pending chunks, index to ciphertext. Disjoint from `delivered`.
    pub chunks: BTreeMap<u32, String>,
    /// Indices already handed to the receiver.
    pub delivered: BTreeSet<u32>,
    pub completed: bool,
    pub acknowledged: bool,
    #[serde(default)]
    pub waiting_for_sender: bool,
    pub created_at: u64,
    pub last_touched: u64,
    pub expires_at: u64,
    pub version: u64,
}

impl Record for RelaySession {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

impl RelaySession {
    fn fresh(total_chunks: Option<u32>, now: u64) -> Self {
        Self {
            total_chunks,
            chunks: BTreeMap::new(),
            delivered: BTreeSet::new(),
            completed: false,
            acknowledged: false,
            waiting_for_sender: total_chunks.is_none(),
            created_at: now,
            last_touched: now,
            expires_at: now + chunk_session_ttl_ms(total_chunks),
            version: 0,
        }
    }

    fn touch(&mut self, now: u64) {
        self.last_touched = now;
        self.expires_at = now + chunk_session_ttl_ms(self.total_chunks);
    }
}

/// Acknowledgment, stored at its own key so it outlives the session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRecord {
    pub acknowledged: bool,
    pub expires_at: u64,
}

impl Record for AckRecord {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

#[derive(Debug)]
pub enum PushError {
    /// Malformed invite code, password hash, index, count, or oversized data.
    InvalidChunk,
    /// The session was created with a different `totalChunks`.
    TotalChunksMismatch,
    /// The index is already pending or already delivered.
    DuplicateChunk,
    /// The optimistic loop exhausted its retry budget.
    ConcurrencyConflict,
    Store(StoreError),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::InvalidChunk => write!(f, "invalid chunk"),
            PushError::TotalChunksMismatch => write!(f, "totalChunks mismatch"),
            PushError::DuplicateChunk => write!(f, "duplicate chunk"),
            PushError::ConcurrencyConflict => write!(f, "concurrency conflict"),
            PushError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PushError {}

impl From<StoreError> for PushError {
    fn from(e: StoreError) -> Self {
        PushError::Store(e)
    }
}

/// What a receiver poll observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOutcome {
    /// No session, or the session outlived its TTL (the stale record was
    /// removed).
    Expired,
    /// Session alive but the next expected chunk has not arrived.
    Waiting,
    /// Every chunk has been delivered.
    Done,
    /// The next chunk in ascending order.
    Chunk {
        chunk_index: u32,
        total_chunks: u32,
        data: String,
    },
}

#[derive(Clone)]
pub struct RelayEngine {
    store: Store,
    placeholder_sessions: bool,
}

impl RelayEngine {
    pub fn new(store: Store, placeholder_sessions: bool) -> Self {
        Self {
            store,
            placeholder_sessions,
        }
    }

    /// Store one ciphertext chunk.
    pub async fn push(
        &self,
        invite_code: &str,
        password_hash: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: &str,
    ) -> Result<(), PushError> {
        if !is_valid_invite_code(invite_code)
            || !is_valid_password_hash(password_hash)
            || total_chunks == 0
            || total_chunks > MAX_TOTAL_CHUNKS
            || chunk_index >= total_chunks
            || data.len() > MAX_CHUNK_BYTES
        {
            return Err(PushError::InvalidChunk);
        }

        let key = session_key(invite_code, password_hash);

        for attempt in 0..CAS_MAX_ATTEMPTS {
            let now = now_ms();
            let (mut session, read_version) = match self.store.fetch_live(&key).await? {
                Some((session, version)) => (session, version),
                None => (RelaySession::fresh(Some(total_chunks), now), 0),
            };

            match session.total_chunks {
                Some(existing) if existing != total_chunks => {
                    return Err(PushError::TotalChunksMismatch);
                }
                Some(_) => {}
                None => {
                    // First push into a receiver-created placeholder.
                    session.total_chunks = Some(total_chunks);
                    session.waiting_for_sender = false;
                }
            }

            if session.delivered.contains(&chunk_index) || session.chunks.contains_key(&chunk_index)
            {
                return Err(PushError::DuplicateChunk);
            }

            session.chunks.insert(chunk_index, data.to_string());
            session.version += 1;
            session.touch(now);
            let written_version = session.version;

            if self
                .store
                .put_record_if_version(&key, &session, read_version)
                .await?
            {
                // Read-back verification: the write must still be visible.
                // On a last-writer-wins backend a concurrent overwrite can
                // swallow it, in which case we merge again.
                if let Some((check, _)) = self.store.fetch_live::<RelaySession>(&key).await? {
                    if check.version >= written_version
                        && check.chunks.get(&chunk_index).map(String::as_str) == Some(data)
                    {
                        plog!(
                            "relay: push {} idx {}/{}",
                            key_tag(&key),
                            chunk_index,
                            total_chunks
                        );
                        return Ok(());
                    }
                }
            }

            if attempt + 1 < CAS_MAX_ATTEMPTS {
                backoff(attempt).await;
            }
        }

        plog!("relay: push {} gave up after {} attempts", key_tag(&key), CAS_MAX_ATTEMPTS);
        Err(PushError::ConcurrencyConflict)
    }

    /// Receiver poll: hand out the next chunk in ascending index order, or
    /// report the session state.
    pub async fn next(
        &self,
        invite_code: &str,
        password_hash: &str,
    ) -> Result<NextOutcome, StoreError> {
        let key = session_key(invite_code, password_hash);

        let (mut session, version) = match self.store.fetch::<RelaySession>(&key).await? {
            Fetched::Live { record, version } => (record, version),
            Fetched::Missing if self.placeholder_sessions => {
                let placeholder = RelaySession::fresh(None, now_ms());
                // Best-effort create; a racing sender's session wins.
                let _ = self.store.put_record_if_version(&key, &placeholder, 0).await?;
                plog!("relay: placeholder {} awaiting sender", key_tag(&key));
                return Ok(NextOutcome::Waiting);
            }
            Fetched::Missing | Fetched::Stale => return Ok(NextOutcome::Expired),
        };

        let Some(total_chunks) = session.total_chunks else {
            // Placeholder still waiting for its first push.
            return Ok(NextOutcome::Waiting);
        };

        if session.delivered.len() as u32 == total_chunks {
            if !session.completed {
                // The completing transition: mark and drop the (already
                // delivered) pending map.
                session.completed = true;
                session.chunks.clear();
                session.version += 1;
                session.touch(now_ms());
                let _ = self.store.put_record_if_version(&key, &session, version).await?;
                plog!("relay: session {} complete ({} chunks)", key_tag(&key), total_chunks);
                return Ok(NextOutcome::Done);
            }

            // Completed earlier: once the receiver's ack is visible the
            // session has no further purpose. The ack record itself stays
            // until its own TTL so the sender can still query it.
            let acked = session.acknowledged
                || self
                    .store
                    .fetch_live::<AckRecord>(&ack_key(invite_code, password_hash))
                    .await?
                    .is_some_and(|(ack, _)| ack.acknowledged);
            if acked {
                self.store.delete(&key).await?;
                plog!("relay: session {} destroyed after ack", key_tag(&key));
            }
            return Ok(NextOutcome::Done);
        }

        // Strictly ascending delivery: the only deliverable index is the
        // one right after everything already delivered.
        let expected = session.delivered.len() as u32;
        let Some(data) = session.chunks.remove(&expected) else {
            return Ok(NextOutcome::Waiting);
        };

        session.delivered.insert(expected);
        session.version += 1;
        session.touch(now_ms());
        if !self
            .store
            .put_record_if_version(&key, &session, version)
            .await?
        {
            // Lost a race with a concurrent push; the chunk stays pending
            // and the receiver picks it up on the next poll.
            return Ok(NextOutcome::Waiting);
        }

        plog!(
            "relay: deliver {} idx {}/{}",
            key_tag(&key),
            expected,
            total_chunks
        );
        Ok(NextOutcome::Chunk {
            chunk_index: expected,
            total_chunks,
            data,
        })
    }

    /// Record the receiver's acknowledgment. Written to its own key so it
    /// survives session teardown; the in-session flag is flipped too when
    /// the session still exists.
    pub async fn set_ack(&self, invite_code: &str, password_hash: &str) -> Result<(), StoreError> {
        let ack = AckRecord {
            acknowledged: true,
            expires_at: now_ms() + ACK_TTL_SECS * 1000,
        };
        let key = ack_key(invite_code, password_hash);
        self.store.put_record(&key, &ack).await?;
        plog!("relay: ack {}", key_tag(&key));

        let session_key = session_key(invite_code, password_hash);
        for _ in 0..3 {
            let Some((mut session, version)) = self
                .store
                .fetch_live::<RelaySession>(&session_key)
                .await?
            else {
                break;
            };
            if session.acknowledged {
                break;
            }
            session.acknowledged = true;
            session.version += 1;
            session.touch(now_ms());
            if self
                .store
                .put_record_if_version(&session_key, &session, version)
                .await?
            {
                break;
            }
        }
        Ok(())
    }

    /// Has any acknowledgment completed since the ack record last expired?
    /// The standalone record is authoritative; the session flag is the
    /// fallback while the session is still alive.
    pub async fn get_ack(&self, invite_code: &str, password_hash: &str) -> Result<bool, StoreError> {
        if let Some((ack, _)) = self
            .store
            .fetch_live::<AckRecord>(&ack_key(invite_code, password_hash))
            .await?
        {
            return Ok(ack.acknowledged);
        }
        Ok(self
            .store
            .fetch_live::<RelaySession>(&session_key(invite_code, password_hash))
            .await?
            .is_some_and(|(session, _)| session.acknowledged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    const CODE: &str = "Ab3Xy9Zk";
    const HASH: &str = "h1";

    fn engine() -> RelayEngine {
        RelayEngine::new(Store::new(Arc::new(MemoryStore::new())), false)
    }

    fn placeholder_engine() -> RelayEngine {
        RelayEngine::new(Store::new(Arc::new(MemoryStore::new())), true)
    }

    #[tokio::test]
    async fn two_chunk_transfer_in_order() {
        let relay = engine();
        relay.push(CODE, HASH, 0, 2, "C0").await.unwrap();
        relay.push(CODE, HASH, 1, 2, "C1").await.unwrap();

        assert_eq!(
            relay.next(CODE, HASH).await.unwrap(),
            NextOutcome::Chunk {
                chunk_index: 0,
                total_chunks: 2,
                data: "C0".into()
            }
        );
        assert_eq!(
            relay.next(CODE, HASH).await.unwrap(),
            NextOutcome::Chunk {
                chunk_index: 1,
                total_chunks: 2,
                data: "C1".into()
            }
        );
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Done);
    }

    #[tokio::test]
    async fn out_of_order_push_still_delivers_ascending() {
        let relay = engine();
        relay.push(CODE, HASH, 1, 2, "C1").await.unwrap();

        // Index 0 has not arrived; index 1 must not jump the queue.
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Waiting);

        relay.push(CODE, HASH, 0, 2, "C0").await.unwrap();
        match relay.next(CODE, HASH).await.unwrap() {
            NextOutcome::Chunk { chunk_index, data, .. } => {
                assert_eq!(chunk_index, 0);
                assert_eq!(data, "C0");
            }
            other => panic!("expected chunk 0, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_index_rejected() {
        let relay = engine();
        relay.push(CODE, HASH, 0, 2, "A").await.unwrap();
        assert!(matches!(
            relay.push(CODE, HASH, 0, 2, "B").await,
            Err(PushError::DuplicateChunk)
        ));

        // Delivered indices stay claimed.
        let _ = relay.next(CODE, HASH).await.unwrap();
        assert!(matches!(
            relay.push(CODE, HASH, 0, 2, "C").await,
            Err(PushError::DuplicateChunk)
        ));
    }

    #[tokio::test]
    async fn total_chunks_is_fixed_by_first_push() {
        let relay = engine();
        relay.push(CODE, HASH, 0, 2, "A").await.unwrap();
        assert!(matches!(
            relay.push(CODE, HASH, 1, 3, "B").await,
            Err(PushError::TotalChunksMismatch)
        ));
    }

    #[tokio::test]
    async fn validation_rejects_malformed_pushes() {
        let relay = engine();
        for (code, hash, idx, total, data) in [
            ("short", HASH, 0, 2, "A"),            // bad invite code
            (CODE, "no spaces!", 0, 2, "A"),       // bad password hash
            (CODE, HASH, 2, 2, "A"),               // index out of range
            (CODE, HASH, 0, 0, "A"),               // zero chunks
            (CODE, HASH, 0, MAX_TOTAL_CHUNKS + 1, "A"), // too many chunks
        ] {
            assert!(
                matches!(
                    relay.push(code, hash, idx, total, data).await,
                    Err(PushError::InvalidChunk)
                ),
                "expected invalid_chunk for {code}/{hash}/{idx}/{total}"
            );
        }

        let oversized = "x".repeat(MAX_CHUNK_BYTES + 1);
        assert!(matches!(
            relay.push(CODE, HASH, 0, 2, &oversized).await,
            Err(PushError::InvalidChunk)
        ));
    }

    #[tokio::test]
    async fn poll_before_push_is_expired_without_placeholders() {
        let relay = engine();
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Expired);
    }

    #[tokio::test]
    async fn placeholder_profile_waits_then_accepts_sender() {
        let relay = placeholder_engine();
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Waiting);

        relay.push(CODE, HASH, 0, 1, "only").await.unwrap();
        match relay.next(CODE, HASH).await.unwrap() {
            NextOutcome::Chunk { total_chunks, .. } => assert_eq!(total_chunks, 1),
            other => panic!("expected chunk, got {other:?}"),
        }
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Done);
    }

    #[tokio::test]
    async fn concurrent_distinct_pushers_converge() {
        let relay = engine();
        let total = 16u32;

        let mut handles = Vec::new();
        for idx in 0..total {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                relay
                    .push(CODE, HASH, idx, total, &format!("chunk-{idx}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Every index appears exactly once, in ascending order.
        for idx in 0..total {
            match relay.next(CODE, HASH).await.unwrap() {
                NextOutcome::Chunk {
                    chunk_index, data, ..
                } => {
                    assert_eq!(chunk_index, idx);
                    assert_eq!(data, format!("chunk-{idx}"));
                }
                other => panic!("expected chunk {idx}, got {other:?}"),
            }
        }
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Done);
    }

    #[tokio::test]
    async fn concurrent_same_index_single_winner() {
        let relay = engine();

        let mut handles = Vec::new();
        for attempt in 0..8 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                relay
                    .push(CODE, HASH, 0, 2, &format!("payload-{attempt}"))
                    .await
            }));
        }

        let mut accepted = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => accepted += 1,
                Err(PushError::DuplicateChunk) => duplicates += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(duplicates, 7);
    }

    #[tokio::test]
    async fn ack_survives_session_teardown() {
        let relay = engine();
        relay.push(CODE, HASH, 0, 1, "data").await.unwrap();
        assert!(matches!(
            relay.next(CODE, HASH).await.unwrap(),
            NextOutcome::Chunk { .. }
        ));
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Done);

        assert!(!relay.get_ack(CODE, HASH).await.unwrap());
        relay.set_ack(CODE, HASH).await.unwrap();
        assert!(relay.get_ack(CODE, HASH).await.unwrap());

        // The ack-aware poll destroys the session...
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Done);
        assert_eq!(relay.next(CODE, HASH).await.unwrap(), NextOutcome::Expired);

        // ...but the standalone ack record still answers.
        assert!(relay.get_ack(CODE, HASH).await.unwrap());
    }

    #[tokio::test]
    async fn directions_are_independent() {
        let relay = engine();
        relay.push(CODE, "hash-a", 0, 1, "from-a").await.unwrap();
        relay.push(CODE, "hash-b", 0, 1, "from-b").await.unwrap();

        match relay.next(CODE, "hash-a").await.unwrap() {
            NextOutcome::Chunk { data, .. } => assert_eq!(data, "from-a"),
            other => panic!("expected chunk, got {other:?}"),
        }
        match relay.next(CODE, "hash-b").await.unwrap() {
            NextOutcome::Chunk { data, .. } => assert_eq!(data, "from-b"),
            other => panic!("expected chunk, got {other:?}"),
        }

        relay.set_ack(CODE, "hash-a").await.unwrap();
        assert!(relay.get_ack(CODE, "hash-a").await.unwrap());
        assert!(!relay.get_ack(CODE, "hash-b").await.unwrap());
    }

    #[tokio::test]
    async fn pending_and_delivered_stay_disjoint() {
        let relay = engine();
        let total = 4u32;
        for idx in 0..total {
            relay
                .push(CODE, HASH, idx, total, &format!("c{idx}"))
                .await
                .unwrap();
        }
        let store = relay.store.clone();
        let key = session_key(CODE, HASH);

        for _ in 0..total {
            let _ = relay.next(CODE, HASH).await.unwrap();
            if let Some((session, _)) = store.fetch_live::<RelaySession>(&key).await.unwrap() {
                assert!(session
                    .delivered
                    .iter()
                    .all(|idx| !session.chunks.contains_key(idx)));
                assert!(session.delivered.len() as u32 <= total);
            }
        }
    }
}
