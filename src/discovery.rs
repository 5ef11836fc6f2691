//! Peer discovery and signal mailboxes for on-the-fly WebRTC coordination.
//!
//! An invite code maps to at most one registered peer at a time
//! (first-writer wins until the registration's TTL; the holder may
//! refresh). Each peer additionally owns a FIFO mailbox of opaque
//! signaling messages that is drained atomically on poll: a concurrent
//! second poller either wins the delete and gets everything, or loses it
//! and gets nothing, so no message is ever delivered twice.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{CAS_MAX_ATTEMPTS, SIGNAL_TTL_SECS};
use crate::keys::{is_valid_invite_code, is_valid_peer_id, peer_key, signal_key};
use crate::logging::key_tag;
use crate::plog;
use crate::store::{backoff, now_ms, Fetched, Record, Store, StoreError};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRegistration {
    pub peer_id: String,
    pub expires_at: u64,
}

impl Record for PeerRegistration {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub from: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Value,
    pub timestamp: u64,
    pub expires_at: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMailbox {
    pub messages: Vec<SignalMessage>,
    pub expires_at: u64,
    #[serde(default)]
    pub version: u64,
}

impl Record for SignalMailbox {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

#[derive(Debug)]
pub enum DiscoveryError {
    InvalidInviteCode,
    InvalidPeerId,
    /// Another peer holds this invite code and its registration is alive.
    InviteCodeInUse,
    PeerNotFound,
    Store(StoreError),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::InvalidInviteCode => write!(f, "invalid invite code"),
            DiscoveryError::InvalidPeerId => write!(f, "invalid peer id"),
            DiscoveryError::InviteCodeInUse => write!(f, "invite code in use"),
            DiscoveryError::PeerNotFound => write!(f, "peer not found"),
            DiscoveryError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<StoreError> for DiscoveryError {
    fn from(e: StoreError) -> Self {
        DiscoveryError::Store(e)
    }
}

#[derive(Clone)]
pub struct DiscoveryEngine {
    store: Store,
}

impl DiscoveryEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Claim or refresh an invite code. Returns the registration TTL in
    /// seconds.
    pub async fn register(&self, invite_code: &str, peer_id: &str) -> Result<u64, DiscoveryError> {
        if !is_valid_invite_code(invite_code) {
            return Err(DiscoveryError::InvalidInviteCode);
        }
        if !is_valid_peer_id(peer_id) {
            return Err(DiscoveryError::InvalidPeerId);
        }

        let key = peer_key(invite_code);
        for _ in 0..3 {
            let version = match self.store.fetch::<PeerRegistration>(&key).await? {
                Fetched::Live { record, .. } if record.peer_id != peer_id => {
                    return Err(DiscoveryError::InviteCodeInUse);
                }
                Fetched::Live { version, .. } => version,
                Fetched::Missing | Fetched::Stale => 0,
            };
            let registration = PeerRegistration {
                peer_id: peer_id.to_string(),
                expires_at: now_ms() + SIGNAL_TTL_SECS * 1000,
            };
            if self
                .store
                .put_record_if_version(&key, &registration, version)
                .await?
            {
                plog!("discovery: registered {}", key_tag(&key));
                return Ok(SIGNAL_TTL_SECS);
            }
        }
        // Competing registrations kept invalidating our write; whoever is
        // in there now holds the code.
        Err(DiscoveryError::InviteCodeInUse)
    }

    /// Resolve an invite code to its registered peer. Never consumes the
    /// mapping; it stays until TTL.
    pub async fn lookup(&self, invite_code: &str) -> Result<String, DiscoveryError> {
        self.store
            .fetch_live::<PeerRegistration>(&peer_key(invite_code))
            .await?
            .map(|(registration, _)| registration.peer_id)
            .ok_or(DiscoveryError::PeerNotFound)
    }

    /// Queue one signaling message for `to`.
    pub async fn signal(
        &self,
        from: &str,
        to: &str,
        kind: SignalKind,
        payload: Value,
    ) -> Result<(), DiscoveryError> {
        if !is_valid_peer_id(from) || !is_valid_peer_id(to) {
            return Err(DiscoveryError::InvalidPeerId);
        }

        let key = signal_key(to);
        let now = now_ms();
        let message = SignalMessage {
            from: from.to_string(),
            kind,
            payload,
            timestamp: now,
            expires_at: now + SIGNAL_TTL_SECS * 1000,
        };

        for attempt in 0..CAS_MAX_ATTEMPTS {
            let now = now_ms();
            let (mut mailbox, version) = self
                .store
                .fetch_live::<SignalMailbox>(&key)
                .await?
                .unwrap_or_default();

            mailbox.messages.retain(|m| m.expires_at > now);
            mailbox.messages.push(message.clone());
            mailbox.expires_at = now + SIGNAL_TTL_SECS * 1000;
            mailbox.version += 1;
            let written_version = mailbox.version;

            if self
                .store
                .put_record_if_version(&key, &mailbox, version)
                .await?
            {
                // Same read-back discipline as the chunk push: make sure a
                // concurrent appender did not overwrite us on a
                // last-writer-wins backend.
                if let Some((check, _)) = self.store.fetch_live::<SignalMailbox>(&key).await? {
                    if check.version >= written_version && check.messages.contains(&message) {
                        plog!("discovery: queued signal for {}", key_tag(&key));
                        return Ok(());
                    }
                }
            }

            if attempt + 1 < CAS_MAX_ATTEMPTS {
                backoff(attempt).await;
            }
        }

        Err(DiscoveryError::Store(StoreError::Backend(
            "signal mailbox contention".to_string(),
        )))
    }

    /// Drain the mailbox: all-or-empty. Losing the delete race yields an
    /// empty list rather than a duplicate delivery.
    pub async fn poll(&self, peer_id: &str) -> Result<Vec<SignalMessage>, DiscoveryError> {
        let key = signal_key(peer_id);
        let mailbox = match self.store.fetch::<SignalMailbox>(&key).await? {
            Fetched::Live { record, .. } => record,
            Fetched::Missing | Fetched::Stale => return Ok(Vec::new()),
        };

        if !self.store.delete(&key).await? {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let messages: Vec<SignalMessage> = mailbox
            .messages
            .into_iter()
            .filter(|m| m.expires_at > now)
            .collect();
        if !messages.is_empty() {
            plog!(
                "discovery: drained {} signal(s) from {}",
                messages.len(),
                key_tag(&key)
            );
        }
        Ok(messages)
    }
}
