//! Envelope handshake engine.
//!
//! A handshake session is a short-lived dropbox for exactly one WebRTC
//! offer envelope and one answer envelope, keyed by a server-minted UUID
//! and reachable once through a human-sized 6-digit PIN. The server never
//! inspects envelope contents beyond shape validation; the ciphertext is
//! opaque. Answer delivery is one-shot: the first successful read force-
//! expires the whole session.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{
    HANDSHAKE_TTL_SECS, MAX_ENVELOPE_CT_BYTES, MIN_ENVELOPE_CT_BYTES, PIN_MINT_ATTEMPTS,
};
use crate::keys::{handshake_key, pin_key};
use crate::logging::sid_tag;
use crate::plog;
use crate::store::{now_ms, Fetched, Record, Store, StoreError};

/// Nonce length for the client's AEAD, enforced at the wire.
const NONCE_BYTES: usize = 12;
const SALT_BYTES: usize = 16;

/// Versioned wrapper around a ciphertext blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub v: u32,
    pub session_id: String,
    pub nonce_b64: String,
    pub ct_b64: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeSession {
    pub salt_b64: String,
    pub pin: String,
    pub offer_envelope: Option<Envelope>,
    pub answer_envelope: Option<Envelope>,
    pub answer_delivered: bool,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Record for HandshakeSession {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

/// PIN to session id, consumed by the first successful resolve.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinIndex {
    pub session_id: String,
    pub expires_at: u64,
}

impl Record for PinIndex {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    PinNotFound,
    PinExpired,
    SessionNotFound,
    SessionExpired,
    InvalidEnvelope,
    OfferAlreadySet,
    OfferNotSet,
    AnswerAlreadySet,
    AnswerNotSet,
    /// PIN minting failed to find a free 6-digit code.
    PinSpaceExhausted,
    Store(StoreError),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::PinNotFound => write!(f, "pin not found"),
            HandshakeError::PinExpired => write!(f, "pin expired"),
            HandshakeError::SessionNotFound => write!(f, "session not found"),
            HandshakeError::SessionExpired => write!(f, "session expired"),
            HandshakeError::InvalidEnvelope => write!(f, "invalid envelope"),
            HandshakeError::OfferAlreadySet => write!(f, "offer already set"),
            HandshakeError::OfferNotSet => write!(f, "offer not set"),
            HandshakeError::AnswerAlreadySet => write!(f, "answer already set"),
            HandshakeError::AnswerNotSet => write!(f, "answer not set"),
            HandshakeError::PinSpaceExhausted => write!(f, "pin space exhausted"),
            HandshakeError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<StoreError> for HandshakeError {
    fn from(e: StoreError) -> Self {
        HandshakeError::Store(e)
    }
}

/// Everything a freshly created session hands back to the caller.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: String,
    pub pin: String,
    pub salt_b64: String,
    pub ttl_sec: u64,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session_id: String,
    pub salt_b64: String,
    pub ttl_sec: u64,
}

#[derive(Clone)]
pub struct HandshakeEngine {
    store: Store,
}

impl HandshakeEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Mint a session: UUID v4 id, unique 6-digit PIN, fresh key-derivation
    /// salt, 180 s lifetime.
    pub async fn create(&self) -> Result<CreatedSession, HandshakeError> {
        let session_id = Uuid::new_v4().to_string();
        let now = now_ms();
        let expires_at = now + HANDSHAKE_TTL_SECS * 1000;

        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill(&mut salt);
        let salt_b64 = STANDARD.encode(salt);

        let pin = self.mint_pin(&session_id, expires_at).await?;
        let session = HandshakeSession {
            salt_b64: salt_b64.clone(),
            pin: pin.clone(),
            offer_envelope: None,
            answer_envelope: None,
            answer_delivered: false,
            created_at: now,
            expires_at,
        };
        self.store
            .put_record(&handshake_key(&session_id), &session)
            .await?;

        plog!("handshake: created {}", sid_tag(&session_id));
        Ok(CreatedSession {
            session_id,
            pin,
            salt_b64,
            ttl_sec: HANDSHAKE_TTL_SECS,
            created_at_ms: now,
            expires_at_ms: expires_at,
        })
    }

    /// Rejection-sample a PIN that is not currently indexed, claiming it
    /// with an expect-absent write so two concurrent creates cannot share
    /// one.
    async fn mint_pin(&self, session_id: &str, expires_at: u64) -> Result<String, HandshakeError> {
        for _ in 0..PIN_MINT_ATTEMPTS {
            let pin = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
            let key = pin_key(&pin);
            // A stale index entry is cleared by the fetch before claiming.
            if let Fetched::Live { .. } = self.store.fetch::<PinIndex>(&key).await? {
                continue;
            }
            let index = PinIndex {
                session_id: session_id.to_string(),
                expires_at,
            };
            if self.store.put_record_if_version(&key, &index, 0).await? {
                return Ok(pin);
            }
        }
        Err(HandshakeError::PinSpaceExhausted)
    }

    /// Resolve a PIN to its session, consuming the index entry. The caller
    /// that wins the delete is the only one that ever learns the session id.
    pub async fn resolve_pin(&self, pin: &str) -> Result<ResolvedSession, HandshakeError> {
        let key = pin_key(pin);
        let index = match self.store.fetch::<PinIndex>(&key).await? {
            Fetched::Live { record, .. } => record,
            Fetched::Missing | Fetched::Stale => return Err(HandshakeError::PinNotFound),
        };

        if !self.store.delete(&key).await? {
            // Another resolver consumed it between our read and delete.
            return Err(HandshakeError::PinNotFound);
        }

        match self
            .store
            .fetch::<HandshakeSession>(&handshake_key(&index.session_id))
            .await?
        {
            Fetched::Live { record, .. } => {
                plog!("handshake: resolved {}", sid_tag(&index.session_id));
                Ok(ResolvedSession {
                    session_id: index.session_id,
                    salt_b64: record.salt_b64,
                    ttl_sec: record.expires_at.saturating_sub(now_ms()).div_ceil(1000),
                })
            }
            Fetched::Missing | Fetched::Stale => Err(HandshakeError::PinExpired),
        }
    }

    pub async fn put_offer(
        &self,
        session_id: &str,
        envelope: &Envelope,
    ) -> Result<(), HandshakeError> {
        validate_envelope(envelope, session_id)?;
        let key = handshake_key(session_id);

        for _ in 0..3 {
            let (mut session, version) = self.fetch_session(&key).await?;
            if session.offer_envelope.is_some() {
                return Err(HandshakeError::OfferAlreadySet);
            }
            session.offer_envelope = Some(envelope.clone());
            if self
                .store
                .put_record_if_version(&key, &session, version)
                .await?
            {
                plog!("handshake: offer set {}", sid_tag(session_id));
                return Ok(());
            }
        }
        Err(HandshakeError::OfferAlreadySet)
    }

    pub async fn get_offer(&self, session_id: &str) -> Result<Envelope, HandshakeError> {
        let (session, _) = self.fetch_session(&handshake_key(session_id)).await?;
        session.offer_envelope.ok_or(HandshakeError::OfferNotSet)
    }

    pub async fn put_answer(
        &self,
        session_id: &str,
        envelope: &Envelope,
    ) -> Result<(), HandshakeError> {
        validate_envelope(envelope, session_id)?;
        let key = handshake_key(session_id);

        for _ in 0..3 {
            let (mut session, version) = self.fetch_session(&key).await?;
            if session.offer_envelope.is_none() {
                return Err(HandshakeError::OfferNotSet);
            }
            if session.answer_envelope.is_some() {
                return Err(HandshakeError::AnswerAlreadySet);
            }
            session.answer_envelope = Some(envelope.clone());
            if self
                .store
                .put_record_if_version(&key, &session, version)
                .await?
            {
                plog!("handshake: answer set {}", sid_tag(session_id));
                return Ok(());
            }
        }
        Err(HandshakeError::AnswerAlreadySet)
    }

    /// One-shot answer delivery: the first successful read marks the answer
    /// delivered and forces the session's expiry into the past, so every
    /// later request observes `session_expired`.
    pub async fn take_answer(&self, session_id: &str) -> Result<Envelope, HandshakeError> {
        let key = handshake_key(session_id);
        let (mut session, version) = self.fetch_session(&key).await?;
        let Some(envelope) = session.answer_envelope.clone() else {
            return Err(HandshakeError::AnswerNotSet);
        };

        session.answer_delivered = true;
        session.expires_at = now_ms().saturating_sub(1000);
        if !self
            .store
            .put_record_if_version(&key, &session, version)
            .await?
        {
            // A concurrent reader beat us to the single delivery.
            return Err(HandshakeError::SessionExpired);
        }

        plog!("handshake: answer delivered {}", sid_tag(session_id));
        Ok(envelope)
    }

    /// Idempotent teardown of the session and its PIN index entry.
    pub async fn delete(&self, session_id: &str) -> Result<(), HandshakeError> {
        let key = handshake_key(session_id);
        if let Some((session, _)) = self.store.fetch_live::<HandshakeSession>(&key).await? {
            let _ = self.store.delete(&pin_key(&session.pin)).await?;
        }
        let _ = self.store.delete(&key).await?;
        plog!("handshake: deleted {}", sid_tag(session_id));
        Ok(())
    }

    async fn fetch_session(&self, key: &str) -> Result<(HandshakeSession, u64), HandshakeError> {
        match self.store.fetch::<HandshakeSession>(key).await? {
            Fetched::Live { record, version } => Ok((record, version)),
            Fetched::Missing => Err(HandshakeError::SessionNotFound),
            Fetched::Stale => Err(HandshakeError::SessionExpired),
        }
    }
}

/// Wire-shape validation: version 1, matching session id, strict base64,
/// a 12-byte nonce, and 16 B – 64 KiB of ciphertext.
fn validate_envelope(envelope: &Envelope, session_id: &str) -> Result<(), HandshakeError> {
    if envelope.v != 1 || envelope.session_id != session_id {
        return Err(HandshakeError::InvalidEnvelope);
    }
    let nonce = STANDARD
        .decode(&envelope.nonce_b64)
        .map_err(|_| HandshakeError::InvalidEnvelope)?;
    if nonce.len() != NONCE_BYTES {
        return Err(HandshakeError::InvalidEnvelope);
    }
    let ct = STANDARD
        .decode(&envelope.ct_b64)
        .map_err(|_| HandshakeError::InvalidEnvelope)?;
    if ct.len() < MIN_ENVELOPE_CT_BYTES || ct.len() > MAX_ENVELOPE_CT_BYTES {
        return Err(HandshakeError::InvalidEnvelope);
    }
    Ok(())
}
