//! Action-dispatched service surface.
//!
//! The legacy relay API is a single POST endpoint whose body carries an
//! `action` tag. Every handler here is a pure function from the parsed
//! body to `(status, json)`; the HTTP layer owns nothing but transport.
//!
//! Contract quirk kept on purpose: state conflicts on `send`
//! (`duplicate_chunk`, `totalChunks_mismatch`, `concurrency_conflict`)
//! answer 200 with an `error` field *and* `status: "waiting"`, because the
//! original clients treat the action channel as always-200 and retry at
//! the application level. Validation failures are real 400s.

use std::time::Instant;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::Config;
use crate::discovery::{DiscoveryEngine, DiscoveryError, SignalKind};
use crate::edition::Edition;
use crate::handshake::HandshakeEngine;
use crate::plog;
use crate::relay::{NextOutcome, PushError, RelayEngine};
use crate::store::Store;

/// Everything the HTTP layer needs, built once at startup.
pub struct ServiceState {
    pub store: Store,
    pub relay: RelayEngine,
    pub handshake: HandshakeEngine,
    pub discovery: DiscoveryEngine,
    pub edition: Edition,
    pub placeholder_sessions: bool,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

impl ServiceState {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            relay: RelayEngine::new(store.clone(), config.placeholder_sessions),
            handshake: HandshakeEngine::new(store.clone()),
            discovery: DiscoveryEngine::new(store.clone()),
            store,
            edition: config.edition,
            placeholder_sessions: config.placeholder_sessions,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        }
    }
}

/// Dispatch one action body. Unknown actions are a 404, a missing tag is a
/// 400; everything else is routed to its handler.
pub async fn dispatch(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let Some(action) = body.get("action").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, json!({"error": "missing_action"}));
    };

    let (status, response) = match action {
        "send" => send(state, body).await,
        "receive" => receive(state, body).await,
        "ack" => ack(state, body).await,
        "ack-status" => ack_status(state, body).await,
        "register" => register(state, body).await,
        "lookup" => lookup(state, body).await,
        "signal" => signal(state, body).await,
        "poll" => poll(state, body).await,
        _ => (StatusCode::NOT_FOUND, json!({"error": "unknown_action"})),
    };

    if state.edition.is_enterprise() {
        plog!("audit: action={} status={}", action, status.as_u16());
    }

    (status, response)
}

fn str_field<'a>(body: &'a Value, name: &str) -> Option<&'a str> {
    body.get(name).and_then(Value::as_str)
}

/// Absent yields None; present but not a u32 yields Some(Err(())), so the chunk
/// handlers fold into `invalid_chunk` rather than `missing_fields`.
fn chunk_count_field(body: &Value, name: &str) -> Option<Result<u32, ()>> {
    let value = body.get(name)?;
    Some(value.as_u64().and_then(|n| u32::try_from(n).ok()).ok_or(()))
}

fn missing_fields() -> (StatusCode, Value) {
    (StatusCode::BAD_REQUEST, json!({"error": "missing_fields"}))
}

fn server_error(context: &str, error: impl std::fmt::Display) -> (StatusCode, Value) {
    plog!("service: {context} failed: {error}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "server_error"}),
    )
}

async fn send(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let (Some(invite_code), Some(password_hash), Some(data)) = (
        str_field(body, "pin"),
        str_field(body, "passwordHash"),
        str_field(body, "data"),
    ) else {
        return missing_fields();
    };
    let (Some(chunk_index), Some(total_chunks)) = (
        chunk_count_field(body, "chunkIndex"),
        chunk_count_field(body, "totalChunks"),
    ) else {
        return missing_fields();
    };
    let (Ok(chunk_index), Ok(total_chunks)) = (chunk_index, total_chunks) else {
        return (StatusCode::BAD_REQUEST, json!({"error": "invalid_chunk"}));
    };

    match state
        .relay
        .push(invite_code, password_hash, chunk_index, total_chunks, data)
        .await
    {
        Ok(()) => (StatusCode::OK, json!({"status": "waiting"})),
        Err(PushError::InvalidChunk) => {
            (StatusCode::BAD_REQUEST, json!({"error": "invalid_chunk"}))
        }
        Err(PushError::TotalChunksMismatch) => (
            StatusCode::OK,
            json!({"error": "totalChunks_mismatch", "status": "waiting"}),
        ),
        Err(PushError::DuplicateChunk) => (
            StatusCode::OK,
            json!({"error": "duplicate_chunk", "status": "waiting"}),
        ),
        Err(PushError::ConcurrencyConflict) => (
            StatusCode::OK,
            json!({"error": "concurrency_conflict", "status": "waiting"}),
        ),
        Err(PushError::Store(e)) => server_error("send", e),
    }
}

async fn receive(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let (Some(invite_code), Some(password_hash)) =
        (str_field(body, "pin"), str_field(body, "passwordHash"))
    else {
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "missing_pin_or_passwordHash"}),
        );
    };

    match state.relay.next(invite_code, password_hash).await {
        Ok(NextOutcome::Expired) => (StatusCode::OK, json!({"status": "expired"})),
        Ok(NextOutcome::Waiting) => (StatusCode::OK, json!({"status": "waiting"})),
        Ok(NextOutcome::Done) => (StatusCode::OK, json!({"status": "done"})),
        Ok(NextOutcome::Chunk {
            chunk_index,
            total_chunks,
            data,
        }) => (
            StatusCode::OK,
            json!({
                "status": "chunkAvailable",
                "chunk": {
                    "chunkIndex": chunk_index,
                    "totalChunks": total_chunks,
                    "data": data,
                }
            }),
        ),
        Err(e) => server_error("receive", e),
    }
}

async fn ack(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let (Some(invite_code), Some(password_hash)) =
        (str_field(body, "pin"), str_field(body, "passwordHash"))
    else {
        return missing_fields();
    };

    match state.relay.set_ack(invite_code, password_hash).await {
        Ok(()) => (StatusCode::OK, json!({"ok": true})),
        Err(e) => server_error("ack", e),
    }
}

async fn ack_status(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let (Some(invite_code), Some(password_hash)) =
        (str_field(body, "pin"), str_field(body, "passwordHash"))
    else {
        return missing_fields();
    };

    match state.relay.get_ack(invite_code, password_hash).await {
        Ok(acknowledged) => (StatusCode::OK, json!({"acknowledged": acknowledged})),
        Err(e) => server_error("ack-status", e),
    }
}

async fn register(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let (Some(invite_code), Some(peer_id)) =
        (str_field(body, "inviteCode"), str_field(body, "peerId"))
    else {
        return missing_fields();
    };

    match state.discovery.register(invite_code, peer_id).await {
        Ok(ttl_sec) => (
            StatusCode::OK,
            json!({"status": "registered", "ttlSec": ttl_sec}),
        ),
        Err(DiscoveryError::InvalidInviteCode) => (
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid_invite_code"}),
        ),
        Err(DiscoveryError::InvalidPeerId) => {
            (StatusCode::BAD_REQUEST, json!({"error": "invalid_peer_id"}))
        }
        Err(DiscoveryError::InviteCodeInUse) => (
            StatusCode::CONFLICT,
            json!({"error": "invite_code_in_use"}),
        ),
        Err(e) => server_error("register", e),
    }
}

async fn lookup(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let Some(invite_code) = str_field(body, "inviteCode") else {
        return (
            StatusCode::BAD_REQUEST,
            json!({"error": "missing_invite_code"}),
        );
    };

    match state.discovery.lookup(invite_code).await {
        Ok(peer_id) => (StatusCode::OK, json!({"peerId": peer_id})),
        Err(DiscoveryError::PeerNotFound) => {
            (StatusCode::NOT_FOUND, json!({"error": "peer_not_found"}))
        }
        Err(e) => server_error("lookup", e),
    }
}

async fn signal(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let (Some(from), Some(to), Some(kind), Some(payload)) = (
        str_field(body, "from"),
        str_field(body, "to"),
        str_field(body, "type"),
        body.get("payload"),
    ) else {
        return missing_fields();
    };
    let Some(kind) = SignalKind::parse(kind) else {
        return (StatusCode::BAD_REQUEST, json!({"error": "invalid_type"}));
    };

    match state.discovery.signal(from, to, kind, payload.clone()).await {
        Ok(()) => (StatusCode::OK, json!({"status": "queued"})),
        Err(DiscoveryError::InvalidPeerId) => {
            (StatusCode::BAD_REQUEST, json!({"error": "invalid_peer_id"}))
        }
        Err(e) => server_error("signal", e),
    }
}

async fn poll(state: &ServiceState, body: &Value) -> (StatusCode, Value) {
    let Some(peer_id) = str_field(body, "peerId") else {
        return (StatusCode::BAD_REQUEST, json!({"error": "missing_peer_id"}));
    };

    match state.discovery.poll(peer_id).await {
        Ok(messages) => {
            let messages: Vec<Value> = messages
                .into_iter()
                .map(|m| {
                    json!({
                        "from": m.from,
                        "type": m.kind,
                        "payload": m.payload,
                        "timestamp": m.timestamp,
                    })
                })
                .collect();
            (StatusCode::OK, json!({"messages": messages}))
        }
        Err(e) => server_error("poll", e),
    }
}
