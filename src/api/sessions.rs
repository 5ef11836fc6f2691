//! Envelope handshake REST handlers.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{api_error, AppState};
use crate::handshake::{Envelope, HandshakeError};
use crate::plog;

/// Epoch-millisecond storage timestamps become RFC 3339 on the wire.
fn iso(ms: u64) -> String {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

/// Map an engine error to `(status, {"error": code})`. `GET offer` passes
/// 404 for the missing-offer case; the POST paths treat it as the 409
/// ordering violation it is there.
fn handshake_error(e: HandshakeError, offer_not_set: StatusCode) -> Response {
    match e {
        HandshakeError::PinNotFound => api_error(StatusCode::NOT_FOUND, "pin_not_found"),
        HandshakeError::PinExpired => api_error(StatusCode::GONE, "pin_expired"),
        HandshakeError::SessionNotFound => api_error(StatusCode::NOT_FOUND, "session_not_found"),
        HandshakeError::SessionExpired => api_error(StatusCode::GONE, "session_expired"),
        HandshakeError::InvalidEnvelope => api_error(StatusCode::BAD_REQUEST, "invalid_envelope"),
        HandshakeError::OfferAlreadySet => api_error(StatusCode::CONFLICT, "offer_already_set"),
        HandshakeError::OfferNotSet => api_error(offer_not_set, "offer_not_set"),
        HandshakeError::AnswerAlreadySet => api_error(StatusCode::CONFLICT, "answer_already_set"),
        HandshakeError::AnswerNotSet => api_error(StatusCode::NOT_FOUND, "answer_not_set"),
        HandshakeError::PinSpaceExhausted => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
        HandshakeError::Store(e) => {
            plog!("sessions: store failure: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    }
}

/// Pull `{"envelope": {...}}` out of an already-parsed body; any shape
/// problem is the same `invalid_envelope` the engine reports.
fn envelope_from(body: &Value) -> Option<Envelope> {
    serde_json::from_value(body.get("envelope")?.clone()).ok()
}

pub async fn create_handler(State(state): State<AppState>) -> Response {
    match state.service.handshake.create().await {
        Ok(created) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": created.session_id,
                "pin": created.pin,
                "saltB64": created.salt_b64,
                "ttlSec": created.ttl_sec,
                "createdAt": iso(created.created_at_ms),
                "expiresAt": iso(created.expires_at_ms),
            })),
        )
            .into_response(),
        Err(e) => handshake_error(e, StatusCode::CONFLICT),
    }
}

#[derive(Deserialize)]
pub struct ResolveParams {
    pin: Option<String>,
}

pub async fn resolve_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ResolveParams>,
) -> Response {
    if state
        .resolve_limiter
        .check_key(&addr.ip().to_string())
        .is_err()
    {
        return api_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    let Some(pin) = params.pin else {
        return api_error(StatusCode::BAD_REQUEST, "missing_pin");
    };

    match state.service.handshake.resolve_pin(&pin).await {
        Ok(resolved) => (
            StatusCode::OK,
            Json(json!({
                "sessionId": resolved.session_id,
                "saltB64": resolved.salt_b64,
                "ttlSec": resolved.ttl_sec,
            })),
        )
            .into_response(),
        Err(e) => handshake_error(e, StatusCode::CONFLICT),
    }
}

pub async fn post_offer_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some(envelope) = envelope_from(&body) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_envelope");
    };
    match state.service.handshake.put_offer(&session_id, &envelope).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(e) => handshake_error(e, StatusCode::CONFLICT),
    }
}

pub async fn get_offer_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.service.handshake.get_offer(&session_id).await {
        Ok(envelope) => (StatusCode::OK, Json(json!({ "envelope": envelope }))).into_response(),
        Err(e) => handshake_error(e, StatusCode::NOT_FOUND),
    }
}

pub async fn post_answer_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some(envelope) = envelope_from(&body) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid_envelope");
    };
    match state
        .service
        .handshake
        .put_answer(&session_id, &envelope)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(e) => handshake_error(e, StatusCode::CONFLICT),
    }
}

/// One-shot: the first successful read force-expires the session.
pub async fn get_answer_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.service.handshake.take_answer(&session_id).await {
        Ok(envelope) => (StatusCode::OK, Json(json!({ "envelope": envelope }))).into_response(),
        Err(e) => handshake_error(e, StatusCode::NOT_FOUND),
    }
}

pub async fn delete_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.service.handshake.delete(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => handshake_error(e, StatusCode::CONFLICT),
    }
}
