//! Health check and edition advertisement.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::api::AppState;

pub async fn health_handler(State(state): State<AppState>) -> Response {
    let service = &state.service;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "edition": service.edition.as_str(),
            "uptime": service.started_at.elapsed().as_secs(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })),
    )
        .into_response()
}

/// Static per process: clients read this once to learn which deployment
/// switches are active.
pub async fn edition_handler(State(state): State<AppState>) -> Response {
    let service = &state.service;
    (
        StatusCode::OK,
        Json(json!({
            "edition": service.edition.as_str(),
            "isEnterprise": service.edition.is_enterprise(),
            "features": service.edition.features(service.placeholder_sessions),
            "timestamp": service
                .started_at_utc
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        })),
    )
        .into_response()
}
