//! The legacy action dispatcher endpoint.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::api::AppState;
use crate::service;

/// `POST /api/relay`: everything rides on the body's `action` tag.
pub async fn relay_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let (status, body) = service::dispatch(&state.service, &body).await;
    (status, Json(body)).into_response()
}
