//! Enterprise device registry.
//!
//! A thin TTL'd directory of client devices, available only when the
//! process runs as the Enterprise edition. Community deployments answer
//! 404 for the whole surface so the endpoints stay invisible.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{api_error, AppState};
use crate::config::DEVICE_TTL_SECS;
use crate::keys::device_key;
use crate::plog;
use crate::store::{now_ms, Record};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub label: Option<String>,
    pub registered_at: u64,
    pub expires_at: u64,
}

impl Record for DeviceRecord {
    fn expires_at_ms(&self) -> u64 {
        self.expires_at
    }
}

fn gate(state: &AppState) -> Option<Response> {
    if state.service.edition.is_enterprise() {
        None
    } else {
        Some(api_error(StatusCode::NOT_FOUND, "not_found"))
    }
}

pub async fn register_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    if let Some(denied) = gate(&state) {
        return denied;
    }

    let Some(device_id) = body.get("deviceId").and_then(Value::as_str) else {
        return api_error(StatusCode::BAD_REQUEST, "missing_fields");
    };
    if device_id.is_empty() || device_id.len() > 128 {
        return api_error(StatusCode::BAD_REQUEST, "invalid_device_id");
    }
    let label = body
        .get("label")
        .and_then(Value::as_str)
        .map(str::to_string);

    let now = now_ms();
    let record = DeviceRecord {
        device_id: device_id.to_string(),
        label,
        registered_at: now,
        expires_at: now + DEVICE_TTL_SECS * 1000,
    };

    match state
        .service
        .store
        .put_record(&device_key(device_id), &record)
        .await
    {
        Ok(()) => {
            plog!("audit: device registered");
            (
                StatusCode::OK,
                Json(json!({"status": "registered", "ttlSec": DEVICE_TTL_SECS})),
            )
                .into_response()
        }
        Err(e) => {
            plog!("devices: store failure: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    }
}

pub async fn get_handler(State(state): State<AppState>, Path(device_id): Path<String>) -> Response {
    if let Some(denied) = gate(&state) {
        return denied;
    }

    match state
        .service
        .store
        .fetch_live::<DeviceRecord>(&device_key(&device_id))
        .await
    {
        Ok(Some((record, _))) => (
            StatusCode::OK,
            Json(json!({
                "deviceId": record.device_id,
                "label": record.label,
                "registeredAt": record.registered_at,
            })),
        )
            .into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "device_not_found"),
        Err(e) => {
            plog!("devices: store failure: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    }
}

pub async fn delete_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Response {
    if let Some(denied) = gate(&state) {
        return denied;
    }

    match state.service.store.delete(&device_key(&device_id)).await {
        Ok(_) => {
            plog!("audit: device removed");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            plog!("devices: store failure: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    }
}
