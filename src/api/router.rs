//! Axum router construction and cross-origin / security headers.

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::{
    self, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL,
};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use crate::api::{devices, relay, sessions, system, AppState};
use crate::config::MAX_BODY_BYTES;

/// Build the complete router: legacy action dispatcher, envelope REST,
/// ancillary endpoints, and the Enterprise device registry.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(system::health_handler))
        .route("/api/v1/edition", get(system::edition_handler))
        // Legacy unified dispatcher
        .route("/api/relay", post(relay::relay_handler))
        // Envelope handshake REST
        .route("/api/v1/sessions", post(sessions::create_handler))
        .route("/api/v1/sessions/resolve", get(sessions::resolve_handler))
        .route(
            "/api/v1/sessions/:session_id/offer",
            post(sessions::post_offer_handler).get(sessions::get_offer_handler),
        )
        .route(
            "/api/v1/sessions/:session_id/answer",
            post(sessions::post_answer_handler).get(sessions::get_answer_handler),
        )
        .route(
            "/api/v1/sessions/:session_id",
            delete(sessions::delete_handler),
        )
        // Device registry (Enterprise)
        .route("/api/v1/devices", post(devices::register_handler))
        .route(
            "/api/v1/devices/:device_id",
            get(devices::get_handler).delete(devices::delete_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cross_origin_layer,
        ))
        .with_state(state)
}

/// Answers preflight requests and stamps CORS plus cache/sniffing headers
/// on every response.
async fn cross_origin_layer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if let Some(allowed) = allowed_origin(&state, origin.as_deref()) {
        if let Ok(value) = HeaderValue::from_str(&allowed) {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    // Everything served here is single-use or short-lived.
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

fn allowed_origin(state: &AppState, origin: Option<&str>) -> Option<String> {
    if state.allowed_origins.iter().any(|o| o == "*") {
        return Some("*".to_string());
    }
    origin
        .filter(|o| state.allowed_origins.iter().any(|a| a == o))
        .map(str::to_string)
}
