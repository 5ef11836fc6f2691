//! HTTP layer: router construction, handlers, and shared state.
//!
//! Handlers stay thin. The action dispatcher and engines decide; this
//! module only moves JSON and maps engine errors to status codes.

pub mod devices;
pub mod relay;
pub mod router;
pub mod sessions;
pub mod system;

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use governor::clock::{DefaultClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

use crate::config::Config;
use crate::service::ServiceState;

/// Keyed rate limiter, one bucket per client IP.
pub type IpLimiter = RateLimiter<
    String,
    dashmap::DashMap<String, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<QuantaInstant>,
>;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ServiceState>,
    pub allowed_origins: Arc<Vec<String>>,
    /// Guards PIN resolution; a 6-digit space does not survive brute force
    /// without one.
    pub resolve_limiter: Arc<IpLimiter>,
}

impl AppState {
    pub fn new(service: Arc<ServiceState>, config: &Config) -> Self {
        let rate = NonZeroU32::new(config.resolve_rate_per_min.max(1))
            .expect("resolve rate must be > 0");
        Self {
            service,
            allowed_origins: Arc::new(config.allowed_origins.clone()),
            resolve_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(rate))),
        }
    }
}

/// Standard JSON error body: `{"error": "<stable_code>"}`.
pub fn api_error(status: StatusCode, code: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "error": code })),
    )
        .into_response()
}
