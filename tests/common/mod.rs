//! Shared harness for the HTTP integration tests: an in-process server on
//! an ephemeral port plus blocking JSON helpers.

// Each integration test binary compiles this module separately and uses a
// different subset of the helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::oneshot;

use passage::api::{router::build_router, AppState};
use passage::config::Config;
use passage::edition::Edition;
use passage::service::ServiceState;
use passage::store::{MemoryStore, Store};

pub fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        redis_url: None,
        edition: Edition::Community,
        allowed_origins: vec!["*".to_string()],
        resolve_rate_per_min: 600,
        placeholder_sessions: false,
        sweep_interval_secs: 5,
    }
}

/// Boot a server on an ephemeral port. Returns its base URL and the
/// graceful-shutdown trigger.
pub async fn start_server(config: Config) -> (String, oneshot::Sender<()>) {
    let store = Store::new(Arc::new(MemoryStore::new()));
    let service = Arc::new(ServiceState::new(store, &config));
    let state = AppState::new(service, &config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{addr}"), shutdown_tx)
}

pub fn post_json(url: &str, body: Value) -> (u16, Value) {
    match ureq::post(url).send_json(body) {
        Ok(resp) => {
            let status = resp.status();
            (status, resp.into_json().unwrap_or(json!(null)))
        }
        Err(ureq::Error::Status(status, resp)) => {
            (status, resp.into_json().unwrap_or(json!(null)))
        }
        Err(e) => panic!("transport error on {url}: {e}"),
    }
}

pub fn get_json(url: &str) -> (u16, Value) {
    match ureq::get(url).call() {
        Ok(resp) => {
            let status = resp.status();
            (status, resp.into_json().unwrap_or(json!(null)))
        }
        Err(ureq::Error::Status(status, resp)) => {
            (status, resp.into_json().unwrap_or(json!(null)))
        }
        Err(e) => panic!("transport error on {url}: {e}"),
    }
}

pub fn delete_status(url: &str) -> u16 {
    match ureq::delete(url).call() {
        Ok(resp) => resp.status(),
        Err(ureq::Error::Status(status, _)) => status,
        Err(e) => panic!("transport error on {url}: {e}"),
    }
}

/// Post one action body to the dispatcher.
pub fn action(base_url: &str, body: Value) -> (u16, Value) {
    post_json(&format!("{base_url}/api/relay"), body)
}
