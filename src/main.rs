//! Server entry point: parse configuration, pick a storage backend, start
//! the sweeper, serve.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::oneshot;

use passage::api::{router::build_router, AppState};
use passage::config::{Cli, Config};
use passage::plog;
use passage::service::ServiceState;
use passage::store::{KeyValue, MemoryStore, RedisStore, Store};
use passage::sweep::spawn_sweeper;
use passage::{logging, sweep};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    logging::init();
    plog!("passage starting ({} edition)", config.edition.as_str());

    let kv: Arc<dyn KeyValue> = match &config.redis_url {
        Some(url) => {
            let redis = RedisStore::connect(url)
                .await
                .expect("failed to connect to redis");
            redis.ping().await.expect("redis did not answer PING");
            plog!("  store: redis");
            Arc::new(redis)
        }
        None => {
            plog!("  store: in-process map (single instance)");
            Arc::new(MemoryStore::new())
        }
    };
    let store = Store::new(kv);

    if config.placeholder_sessions {
        plog!("  placeholder sessions: enabled");
    }

    let service = Arc::new(ServiceState::new(store.clone(), &config));
    let state = AppState::new(service, &config);

    // The sweeper runs for the life of the process; the shutdown channel
    // exists so embedded uses (tests) can stop it cleanly.
    let (_sweeper_shutdown, sweeper_rx) = oneshot::channel();
    let _sweeper = spawn_sweeper(store.clone(), config.sweep_interval_secs, sweeper_rx);

    // One eager pass so a restart does not serve a backlog of corpses.
    let removed = sweep::sweep_once(&store).await;
    if removed > 0 {
        plog!("  startup sweep removed {removed} record(s)");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    plog!("passage listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap_or_else(|error| panic!("server error: {error}"));
}
