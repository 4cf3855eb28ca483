use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use banter_api::auth::tokens::JwtValidator;
use banter_api::config::Config;
use banter_api::gateway::fanout::NoopRelay;
use banter_api::gateway::server::spawn_sweeper;
use banter_api::store::kv::MemoryStore;
use banter_api::store::messages::MemoryMessageStore;
use banter_api::store::rooms::MemoryRoomDirectory;
use banter_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // In-memory collaborators for a single-process deployment. A scaled-out
    // deployment swaps in Redis-backed stores and a pub/sub relay here.
    let rooms = Arc::new(MemoryRoomDirectory::new());
    for room_id in &config.default_rooms {
        rooms.insert_public_room(room_id);
    }
    tracing::info!(rooms = config.default_rooms.len(), "room directory seeded");

    let auth = Arc::new(JwtValidator::new(&config.auth_secret));

    let state = AppState::new(
        config,
        auth,
        Arc::new(MemoryStore::new()),
        rooms,
        Arc::new(MemoryMessageStore::new()),
        Arc::new(NoopRelay),
    );

    let sweeper = spawn_sweeper(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(banter_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "banter-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    sweeper.abort();
    tracing::info!("banter-api stopped");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
