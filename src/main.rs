mod cache;
mod cli;
mod config;
mod handlers;
mod identity;
mod registry;
mod session;
mod signaling;
mod websocket;

use axum::{routing::get, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    cache::BoardCache,
    cli::{Cli, Commands},
    config::{CacheBackend, Config},
    handlers::{
        add_message, default_board, delete_message, fetch_board, get_message, health_check,
    },
    registry::{PeerRegistry, RegistryConfig},
    websocket::websocket_handler,
};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Probe { url }) = cli.command {
        if let Err(err) = cli::run_probe(url).await {
            error!("probe failed: {err:#}");
            std::process::exit(1);
        }
        return;
    }

    let config = cli.apply(Config::from_env());
    info!("starting driftboard on port {}", config.port);

    let cache = match build_cache(&config).await {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            error!("failed to connect to redis: {err}");
            std::process::exit(1);
        }
    };
    cache.spawn_sweeper();

    let registry = Arc::new(PeerRegistry::new(RegistryConfig {
        ping_interval: config.ping_interval,
        liveness_timeout: config.liveness_timeout,
    }));

    let board_routes: Router = Router::new()
        .route("/health", get(health_check))
        .route("/boardapi", get(default_board))
        .route("/boardapi/:board", get(fetch_board).post(add_message))
        .route(
            "/boardapi/:board/:id",
            get(get_message).delete(delete_message),
        )
        .with_state(cache);

    let peer_routes: Router = Router::new()
        .route("/server/webrtc", get(websocket_handler))
        .with_state(registry);

    let app = Router::new()
        .merge(board_routes)
        .merge(peer_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");

    info!("driftboard listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}

async fn build_cache(config: &Config) -> Result<BoardCache, cache::CacheError> {
    match config.cache {
        CacheBackend::Memory => {
            info!("using in-memory board cache");
            Ok(BoardCache::memory())
        }
        CacheBackend::Redis => {
            info!("using redis board cache at {}", config.redis_url);
            BoardCache::redis(&config.redis_url).await
        }
    }
}
