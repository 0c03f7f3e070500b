use log::{error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::{self, Filter};

use hush_relay::config::{CorsOrigins, ServerConfig};
use hush_relay::constants::{MAX_FRAME_BYTES, WS_PATH};
use hush_relay::core::{RelayManager, SharedRelayManager};
use hush_relay::error::RelayError;
use hush_relay::handlers::health;
use hush_relay::handlers::websocket::handle_ws_client;
use hush_relay::storage::{MemoryBackend, RedisBackend, SharedBackend};

#[tokio::main]
async fn main() {
    // Initialize env
    match dotenv::dotenv() {
        Ok(_) => info!("Environment variables loaded from .env file"),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Initialize logging
    env_logger::init();

    // Load config from the environment
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration: host={}, port={}", config.host, config.port);

    // Select the state backend: REDIS_URL opts into the shared fleet mode
    let backend: SharedBackend = match &config.redis_url {
        Some(url) => {
            info!("Using shared Redis state backend");
            match RedisBackend::connect(url).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("Using in-process state backend");
            Arc::new(MemoryBackend::new())
        }
    };

    let server: SharedRelayManager = Arc::new(RelayManager::new(backend));
    server.start_delivery_loop();
    server.start_sweeper();

    // Create WebSocket route
    let ws_route = warp::path(WS_PATH)
        .and(warp::ws())
        .and(with_server(server.clone()))
        .map(|ws: warp::ws::Ws, server: SharedRelayManager| {
            info!("New websocket connection");
            ws.max_message_size(MAX_FRAME_BYTES)
                .on_upgrade(move |socket| handle_ws_client(socket, server))
        });

    // Create health check route
    let health_route = warp::path("health")
        .and(warp::get())
        .and(with_server(server.clone()))
        .then(health::health);

    // Admin stats route, gated when an admin key is configured
    let admin_key = config.admin_key.clone();
    let stats_route = warp::path("stats")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and(warp::any().map(move || admin_key.clone()))
        .and(warp::header::optional::<String>("x-admin-key"))
        .and(warp::query::<health::AdminQuery>())
        .then(health::stats);

    // Combine routes
    let routes = ws_route.or(health_route).or(stats_route);

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(
                "Failed to parse server address: {}",
                RelayError::ConfigError(e.to_string())
            );
            std::process::exit(1);
        }
    };

    // Start the server
    info!("Starting relay server on {}", addr);

    match &config.cors_origins {
        CorsOrigins::Any => {
            let cors = warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET"])
                .allow_headers(vec!["x-admin-key", "content-type"]);
            warp::serve(routes.with(cors)).run(addr).await;
        }
        CorsOrigins::List(origins) => {
            let cors = warp::cors()
                .allow_origins(origins.iter().map(|origin| origin.as_str()))
                .allow_methods(vec!["GET"])
                .allow_headers(vec!["x-admin-key", "content-type"]);
            warp::serve(routes.with(cors)).run(addr).await;
        }
    }
}

// Helper function to include the relay manager in request filters
fn with_server(
    server: SharedRelayManager,
) -> impl Filter<Extract = (SharedRelayManager,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}
