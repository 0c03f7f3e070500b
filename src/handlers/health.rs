//! Admin HTTP surface
//!
//! `GET /health` is always open and exposes counters only, never
//! identifiers. `GET /stats` is gated by the admin key when one is
//! configured; the key arrives as an `x-admin-key` header or an
//! `admin_key` query parameter.

use log::error;
use serde::Deserialize;
use warp::http::StatusCode;

use crate::core::SharedRelayManager;

#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    pub admin_key: Option<String>,
}

pub async fn health(server: SharedRelayManager) -> impl warp::Reply {
    match server.stats().await {
        Ok(stats) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "status": "ok",
                "uptime": server.uptime_secs(),
                "activeSessions": stats.active_sessions,
                "waitingInQueue": stats.waiting_in_queue,
                "activeRooms": stats.active_rooms,
            })),
            StatusCode::OK,
        ),
        Err(e) => {
            error!("Health check failed: {}", e);
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "degraded"})),
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
    }
}

pub async fn stats(
    server: SharedRelayManager,
    admin_key: Option<String>,
    header_key: Option<String>,
    query: AdminQuery,
) -> impl warp::Reply {
    if let Some(expected) = admin_key {
        let supplied = header_key.or(query.admin_key);
        if supplied.as_deref() != Some(expected.as_str()) {
            return warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"error": "Forbidden"})),
                StatusCode::FORBIDDEN,
            );
        }
    }

    match server.stats().await {
        Ok(stats) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "uptime": server.uptime_secs(),
                "activeSessions": stats.active_sessions,
                "waitingInQueue": stats.waiting_in_queue,
                "activeRooms": stats.active_rooms,
                "backend": stats.backend_kind,
            })),
            StatusCode::OK,
        ),
        Err(e) => {
            error!("Stats fetch failed: {}", e);
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"error": "Backend unavailable"})),
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
    }
}
