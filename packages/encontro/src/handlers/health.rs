use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let total_rooms = state.store.list_rooms().await.len() as u64;
    let occupied_rooms = state.relay.registry().room_count().await as u64;
    let metrics = state.metrics.snapshot();

    let status = if state.relay.is_shutting_down() {
        "shutting_down"
    } else if metrics.errors.transport == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        rooms: metrics::RoomHealth {
            total: total_rooms,
            occupied: occupied_rooms,
        },
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed relay metrics and occupied rooms
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let rooms = state
        .relay
        .registry()
        .rooms()
        .await
        .into_iter()
        .map(|(room, members)| metrics::RoomOccupancy {
            room: room.to_string(),
            members,
        })
        .collect();

    Json(metrics::MetricsResponse {
        snapshot: state.metrics.snapshot(),
        rooms,
    })
}

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
