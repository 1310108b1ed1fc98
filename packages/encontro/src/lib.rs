//! Room-scoped WebRTC signaling relay.
//!
//! Clients connect to `/ws/{room}`, are admitted into the room if the room
//! store knows it, and exchange `offer` / `answer` / `ice-candidate` envelopes
//! with every other member of that room.

use axum::{Router, routing::get};
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod relay;
pub mod repository;
pub mod ws;

use crate::config::{FileConfig, RelayConfig};
use crate::metrics::ServerMetrics;
use crate::relay::Relay;
use crate::repository::InMemoryRoomStore;

pub use crate::error::{RelayError, RepositoryError};

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /// Room/message store, also the relay's lookup and recorder
    pub store: Arc<InMemoryRoomStore>,
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn new(relay_config: RelayConfig, store: Arc<InMemoryRoomStore>) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let relay = Arc::new(Relay::new(
            relay_config,
            store.clone(),
            store.clone(),
            metrics.clone(),
        ));
        Self {
            relay,
            store,
            metrics,
        }
    }

    /// Build state from the loaded config: seeded room store plus relay.
    pub fn from_config(config: &FileConfig) -> Self {
        let store = Arc::new(InMemoryRoomStore::seeded(
            config.rooms.seed.iter().cloned(),
            config.rooms.auto_create,
        ));
        Self::new(RelayConfig::from_file(&config.relay), store)
    }
}

/// All routes, with state attached. Tracing and CORS layers are added by the binary.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{room}", get(handlers::websocket_handler))
        .route(
            "/api/rooms",
            get(handlers::list_rooms).post(handlers::create_room),
        )
        .route(
            "/api/rooms/{id}",
            get(handlers::get_room).delete(handlers::delete_room),
        )
        .route("/api/rooms/{id}/messages", get(handlers::list_messages))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
