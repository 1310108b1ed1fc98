//! Relay
//!
//! Owns the shared relay state and is the single entry point for new
//! connections. Sessions run on the caller's task and are tracked so shutdown
//! can wait for their cleanup.

use axum::extract::ws::Message;
use futures::{Sink, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::metrics::ServerMetrics;
use crate::models::RoomId;
use crate::repository::{MessageRecorder, RoomLookup};
use crate::ws::connection::CLOSE_GOING_AWAY;
use crate::ws::dispatch::Dispatcher;
use crate::ws::hub::ConnectionHub;
use crate::ws::registry::RoomRegistry;
use crate::ws::session;

pub struct Relay {
    registry: Arc<RoomRegistry>,
    hub: Arc<ConnectionHub>,
    dispatcher: Dispatcher,
    metrics: Arc<ServerMetrics>,
    config: RelayConfig,
    shutdown: CancellationToken,
    sessions: TaskTracker,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        lookup: Arc<dyn RoomLookup>,
        recorder: Arc<dyn MessageRecorder>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(lookup));
        let hub = Arc::new(ConnectionHub::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            hub.clone(),
            recorder,
            config.persist_types.iter().cloned(),
            metrics.clone(),
        );
        Self {
            registry,
            hub,
            dispatcher,
            metrics,
            config,
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Admit an upgraded socket into `room_id` and run its session until it
    /// ends. Resolves after cleanup has completed.
    pub async fn accept_connection<S>(
        self: &Arc<Self>,
        room_id: RoomId,
        socket: S,
    ) -> Result<(), RelayError>
    where
        S: Stream<Item = Result<Message, axum::Error>>
            + Sink<Message, Error = axum::Error>
            + Send
            + 'static,
    {
        self.sessions
            .track_future(session::run_session(self.clone(), room_id, socket))
            .await
    }

    /// Tell every session to close. New sessions see the signal immediately.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self
            .hub
            .close_all(CLOSE_GOING_AWAY, "server shutting down")
            .await;
        info!(connections = closed, "Relay shutting down");
    }

    /// Wait up to `grace` for tracked sessions to finish cleanup.
    /// Returns false if some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.sessions.close();
        match tokio::time::timeout(grace, self.sessions.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.sessions.len(),
                    "Sessions still running after shutdown grace period"
                );
                false
            }
        }
    }
}
