//! Connection Hub
//!
//! Process-wide client id → connection directory, independent of rooms.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::connection::{ConnectionHandle, OutboundFrame};
use crate::error::RelayError;
use crate::models::ClientId;

#[derive(Default)]
pub struct ConnectionHub {
    conns: RwLock<HashMap<ClientId, ConnectionHandle>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection under its own client id.
    pub async fn register(&self, handle: ConnectionHandle) {
        let client_id = handle.client_id().clone();
        self.conns.write().await.insert(client_id, handle);
    }

    /// Forget a connection. Unknown ids are ignored.
    pub async fn unregister(&self, client_id: &ClientId) -> Option<ConnectionHandle> {
        self.conns.write().await.remove(client_id)
    }

    pub async fn get(&self, client_id: &ClientId) -> Option<ConnectionHandle> {
        self.conns.read().await.get(client_id).cloned()
    }

    /// Deliver one frame to a specific client. No retry, no queueing beyond
    /// the connection's own outbound queue.
    pub async fn send_to(
        &self,
        client_id: &ClientId,
        frame: OutboundFrame,
    ) -> Result<(), RelayError> {
        let handle = self
            .get(client_id)
            .await
            .ok_or_else(|| RelayError::ClientNotConnected(client_id.clone()))?;
        handle.send(frame)
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }

    /// Request a close on every live connection.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let conns = self.conns.read().await;
        for handle in conns.values() {
            handle.close(code, reason);
        }
        debug!(count = conns.len(), "Requested close on all connections");
        conns.len()
    }
}
