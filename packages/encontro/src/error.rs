//! Error types for the relay and its collaborators.

use crate::models::{ClientId, RoomId};

/// Errors raised by the signaling relay.
///
/// Each variant maps to a stable machine-readable code that is sent to
/// clients inside `error` envelopes.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("client not connected: {0}")]
    ClientNotConnected(ClientId),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown envelope type: {0}")]
    UnknownEnvelopeType(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(&'static str),

    #[error("outbound queue full for client {0}")]
    QueueFull(ClientId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("room lookup failed: {0}")]
    Lookup(#[from] RepositoryError),
}

impl RelayError {
    /// Code sent to clients in the `error` envelope payload.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::RoomNotFound(_) => "room_not_found",
            RelayError::ClientNotConnected(_) => "client_not_connected",
            RelayError::MalformedEnvelope(_) => "malformed_envelope",
            RelayError::UnknownEnvelopeType(_) => "unknown_envelope_type",
            RelayError::UnsupportedFrame(_) => "unsupported_frame",
            RelayError::QueueFull(_) => "queue_full",
            RelayError::Transport(_) => "transport_error",
            RelayError::Lookup(_) => "lookup_failed",
        }
    }

    /// Whether the session that produced this error has to be torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedEnvelope(_) | RelayError::Transport(_)
        )
    }
}

/// Errors from the room/message store collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("invalid {entity}: {reason}")]
    InvalidInput {
        entity: &'static str,
        reason: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<axum::Error> for RelayError {
    fn from(err: axum::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedEnvelope(err.to_string())
    }
}
