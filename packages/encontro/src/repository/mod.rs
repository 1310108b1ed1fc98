//! Collaborator contracts consumed by the relay
//!
//! The relay never owns rooms or messages. It asks a [`RoomLookup`] whether a
//! room exists before admitting a member, and hands selected envelopes to a
//! [`MessageRecorder`] for best-effort durability.

mod memory;

pub use memory::InMemoryRoomStore;

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::models::{ClientId, RoomId};

/// Resolves whether a room exists. Room existence is authoritative here,
/// not in the relay's registry.
#[async_trait]
pub trait RoomLookup: Send + Sync {
    async fn room_exists(&self, room_id: &RoomId) -> Result<bool, RepositoryError>;
}

/// Optional durability for relayed envelopes.
#[async_trait]
pub trait MessageRecorder: Send + Sync {
    async fn record_message(
        &self,
        room_id: &RoomId,
        sender_id: &ClientId,
        content: &str,
    ) -> Result<(), RepositoryError>;
}

/// Recorder that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl MessageRecorder for NoopRecorder {
    async fn record_message(
        &self,
        _room_id: &RoomId,
        _sender_id: &ClientId,
        _content: &str,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }
}
