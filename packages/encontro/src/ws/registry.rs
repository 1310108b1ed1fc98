//! Room Registry
//!
//! In-process directory of room membership. The registry decides who is in a
//! room right now; whether a room exists at all is the room store's call.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::RelayError;
use crate::models::{Client, ClientId, RoomId};
use crate::repository::RoomLookup;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, HashMap<ClientId, Client>>>,
    lookup: Arc<dyn RoomLookup>,
}

impl RoomRegistry {
    pub fn new(lookup: Arc<dyn RoomLookup>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            lookup,
        }
    }

    /// Add `client` to `room_id` after validating the room with the lookup.
    /// Joining twice with the same client id replaces the earlier entry.
    pub async fn join(&self, room_id: &RoomId, client: Client) -> Result<(), RelayError> {
        if !self.lookup.room_exists(room_id).await? {
            return Err(RelayError::RoomNotFound(room_id.clone()));
        }

        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room_id.clone()).or_default();
        members.insert(client.id.clone(), client);
        debug!(room = %room_id, members = members.len(), "Client joined room");
        Ok(())
    }

    /// Remove a member. Removing a non-member is a no-op.
    pub async fn leave(&self, room_id: &RoomId, client_id: &ClientId) -> Option<Client> {
        let mut rooms = self.rooms.write().await;
        let members = rooms.get_mut(room_id)?;
        let removed = members.remove(client_id);
        if members.is_empty() {
            rooms.remove(room_id);
        }
        if removed.is_some() {
            debug!(room = %room_id, client_id = %client_id, "Client left room");
        }
        removed
    }

    /// Copy of the room's current members, ordered by join time.
    pub async fn members(&self, room_id: &RoomId) -> Vec<Client> {
        let mut members: Vec<Client> = self
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        members
    }

    pub async fn contains(&self, room_id: &RoomId, client_id: &ClientId) -> bool {
        self.rooms
            .read()
            .await
            .get(room_id)
            .is_some_and(|m| m.contains_key(client_id))
    }

    pub async fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.read().await.get(room_id).map_or(0, |m| m.len())
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Occupied rooms with their member counts.
    pub async fn rooms(&self) -> Vec<(RoomId, usize)> {
        let mut rooms: Vec<(RoomId, usize)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, m)| (id.clone(), m.len()))
            .collect();
        rooms.sort();
        rooms
    }
}
