//! In-memory room and message store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{MessageRecorder, RoomLookup};
use crate::error::RepositoryError;
use crate::models::{ClientId, Message, Room, RoomId};

/// Messages kept per room before the oldest are discarded
const MAX_MESSAGES_PER_ROOM: usize = 1000;

/// Room and message store backed by process memory.
pub struct InMemoryRoomStore {
    rooms: RwLock<HashMap<RoomId, Room>>,
    messages: RwLock<HashMap<RoomId, Vec<Message>>>,
    /// Accept any room id, creating it on first lookup
    auto_create: bool,
}

impl InMemoryRoomStore {
    pub fn new(auto_create: bool) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            auto_create,
        }
    }

    /// Build a store pre-populated with rooms whose id and name are the given strings.
    pub fn seeded<I, S>(seed: I, auto_create: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms = seed
            .into_iter()
            .map(|name| {
                let name = name.into();
                let room = Room::new(RoomId::from(name.as_str()), name);
                (room.id.clone(), room)
            })
            .collect::<HashMap<_, _>>();
        info!("Seeded room store with {} rooms", rooms.len());
        Self {
            rooms: RwLock::new(rooms),
            messages: RwLock::new(HashMap::new()),
            auto_create,
        }
    }

    /// Create a room with a generated id.
    pub async fn create_room(&self, name: &str) -> Result<Room, RepositoryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RepositoryError::InvalidInput {
                entity: "room",
                reason: "name must not be empty".into(),
            });
        }
        let room = Room::new(RoomId::new(uuid::Uuid::new_v4().to_string()), name);
        self.insert_room(room).await
    }

    /// Insert a room with a caller-chosen id.
    pub async fn insert_room(&self, room: Room) -> Result<Room, RepositoryError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.id) {
            return Err(RepositoryError::Conflict {
                entity: "room",
                id: room.id.to_string(),
            });
        }
        rooms.insert(room.id.clone(), room.clone());
        debug!(room = %room.id, "Room created");
        Ok(room)
    }

    pub async fn get_room(&self, id: &RoomId) -> Result<Room, RepositoryError> {
        self.rooms
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "room",
                id: id.to_string(),
            })
    }

    /// All rooms, oldest first.
    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rooms
    }

    /// Delete a room and its recorded messages.
    pub async fn delete_room(&self, id: &RoomId) -> Result<(), RepositoryError> {
        if self.rooms.write().await.remove(id).is_none() {
            return Err(RepositoryError::NotFound {
                entity: "room",
                id: id.to_string(),
            });
        }
        self.messages.write().await.remove(id);
        debug!(room = %id, "Room deleted");
        Ok(())
    }

    /// Recorded messages for a room, oldest first.
    pub async fn list_messages(&self, room_id: &RoomId) -> Vec<Message> {
        self.messages
            .read()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryRoomStore {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl RoomLookup for InMemoryRoomStore {
    async fn room_exists(&self, room_id: &RoomId) -> Result<bool, RepositoryError> {
        if self.rooms.read().await.contains_key(room_id) {
            return Ok(true);
        }
        if !self.auto_create {
            return Ok(false);
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(room_id.clone(), room_id.as_str()));
        info!(room = %room_id, "Auto-created room on first join");
        Ok(true)
    }
}

#[async_trait]
impl MessageRecorder for InMemoryRoomStore {
    async fn record_message(
        &self,
        room_id: &RoomId,
        sender_id: &ClientId,
        content: &str,
    ) -> Result<(), RepositoryError> {
        if !self.rooms.read().await.contains_key(room_id) {
            return Err(RepositoryError::NotFound {
                entity: "room",
                id: room_id.to_string(),
            });
        }
        let mut messages = self.messages.write().await;
        let log = messages.entry(room_id.clone()).or_default();
        log.push(Message {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            sender_id: sender_id.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
        });
        if log.len() > MAX_MESSAGES_PER_ROOM {
            let excess = log.len() - MAX_MESSAGES_PER_ROOM;
            log.drain(..excess);
        }
        Ok(())
    }
}
