use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::AppState;
use crate::error::RepositoryError;
use crate::models::{Client, Message, Room, RoomId};

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    name: String,
}

/// A room together with whoever is connected to it right now.
#[derive(Serialize)]
pub struct RoomDetails {
    #[serde(flatten)]
    room: Room,
    members: Vec<Client>,
}

fn status_for(err: &RepositoryError) -> StatusCode {
    match err {
        RepositoryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RepositoryError::Conflict { .. } => StatusCode::CONFLICT,
        RepositoryError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        RepositoryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn repo_err(err: RepositoryError) -> (StatusCode, String) {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Room store error: {}", err);
    }
    (status, err.to_string())
}

pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<Room>> {
    Json(state.store.list_rooms().await)
}

pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<Room>), (StatusCode, String)> {
    let room = state.store.create_room(&req.name).await.map_err(repo_err)?;
    info!(room = %room.id, name = %room.name, "Room created");
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RoomDetails>, (StatusCode, String)> {
    let room_id = RoomId::from(id);
    let room = state.store.get_room(&room_id).await.map_err(repo_err)?;
    let members = state.relay.registry().members(&room_id).await;
    Ok(Json(RoomDetails { room, members }))
}

/// Delete a room from the store. Connected members stay until they leave;
/// new joins are rejected.
pub async fn delete_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let room_id = RoomId::from(id);
    state.store.delete_room(&room_id).await.map_err(repo_err)?;
    info!(room = %room_id, "Room deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, (StatusCode, String)> {
    let room_id = RoomId::from(id);
    state.store.get_room(&room_id).await.map_err(repo_err)?;
    Ok(Json(state.store.list_messages(&room_id).await))
}
