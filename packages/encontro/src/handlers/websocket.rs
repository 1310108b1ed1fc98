use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::AppState;
use crate::error::RelayError;
use crate::models::RoomId;

/// Upgrade to a signaling session in `room`. Room validation happens inside
/// the session so a rejected client still gets an `error` envelope.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.relay.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let relay = state.relay.clone();
    let room_id = RoomId::from(room);
    ws.max_message_size(relay.config().max_frame_bytes)
        .on_upgrade(move |socket| async move {
            match relay.accept_connection(room_id.clone(), socket).await {
                Ok(()) => {}
                Err(e @ RelayError::RoomNotFound(_)) => {
                    debug!(room = %room_id, "Session rejected: {}", e);
                }
                Err(e) => {
                    warn!(room = %room_id, code = e.code(), "Session ended with error: {}", e)
                }
            }
        })
}
