pub mod health;
pub mod rooms;
pub mod websocket;

pub use health::{health_handler, health_live_handler, metrics_handler};
pub use rooms::{create_room, delete_room, get_room, list_messages, list_rooms};
pub use websocket::websocket_handler;
