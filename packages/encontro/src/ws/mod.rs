//! Signaling WebSocket relay
//!
//! One session per socket, one room per session:
//! - `registry` tracks who is in which room
//! - `hub` maps client ids to their outbound queues
//! - `dispatch` applies the relay rule for each envelope type
//! - `session` owns the socket lifecycle and cleanup

pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod protocol;
pub mod registry;
pub(crate) mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::{CloseRequest, ConnectionHandle, OutboundFrame, OutboundQueue};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use hub::ConnectionHub;
pub use protocol::{Envelope, EnvelopeKind, ErrorPayload, ServerEnvelope};
pub use registry::RoomRegistry;
