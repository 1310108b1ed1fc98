//! Session Loop
//!
//! Drives one WebSocket from upgrade to teardown:
//!
//! ```text
//! Connecting -> Registered -> Active -> Closing -> Closed
//!                   |                      ^
//!                   +---- join rejected ---+
//! ```
//!
//! Cleanup (registry leave, hub unregister, `peer-left`) runs on every exit
//! path, including a panic during the join or the receive loop.

use axum::extract::ws::Message;
use futures::{FutureExt, Sink, Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::connection::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_POLICY, CLOSE_PROTOCOL_ERROR, ConnectionHandle,
    run_writer,
};
use super::protocol::{Envelope, ServerEnvelope};
use crate::error::RelayError;
use crate::models::{Client, ClientId, RoomId};
use crate::relay::Relay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Connecting,
    Registered,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn advance(&mut self, next: SessionState, client_id: &ClientId) {
        debug!(client_id = %client_id, from = ?*self, to = ?next, "Session state");
        *self = next;
    }
}

/// Why the session stopped.
#[derive(Debug)]
enum SessionExit {
    Rejected(RelayError),
    ClientClosed,
    StreamEnded,
    IdleTimeout,
    Shutdown,
    Failed(RelayError),
}

impl SessionExit {
    fn close_frame(&self) -> (u16, &'static str) {
        match self {
            SessionExit::Rejected(e) => (CLOSE_POLICY, e.code()),
            SessionExit::ClientClosed | SessionExit::StreamEnded => (CLOSE_NORMAL, ""),
            SessionExit::IdleTimeout => (CLOSE_NORMAL, "idle timeout"),
            SessionExit::Shutdown => (CLOSE_GOING_AWAY, "server shutting down"),
            SessionExit::Failed(RelayError::MalformedEnvelope(_)) => {
                (CLOSE_PROTOCOL_ERROR, "malformed envelope")
            }
            SessionExit::Failed(_) => (CLOSE_GOING_AWAY, "transport error"),
        }
    }
}

/// Run one signaling session to completion.
///
/// Returns `Err` when the join was rejected or the session ended on a
/// terminal error; either way the client leaves no trace behind.
pub(crate) async fn run_session<S>(
    relay: Arc<Relay>,
    room_id: RoomId,
    socket: S,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + 'static,
{
    let config = relay.config();
    let client = Client::connect(room_id.clone());
    let mut state = SessionState::Connecting;

    let (sink, mut stream) = socket.split();
    let (handle, queue) = ConnectionHandle::new(client.id.clone(), config.send_queue_capacity);
    let writer = tokio::spawn(run_writer(sink, queue, config.send_timeout));

    relay.metrics().connection_opened();
    relay.hub().register(handle.clone()).await;
    state.advance(SessionState::Registered, &client.id);

    let admitted = admit_and_run(&relay, &client, &handle, &mut stream, &mut state);
    let exit = match AssertUnwindSafe(admitted).catch_unwind().await {
        Ok(exit) => exit,
        Err(_) => {
            error!(client_id = %client.id, room = %room_id, "Session panicked, cleaning up");
            SessionExit::Failed(RelayError::Transport("session panicked".into()))
        }
    };

    let (code, reason) = exit.close_frame();
    handle.close(code, reason);
    let exit = match exit {
        SessionExit::Rejected(e) | SessionExit::Failed(e) => Err(e),
        other => {
            debug!(client_id = %client.id, exit = ?other, "Receive loop finished");
            Ok(())
        }
    };

    state.advance(SessionState::Closing, &client.id);
    cleanup(&relay, &client).await;

    // The writer exits after flushing and writing the close frame; give it one
    // write's worth of time before cutting it loose.
    let flush_budget = config.send_timeout + Duration::from_millis(100);
    let abort = writer.abort_handle();
    if tokio::time::timeout(flush_budget, writer).await.is_err() {
        debug!(client_id = %client.id, "Writer did not finish in time, aborting");
        abort.abort();
    }

    relay.metrics().connection_closed();
    state.advance(SessionState::Closed, &client.id);

    match &exit {
        Ok(()) => info!(
            client_id = %client.id,
            room = %room_id,
            dropped_frames = handle.dropped(),
            "Client disconnected"
        ),
        Err(e) => info!(
            client_id = %client.id,
            room = %room_id,
            code = e.code(),
            dropped_frames = handle.dropped(),
            "Client disconnected with error"
        ),
    }
    exit
}

/// Join the room, announce the newcomer and run the receive loop.
async fn admit_and_run<R>(
    relay: &Relay,
    client: &Client,
    handle: &ConnectionHandle,
    stream: &mut R,
    state: &mut SessionState,
) -> SessionExit
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    if let Err(e) = relay.registry().join(&client.room_id, client.clone()).await {
        relay.metrics().join_rejected();
        warn!(client_id = %client.id, room = %client.room_id, "Join rejected: {}", e);
        if let Err(send_err) = handle.send_envelope(&ServerEnvelope::error(&e)) {
            debug!(client_id = %client.id, "Could not report rejected join: {}", send_err);
        }
        return SessionExit::Rejected(e);
    }

    state.advance(SessionState::Active, &client.id);
    info!(
        client_id = %client.id,
        room = %client.room_id,
        label = %client.label,
        "Client joined room"
    );

    if relay.config().announce_membership {
        relay
            .dispatcher()
            .announce(&client.room_id, &client.id, &ServerEnvelope::PeerJoined(client.clone()))
            .await;
    }

    receive_loop(relay, client, handle, stream).await
}

/// Remove every trace of `client` and tell the room it left.
async fn cleanup(relay: &Relay, client: &Client) {
    let left = relay.registry().leave(&client.room_id, &client.id).await;
    relay.hub().unregister(&client.id).await;

    if let Some(member) = left {
        if relay.config().announce_membership {
            relay
                .dispatcher()
                .announce(&client.room_id, &client.id, &ServerEnvelope::PeerLeft(member))
                .await;
        }
    }
}

async fn receive_loop<R>(
    relay: &Relay,
    client: &Client,
    handle: &ConnectionHandle,
    stream: &mut R,
) -> SessionExit
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let shutdown = relay.shutdown_token();
    let idle_timeout = relay.config().idle_timeout;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return SessionExit::Shutdown,
            _ = handle.dead() => {
                relay.metrics().transport_error();
                return SessionExit::Failed(RelayError::Transport("outbound writer stopped".into()));
            }
            next = next_frame(stream, idle_timeout) => next,
        };

        let message = match next {
            None => {
                info!(client_id = %client.id, "Idle timeout, closing session");
                return SessionExit::IdleTimeout;
            }
            Some(None) => return SessionExit::StreamEnded,
            Some(Some(Err(e))) => {
                relay.metrics().transport_error();
                debug!(client_id = %client.id, "WebSocket read failed: {}", e);
                return SessionExit::Failed(e.into());
            }
            Some(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if let Err(e) = handle_text(relay, client, handle, text.as_str()).await {
                    return SessionExit::Failed(e);
                }
            }
            Message::Binary(_) => {
                report(relay, client, handle, &RelayError::UnsupportedFrame("binary"));
            }
            Message::Close(frame) => {
                debug!(client_id = %client.id, frame = ?frame, "Client sent close");
                return SessionExit::ClientClosed;
            }
            // Pings are answered by the WebSocket layer
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Wait for the next frame. `None` means the idle timeout elapsed.
async fn next_frame<R>(
    stream: &mut R,
    idle_timeout: Option<Duration>,
) -> Option<Option<Result<Message, axum::Error>>>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
        None => Some(stream.next().await),
    }
}

/// Decode and dispatch one text frame. Only terminal errors come back.
async fn handle_text(
    relay: &Relay,
    client: &Client,
    handle: &ConnectionHandle,
    text: &str,
) -> Result<(), RelayError> {
    relay.metrics().envelope_received();

    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            report(relay, client, handle, &e);
            return Err(e);
        }
    };

    match relay.dispatcher().dispatch(client, &envelope).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_terminal() => {
            relay.metrics().transport_error();
            Err(e)
        }
        Err(e) => {
            report(relay, client, handle, &e);
            Ok(())
        }
    }
}

/// Send an `error` envelope back to the offending client.
fn report(relay: &Relay, client: &Client, handle: &ConnectionHandle, err: &RelayError) {
    relay.metrics().protocol_error();
    warn!(client_id = %client.id, code = err.code(), "Protocol error: {}", err);
    if let Err(e) = handle.send_envelope(&ServerEnvelope::error(err)) {
        debug!(client_id = %client.id, "Could not report protocol error: {}", e);
    }
}
