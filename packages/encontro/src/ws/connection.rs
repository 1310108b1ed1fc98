//! Connection Handle
//!
//! One handle per live WebSocket. Every write goes through a bounded queue that
//! a single writer task drains, so the socket never sees concurrent writers and
//! a broadcaster never waits on a slow peer. Close requests travel outside the
//! queue so a full queue can never swallow them.

use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use super::protocol::ServerEnvelope;
use crate::error::RelayError;
use crate::models::ClientId;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Server going away (shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Malformed envelope
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Policy violation (rejected join)
pub const CLOSE_POLICY: u16 = 1008;

/// A frame waiting in a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
}

impl OutboundFrame {
    fn into_message(self) -> Message {
        match self {
            OutboundFrame::Text(text) => Message::Text(text.into()),
        }
    }
}

/// Close code and reason requested for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Cloneable send side of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    client_id: ClientId,
    tx: mpsc::Sender<OutboundFrame>,
    close: Arc<watch::Sender<Option<CloseRequest>>>,
    dead: CancellationToken,
    dropped: Arc<AtomicU64>,
}

/// Receive side of one connection, owned by its writer task. Holds no sender,
/// so the queue closes once every handle is gone.
#[derive(Debug)]
pub struct OutboundQueue {
    client_id: ClientId,
    frames: mpsc::Receiver<OutboundFrame>,
    close: watch::Receiver<Option<CloseRequest>>,
    dead: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the queue its writer task drains.
    pub fn new(client_id: ClientId, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, frames) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let dead = CancellationToken::new();
        let queue = OutboundQueue {
            client_id: client_id.clone(),
            frames,
            close: close_rx,
            dead: dead.clone(),
        };
        let handle = Self {
            client_id,
            tx,
            close: Arc::new(close_tx),
            dead,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (handle, queue)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Enqueue a frame without waiting. A full queue drops the new frame.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), RelayError> {
        if self.dead.is_cancelled() || self.close_requested().is_some() {
            return Err(RelayError::Transport(format!(
                "connection {} is closed",
                self.client_id
            )));
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(RelayError::QueueFull(self.client_id.clone()))
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::Transport(format!(
                "connection {} writer has stopped",
                self.client_id
            ))),
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.send(OutboundFrame::Text(text.into()))
    }

    pub fn send_envelope(&self, envelope: &ServerEnvelope) -> Result<(), RelayError> {
        self.send_text(envelope.to_json()?)
    }

    /// Ask the writer to flush what is already queued, write a close frame and
    /// stop. The first request wins; later frames are refused.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.close.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(CloseRequest { code, reason });
            true
        });
        if !first {
            debug!(client_id = %self.client_id, code, "Close already requested");
        }
    }

    /// The close requested so far, if any.
    pub fn close_requested(&self) -> Option<CloseRequest> {
        self.close.borrow().clone()
    }

    /// Treat the connection as dead; its session tears down.
    pub fn mark_dead(&self) {
        self.dead.cancel();
    }

    /// Resolves once the connection has been marked dead.
    pub fn dead(&self) -> WaitForCancellationFuture<'_> {
        self.dead.cancelled()
    }

    /// Frames discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl OutboundQueue {
    pub(crate) async fn recv(&mut self) -> Option<OutboundFrame> {
        self.frames.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.frames.try_recv().ok()
    }
}

/// Write one message, bounded by `send_timeout`. Marks the connection dead on
/// failure.
async fn write<S>(
    sink: &mut S,
    message: Message,
    queue: &OutboundQueue,
    send_timeout: Duration,
) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(send_timeout, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(client_id = %queue.client_id, "WebSocket write failed: {}", e);
            queue.dead.cancel();
            false
        }
        Err(_) => {
            warn!(
                client_id = %queue.client_id,
                timeout_ms = send_timeout.as_millis() as u64,
                "WebSocket write stalled, dropping connection"
            );
            queue.dead.cancel();
            false
        }
    }
}

/// Drain `queue` into `sink` until every handle is gone, a close is requested
/// (queued frames are flushed first), or a write fails or stalls longer than
/// `send_timeout`.
pub async fn run_writer<S>(mut sink: S, mut queue: OutboundQueue, send_timeout: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut close_open = true;
    loop {
        tokio::select! {
            changed = queue.close.changed(), if close_open => {
                if changed.is_err() {
                    // Every handle dropped; the frame queue closes too
                    close_open = false;
                    continue;
                }
                let Some(request) = queue.close.borrow_and_update().clone() else {
                    continue;
                };
                while let Ok(frame) = queue.frames.try_recv() {
                    if !write(&mut sink, frame.into_message(), &queue, send_timeout).await {
                        queue.frames.close();
                        return;
                    }
                }
                let message = Message::Close(Some(CloseFrame {
                    code: request.code,
                    reason: request.reason.into(),
                }));
                write(&mut sink, message, &queue, send_timeout).await;
                break;
            }
            frame = queue.frames.recv() => {
                let Some(frame) = frame else { break };
                if !write(&mut sink, frame.into_message(), &queue, send_timeout).await {
                    break;
                }
            }
        }
    }
    queue.frames.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink whose writes never complete.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn expect_text(msg: Option<Message>, expected: &str) {
        match msg {
            Some(Message::Text(t)) => assert_eq!(t.as_str(), expected),
            other => panic!("expected text, got {:?}", other),
        }
    }

    fn expect_close(msg: Option<Message>, code: u16, reason: &str) {
        match msg {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, code);
                assert_eq!(frame.reason.as_str(), reason);
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_enqueues_in_order() {
        let (handle, mut queue) = ConnectionHandle::new(ClientId::from("c1"), 4);
        handle.send_text("one").unwrap();
        handle.send_text("two").unwrap();
        assert_eq!(queue.frames.recv().await, Some(OutboundFrame::Text("one".into())));
        assert_eq!(queue.frames.recv().await, Some(OutboundFrame::Text("two".into())));
    }

    #[tokio::test]
    async fn full_queue_drops_new_frames_without_blocking() {
        let (handle, mut queue) = ConnectionHandle::new(ClientId::from("c1"), 2);
        handle.send_text("a").unwrap();
        handle.send_text("b").unwrap();
        let err = handle.send_text("c").unwrap_err();
        assert!(matches!(err, RelayError::QueueFull(_)));
        assert_eq!(handle.dropped(), 1);

        assert_eq!(queue.frames.recv().await, Some(OutboundFrame::Text("a".into())));
        assert_eq!(queue.frames.recv().await, Some(OutboundFrame::Text("b".into())));
        assert!(queue.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_after_writer_gone_is_transport_error() {
        let (handle, queue) = ConnectionHandle::new(ClientId::from("c1"), 2);
        drop(queue);
        assert!(matches!(
            handle.send_text("x"),
            Err(RelayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn dead_handle_refuses_sends() {
        let (handle, _queue) = ConnectionHandle::new(ClientId::from("c1"), 2);
        handle.mark_dead();
        assert!(matches!(
            handle.send_text("x"),
            Err(RelayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn first_close_request_wins() {
        let (handle, _queue) = ConnectionHandle::new(ClientId::from("c1"), 2);
        assert!(handle.close_requested().is_none());
        handle.close(CLOSE_POLICY, "room_not_found");
        handle.close(CLOSE_NORMAL, "later");
        assert_eq!(
            handle.close_requested(),
            Some(CloseRequest {
                code: CLOSE_POLICY,
                reason: "room_not_found".into(),
            })
        );
        assert!(handle.send_text("after close").is_err());
    }

    #[tokio::test]
    async fn writer_flushes_queue_then_closes() {
        let (handle, queue) = ConnectionHandle::new(ClientId::from("c1"), 8);
        let (sink, mut out) = futures::channel::mpsc::unbounded::<Message>();
        handle.send_text("hello").unwrap();
        handle.send_text("world").unwrap();
        handle.close(CLOSE_NORMAL, "bye");

        run_writer(sink, queue, Duration::from_secs(1)).await;

        expect_text(out.next().await, "hello");
        expect_text(out.next().await, "world");
        expect_close(out.next().await, CLOSE_NORMAL, "bye");
        assert!(!handle.dead.is_cancelled());
        assert!(handle.send_text("late").is_err());
    }

    #[tokio::test]
    async fn close_is_delivered_when_queue_is_full() {
        let (handle, queue) = ConnectionHandle::new(ClientId::from("c1"), 1);
        handle.send_text("only slot").unwrap();
        assert!(matches!(
            handle.send_text("overflow"),
            Err(RelayError::QueueFull(_))
        ));
        handle.close(CLOSE_NORMAL, "bye");

        let (sink, mut out) = futures::channel::mpsc::unbounded::<Message>();
        let writer = tokio::spawn(run_writer(sink, queue, Duration::from_secs(1)));
        drop(handle);

        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer should finish after writing the close frame")
            .unwrap();
        expect_text(out.next().await, "only slot");
        expect_close(out.next().await, CLOSE_NORMAL, "bye");
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn writer_stops_when_every_handle_is_dropped() {
        let (handle, queue) = ConnectionHandle::new(ClientId::from("c1"), 4);
        handle.send_text("last words").unwrap();

        let (sink, mut out) = futures::channel::mpsc::unbounded::<Message>();
        let writer = tokio::spawn(run_writer(sink, queue, Duration::from_secs(1)));
        drop(handle);

        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("writer should stop once its queue closes")
            .unwrap();
        expect_text(out.next().await, "last words");
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn stalled_writer_marks_connection_dead() {
        let (handle, queue) = ConnectionHandle::new(ClientId::from("c1"), 8);
        handle.send_text("stuck").unwrap();

        let writer = tokio::spawn(run_writer(StalledSink, queue, Duration::from_millis(50)));

        tokio::time::timeout(Duration::from_secs(2), handle.dead())
            .await
            .expect("writer should mark the connection dead");
        writer.await.unwrap();
        assert!(handle.send_text("x").is_err());
    }
}
