//! In-memory duplex socket for driving sessions without a network.

use axum::extract::ws::Message;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{Sink, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Server side of the pair, handed to the session.
pub(crate) struct TestSocket {
    incoming: UnboundedReceiver<Result<Message, axum::Error>>,
    outgoing: UnboundedSender<Message>,
}

/// Client side of the pair, driven by the test.
pub(crate) struct TestPeer {
    tx: UnboundedSender<Result<Message, axum::Error>>,
    rx: UnboundedReceiver<Message>,
}

pub(crate) fn socket_pair() -> (TestSocket, TestPeer) {
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, out_rx) = mpsc::unbounded();
    (
        TestSocket {
            incoming: in_rx,
            outgoing: out_tx,
        },
        TestPeer {
            tx: in_tx,
            rx: out_rx,
        },
    )
}

impl Stream for TestSocket {
    type Item = Result<Message, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_next_unpin(cx)
    }
}

impl Sink<Message> for TestSocket {
    type Error = axum::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing)
            .poll_ready(cx)
            .map_err(axum::Error::new)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        Pin::new(&mut self.outgoing)
            .start_send(item)
            .map_err(axum::Error::new)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing)
            .poll_flush(cx)
            .map_err(axum::Error::new)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outgoing)
            .poll_close(cx)
            .map_err(axum::Error::new)
    }
}

impl TestPeer {
    pub fn send_text(&self, text: &str) {
        self.tx
            .unbounded_send(Ok(Message::Text(text.into())))
            .expect("session stopped reading");
    }

    pub fn send(&self, message: Message) {
        self.tx
            .unbounded_send(Ok(message))
            .expect("session stopped reading");
    }

    /// Next frame the session wrote, or None once the session dropped its socket.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::time::timeout(Duration::from_secs(5), self.rx.next())
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn recv_json(&mut self) -> serde_json::Value {
        match self.recv().await {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    /// Expect a close frame and return its code.
    pub async fn recv_close(&mut self) -> u16 {
        match self.recv().await {
            Some(Message::Close(Some(frame))) => frame.code,
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
