//! Protocol Dispatcher
//!
//! Applies the per-type relay rule to one inbound envelope.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::connection::OutboundFrame;
use super::hub::ConnectionHub;
use super::protocol::{Envelope, EnvelopeKind, ServerEnvelope};
use super::registry::RoomRegistry;
use crate::error::RelayError;
use crate::metrics::ServerMetrics;
use crate::models::{Client, ClientId, RoomId};
use crate::repository::MessageRecorder;

/// Delivery counts for one dispatched envelope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
    hub: Arc<ConnectionHub>,
    recorder: Arc<dyn MessageRecorder>,
    persist_types: HashSet<String>,
    metrics: Arc<ServerMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RoomRegistry>,
        hub: Arc<ConnectionHub>,
        recorder: Arc<dyn MessageRecorder>,
        persist_types: impl IntoIterator<Item = String>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            registry,
            hub,
            recorder,
            persist_types: persist_types.into_iter().collect(),
            metrics,
        }
    }

    /// Handle one envelope from `sender`. Unknown types come back as
    /// `UnknownEnvelopeType` for the session to report. A sender that is not
    /// a member of its room gets `ClientNotConnected` and nothing is relayed.
    pub async fn dispatch(
        &self,
        sender: &Client,
        envelope: &Envelope,
    ) -> Result<DispatchOutcome, RelayError> {
        if !self.registry.contains(&sender.room_id, &sender.id).await {
            return Err(RelayError::ClientNotConnected(sender.id.clone()));
        }
        match &envelope.kind {
            EnvelopeKind::Join => self.send_room_state(sender).await,
            EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::IceCandidate => {
                self.record(sender, envelope).await;
                let outcome = self
                    .broadcast(&sender.room_id, Some(&sender.id), envelope.raw())
                    .await;
                debug!(
                    client_id = %sender.id,
                    room = %sender.room_id,
                    kind = %envelope.kind,
                    delivered = outcome.delivered,
                    failed = outcome.failed,
                    "Relayed envelope"
                );
                Ok(outcome)
            }
            EnvelopeKind::Unknown(kind) => Err(RelayError::UnknownEnvelopeType(kind.clone())),
        }
    }

    /// Send the room's membership snapshot to `client` alone.
    async fn send_room_state(&self, client: &Client) -> Result<DispatchOutcome, RelayError> {
        let members = self.registry.members(&client.room_id).await;
        let frame = ServerEnvelope::RoomState(members).to_json()?;
        self.hub
            .send_to(&client.id, OutboundFrame::Text(frame))
            .await?;
        Ok(DispatchOutcome {
            delivered: 1,
            failed: 0,
        })
    }

    /// Queue `text` to every current member of `room_id` except `except`.
    /// One recipient failing never stops delivery to the others.
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        except: Option<&ClientId>,
        text: &str,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for member in self.registry.members(room_id).await {
            if Some(&member.id) == except {
                continue;
            }
            match self
                .hub
                .send_to(&member.id, OutboundFrame::Text(text.to_string()))
                .await
            {
                Ok(()) => outcome.delivered += 1,
                Err(RelayError::QueueFull(id)) => {
                    outcome.failed += 1;
                    self.metrics.frame_dropped();
                    warn!(client_id = %id, room = %room_id, "Outbound queue full, frame dropped");
                }
                Err(e) => {
                    outcome.failed += 1;
                    self.metrics.delivery_failed();
                    debug!(client_id = %member.id, room = %room_id, "Delivery failed: {}", e);
                }
            }
        }
        self.metrics.frames_relayed(outcome.delivered as u64);
        outcome
    }

    /// Announce a server envelope to the room, skipping `except`.
    pub async fn announce(
        &self,
        room_id: &RoomId,
        except: &ClientId,
        envelope: &ServerEnvelope,
    ) -> DispatchOutcome {
        match envelope.to_json() {
            Ok(text) => self.broadcast(room_id, Some(except), &text).await,
            Err(e) => {
                warn!(room = %room_id, "Failed to encode announcement: {}", e);
                DispatchOutcome::default()
            }
        }
    }

    async fn record(&self, sender: &Client, envelope: &Envelope) {
        if !self.persist_types.contains(envelope.kind.as_str()) {
            return;
        }
        if let Err(e) = self
            .recorder
            .record_message(&sender.room_id, &sender.id, envelope.payload_text())
            .await
        {
            warn!(
                client_id = %sender.id,
                room = %sender.room_id,
                kind = %envelope.kind,
                "Failed to record message: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRoomStore, NoopRecorder};
    use crate::ws::connection::{ConnectionHandle, OutboundQueue};
    use tokio::sync::Barrier;

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<RoomRegistry>,
        hub: Arc<ConnectionHub>,
        store: Arc<InMemoryRoomStore>,
        metrics: Arc<ServerMetrics>,
    }

    fn fixture(persist: &[&str]) -> Fixture {
        let store = Arc::new(InMemoryRoomStore::seeded(["r1", "r2"], false));
        let registry = Arc::new(RoomRegistry::new(store.clone()));
        let hub = Arc::new(ConnectionHub::new());
        let metrics = Arc::new(ServerMetrics::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            hub.clone(),
            store.clone(),
            persist.iter().map(|s| s.to_string()),
            metrics.clone(),
        );
        Fixture {
            dispatcher,
            registry,
            hub,
            store,
            metrics,
        }
    }

    async fn connect(
        f: &Fixture,
        room: &str,
        capacity: usize,
    ) -> (Client, OutboundQueue) {
        let client = Client::connect(RoomId::from(room));
        let (handle, rx) = ConnectionHandle::new(client.id.clone(), capacity);
        f.hub.register(handle).await;
        f.registry
            .join(&client.room_id, client.clone())
            .await
            .unwrap();
        (client, rx)
    }

    fn text(frame: Option<OutboundFrame>) -> String {
        match frame {
            Some(OutboundFrame::Text(t)) => t,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn offer_reaches_everyone_but_sender() {
        let f = fixture(&[]);
        let (a, mut a_rx) = connect(&f, "r1", 8).await;
        let (_b, mut b_rx) = connect(&f, "r1", 8).await;
        let (_c, mut c_rx) = connect(&f, "r1", 8).await;
        let (_other, mut other_rx) = connect(&f, "r2", 8).await;

        let raw = r#"{"type":"offer","payload":{"sdp":"..."}}"#;
        let outcome = f
            .dispatcher
            .dispatch(&a, &Envelope::decode(raw).unwrap())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome { delivered: 2, failed: 0 });
        assert_eq!(text(b_rx.recv().await), raw);
        assert_eq!(text(c_rx.recv().await), raw);
        assert!(a_rx.try_recv().is_none());
        assert!(other_rx.try_recv().is_none());
        assert_eq!(f.metrics.snapshot().envelopes.relayed, 2);
    }

    #[tokio::test]
    async fn answer_and_candidate_are_relayed_verbatim() {
        let f = fixture(&[]);
        let (a, _a_rx) = connect(&f, "r1", 8).await;
        let (_b, mut b_rx) = connect(&f, "r1", 8).await;

        for raw in [
            r#"{"type":"answer","payload":{"sdp":"v=0"}}"#,
            r#"{ "type" : "ice-candidate", "payload" : {"candidate":"a=1","sdpMid":"0"} }"#,
        ] {
            f.dispatcher
                .dispatch(&a, &Envelope::decode(raw).unwrap())
                .await
                .unwrap();
            assert_eq!(text(b_rx.recv().await), raw);
        }
    }

    #[tokio::test]
    async fn join_returns_snapshot_to_sender_only() {
        let f = fixture(&[]);
        let (a, mut a_rx) = connect(&f, "r1", 8).await;
        let (b, mut b_rx) = connect(&f, "r1", 8).await;

        f.dispatcher
            .dispatch(&a, &Envelope::decode(r#"{"type":"join"}"#).unwrap())
            .await
            .unwrap();

        let reply: serde_json::Value = serde_json::from_str(&text(a_rx.recv().await)).unwrap();
        assert_eq!(reply["type"], "room_state");
        let ids: Vec<&str> = reply["payload"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id.as_str()));
        assert!(ids.contains(&b.id.as_str()));
        assert!(b_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn unknown_type_is_reported_not_relayed() {
        let f = fixture(&[]);
        let (a, _a_rx) = connect(&f, "r1", 8).await;
        let (_b, mut b_rx) = connect(&f, "r1", 8).await;

        let err = f
            .dispatcher
            .dispatch(&a, &Envelope::decode(r#"{"type":"chat","payload":"hi"}"#).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownEnvelopeType(ref t) if t == "chat"));
        assert!(b_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn one_full_recipient_does_not_block_the_rest() {
        let f = fixture(&[]);
        let (a, _a_rx) = connect(&f, "r1", 8).await;
        let (_slow, _slow_rx) = connect(&f, "r1", 1).await;
        let (_fast, mut fast_rx) = connect(&f, "r1", 8).await;

        let raw = r#"{"type":"ice-candidate","payload":{}}"#;
        let env = Envelope::decode(raw).unwrap();
        f.dispatcher.dispatch(&a, &env).await.unwrap();
        let outcome = f.dispatcher.dispatch(&a, &env).await.unwrap();

        // Slow peer's single slot is taken by the first frame
        assert_eq!(outcome, DispatchOutcome { delivered: 1, failed: 1 });
        assert_eq!(text(fast_rx.recv().await), raw);
        assert_eq!(text(fast_rx.recv().await), raw);
        assert_eq!(f.metrics.snapshot().envelopes.dropped, 1);
    }

    #[tokio::test]
    async fn member_missing_from_hub_is_skipped() {
        let f = fixture(&[]);
        let (a, _a_rx) = connect(&f, "r1", 8).await;
        let (b, _b_rx) = connect(&f, "r1", 8).await;
        let (_c, mut c_rx) = connect(&f, "r1", 8).await;
        f.hub.unregister(&b.id).await;

        let raw = r#"{"type":"offer","payload":{}}"#;
        let outcome = f
            .dispatcher
            .dispatch(&a, &Envelope::decode(raw).unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome { delivered: 1, failed: 1 });
        assert_eq!(text(c_rx.recv().await), raw);
    }

    #[tokio::test]
    async fn configured_types_are_recorded() {
        let f = fixture(&["offer"]);
        let (a, _a_rx) = connect(&f, "r1", 8).await;

        for raw in [
            r#"{"type":"offer","payload":{"sdp":"x"}}"#,
            r#"{"type":"answer","payload":{"sdp":"y"}}"#,
        ] {
            f.dispatcher
                .dispatch(&a, &Envelope::decode(raw).unwrap())
                .await
                .unwrap();
        }

        let log = f.store.list_messages(&RoomId::from("r1")).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, r#"{"sdp":"x"}"#);
        assert_eq!(log[0].sender_id, a.id);
    }

    #[tokio::test]
    async fn noop_recorder_is_accepted() {
        let store = Arc::new(InMemoryRoomStore::seeded(["r1"], false));
        let registry = Arc::new(RoomRegistry::new(store));
        let hub = Arc::new(ConnectionHub::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            hub.clone(),
            Arc::new(NoopRecorder),
            ["offer".to_string()],
            Arc::new(ServerMetrics::new()),
        );
        let client = Client::connect(RoomId::from("r1"));
        registry.join(&client.room_id, client.clone()).await.unwrap();

        let outcome = dispatcher
            .dispatch(
                &client,
                &Envelope::decode(r#"{"type":"offer","payload":1}"#).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[tokio::test]
    async fn sender_outside_room_is_refused() {
        let f = fixture(&[]);
        let (_a, mut a_rx) = connect(&f, "r1", 8).await;
        let stranger = Client::connect(RoomId::from("r1"));

        let err = f
            .dispatcher
            .dispatch(
                &stranger,
                &Envelope::decode(r#"{"type":"offer","payload":{}}"#).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ClientNotConnected(ref id) if *id == stranger.id));
        assert!(a_rx.try_recv().is_none());
        assert_eq!(f.metrics.snapshot().envelopes.relayed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_during_concurrent_joins_never_echoes() {
        const LATE_JOINERS: usize = 50;
        let f = Arc::new(fixture(&[]));
        let room = RoomId::from("r1");
        let (a, mut a_rx) = connect(&f, "r1", 2048).await;
        let mut existing = Vec::new();
        for _ in 0..5 {
            existing.push(connect(&f, "r1", 2048).await);
        }

        let raw = r#"{"type":"offer","payload":{"sdp":"race"}}"#;
        let env = Envelope::decode(raw).unwrap();
        let mut counts = vec![f.registry.member_count(&room).await];
        f.dispatcher.dispatch(&a, &env).await.unwrap();
        let mut dispatched = 1;

        let start = Arc::new(Barrier::new(2));
        let joiner = {
            let f = f.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                let mut queues = Vec::new();
                for _ in 0..LATE_JOINERS {
                    queues.push(connect(&f, "r1", 2048).await);
                    tokio::task::yield_now().await;
                }
                queues
            })
        };

        start.wait().await;
        while !joiner.is_finished() && dispatched < 1000 {
            f.dispatcher.dispatch(&a, &env).await.unwrap();
            dispatched += 1;
            counts.push(f.registry.member_count(&room).await);
            tokio::task::yield_now().await;
        }
        let late = joiner.await.unwrap();
        f.dispatcher.dispatch(&a, &env).await.unwrap();
        dispatched += 1;
        counts.push(f.registry.member_count(&room).await);

        // The broadcasts really did overlap with the joins
        assert_eq!(counts[0], 6);
        assert_eq!(*counts.last().unwrap(), 6 + LATE_JOINERS);
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert!(counts.iter().any(|&c| c > 6 && c < 6 + LATE_JOINERS));

        assert!(a_rx.try_recv().is_none());
        for (_, mut rx) in existing {
            for _ in 0..dispatched {
                assert_eq!(text(rx.try_recv()), raw);
            }
            assert!(rx.try_recv().is_none());
        }
        for (_, mut rx) in late {
            let mut received = 0;
            while let Some(frame) = rx.try_recv() {
                assert_eq!(text(Some(frame)), raw);
                received += 1;
            }
            assert!((1..=dispatched).contains(&received));
        }
    }
}
