//! Signaling Protocol Types
//!
//! Every frame on the wire is a UTF-8 JSON object with a `type` string and an
//! optional, opaque `payload`.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

use crate::error::RelayError;
use crate::models::Client;

/// Envelope types understood by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Ask for the current room membership snapshot
    Join,
    /// SDP offer, relayed to the rest of the room
    Offer,
    /// SDP answer, relayed to the rest of the room
    Answer,
    /// ICE candidate, relayed to the rest of the room
    IceCandidate,
    /// Anything else
    Unknown(String),
}

impl EnvelopeKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "join" => EnvelopeKind::Join,
            "offer" => EnvelopeKind::Offer,
            "answer" => EnvelopeKind::Answer,
            "ice-candidate" => EnvelopeKind::IceCandidate,
            other => EnvelopeKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice-candidate",
            EnvelopeKind::Unknown(s) => s,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

/// A decoded inbound envelope. Keeps the original frame text so relayed
/// envelopes reach peers byte-for-byte.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    payload: Option<Box<RawValue>>,
    raw: String,
}

impl Envelope {
    /// Decode one text frame. Anything that is not a JSON object with a string
    /// `type` and at most a `payload` besides is malformed.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Ok(Self {
            kind: EnvelopeKind::parse(&wire.kind),
            payload: wire.payload,
            raw: text.to_string(),
        })
    }

    /// Payload JSON text, `null` when absent.
    pub fn payload_text(&self) -> &str {
        self.payload.as_deref().map(RawValue::get).unwrap_or("null")
    }

    /// The frame exactly as it was received.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Body of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Envelopes produced by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEnvelope {
    #[serde(rename = "room_state")]
    RoomState(Vec<Client>),
    #[serde(rename = "peer-joined")]
    PeerJoined(Client),
    #[serde(rename = "peer-left")]
    PeerLeft(Client),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEnvelope {
    pub fn error(err: &RelayError) -> Self {
        ServerEnvelope::Error(ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Transport(e.to_string()))
    }
}
