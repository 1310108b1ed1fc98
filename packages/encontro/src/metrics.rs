//! Server metrics for observability
//!
//! Provides runtime metrics for monitoring relay health and throughput.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently active signaling connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,
    /// Connections turned away because their room does not exist
    pub rejected_joins: AtomicU64,

    // Envelope metrics
    /// Envelopes received from clients
    pub envelopes_received: AtomicU64,
    /// Frames queued to recipients by room broadcasts
    pub frames_relayed: AtomicU64,
    /// Frames dropped because a recipient's queue was full
    pub frames_dropped: AtomicU64,
    /// Per-recipient delivery failures other than drops
    pub delivery_failures: AtomicU64,

    // Error metrics
    /// Unknown types, unsupported frames, malformed envelopes
    pub protocol_errors: AtomicU64,
    /// Read/write failures and stalled writers
    pub transport_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn join_rejected(&self) {
        self.rejected_joins.fetch_add(1, Ordering::Relaxed);
    }

    // Envelope tracking
    pub fn envelope_received(&self) {
        self.envelopes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_relayed(&self, count: u64) {
        self.frames_relayed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                rejected_joins: self.rejected_joins.load(Ordering::Relaxed),
            },
            envelopes: EnvelopeMetrics {
                received: self.envelopes_received.load(Ordering::Relaxed),
                relayed: self.frames_relayed.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                protocol: self.protocol_errors.load(Ordering::Relaxed),
                transport: self.transport_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of server metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub envelopes: EnvelopeMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub rejected_joins: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetrics {
    pub received: u64,
    pub relayed: u64,
    pub dropped: u64,
    pub delivery_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub protocol: u64,
    pub transport: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub rooms: RoomHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomHealth {
    /// Rooms known to the room store
    pub total: u64,
    /// Rooms with at least one connected member
    pub occupied: u64,
}

/// `/metrics` body: the counter snapshot plus live room occupancy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub rooms: Vec<RoomOccupancy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomOccupancy {
    pub room: String,
    pub members: usize,
}
