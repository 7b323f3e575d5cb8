//! Fleet events for external consumers.
//!
//! Events are fire-and-forget: the core publishes them through an
//! [`EventSink`] and never depends on delivery.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject for confirmed-ASIC discovery events.
pub const SUBJECT_DEVICE_DISCOVERED: &str = "network.device_discovered";
/// Subject for reachability observations.
pub const SUBJECT_NETWORK_OBSERVED: &str = "network.observed";

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub shard_id: String,
    pub payload: EventPayload,
}

impl FleetEvent {
    pub fn new(shard_id: &str, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            shard_id: shard_id.to_string(),
            payload,
        }
    }

    pub fn subject(&self) -> &'static str {
        match self.payload {
            EventPayload::DeviceDiscovered { .. } => SUBJECT_DEVICE_DISCOVERED,
            EventPayload::NetworkObserved { .. } => SUBJECT_NETWORK_OBSERVED,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A host was confirmed to be a mining device.
    DeviceDiscovered {
        ip: Ipv4Addr,
        mac: String,
        source: String,
        labels: BTreeMap<String, String>,
    },
    /// Reachability facts for a host.
    NetworkObserved {
        ip: Ipv4Addr,
        mac: String,
        online: bool,
        source: String,
        facts: BTreeMap<String, String>,
    },
}

/// Destination for fleet events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: FleetEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: FleetEvent) {}
}

/// Sink that writes events to the log as structured records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: FleetEvent) {
        match serde_json::to_string(&event.payload) {
            Ok(body) => tracing::info!(
                event_id = %event.id.0,
                subject = event.subject(),
                shard_id = %event.shard_id,
                payload = %body,
                "Fleet event"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to encode fleet event"),
        }
    }
}
