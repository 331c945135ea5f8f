//! Event types published by the fabric's event bus.
//!
//! Events are an observation stream only; no fabric operation depends on
//! whether anyone is listening.

use crate::agent::{AgentId, AgentState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random EventId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// An agent joined the registry.
    AgentRegistered { agent: AgentId, domain: String },
    /// An agent left the registry.
    AgentUnregistered { agent: AgentId },
    /// An agent moved between lifecycle states.
    Lifecycle {
        agent: AgentId,
        from: AgentState,
        to: AgentState,
    },
    /// A connection (and its channel) was established.
    Connected { a: AgentId, b: AgentId },
    /// A connection was torn down; `discarded` messages were still queued.
    Disconnected {
        a: AgentId,
        b: AgentId,
        discarded: usize,
    },
    /// The fabric was shut down.
    Shutdown { discarded: usize },
}

/// A single fabric event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl FabricEvent {
    /// Create an event stamped now.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Agents this event concerns. Empty for fabric-wide events.
    pub fn subjects(&self) -> Vec<&AgentId> {
        match &self.payload {
            EventPayload::AgentRegistered { agent, .. }
            | EventPayload::AgentUnregistered { agent }
            | EventPayload::Lifecycle { agent, .. } => vec![agent],
            EventPayload::Connected { a, b } | EventPayload::Disconnected { a, b, .. } => {
                vec![a, b]
            }
            EventPayload::Shutdown { .. } => Vec::new(),
        }
    }
}
