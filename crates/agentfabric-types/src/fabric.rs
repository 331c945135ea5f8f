//! Fabric-level status, usage and snapshot types.

use crate::agent::{AgentId, AgentRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a fabric instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FabricStatus {
    /// Shut down; mutating operations are refused.
    Offline,
    /// Accepting operations, no agent in `error`.
    Online,
    /// Accepting operations, at least one agent in `error`.
    Degraded,
}

impl std::fmt::Display for FabricStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FabricStatus::Offline => write!(f, "offline"),
            FabricStatus::Online => write!(f, "online"),
            FabricStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Aggregate of every agent's counters. Derived, never authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    /// Sum of `active_connections` across agents (twice the edge count).
    pub connections: u64,
    pub agents: usize,
    /// When the aggregate was last computed.
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnection {
    pub a: AgentId,
    pub b: AgentId,
    /// Messages still queued in either direction, discarded with the channel.
    pub discarded: usize,
}

/// Point-in-time view of the whole fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricSnapshot {
    pub status: FabricStatus,
    /// Agent records, sorted by id.
    pub agents: Vec<AgentRecord>,
    /// Each undirected edge once, smaller id first, sorted.
    pub connections: Vec<(AgentId, AgentId)>,
    pub channels: usize,
    /// Messages queued across all channels.
    pub pending_messages: usize,
    pub resource_usage: ResourceUsage,
    pub taken_at: DateTime<Utc>,
}

impl FabricSnapshot {
    /// Look up one agent's record.
    pub fn agent(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|record| record.id.as_str() == id)
    }
}
