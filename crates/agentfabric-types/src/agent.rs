//! Agent identity, lifecycle states and resource counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Unique identifier of a registered agent.
///
/// Borrows as `str`, so registry maps keyed by `AgentId` can be queried with
/// plain string slices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Wrap a string as an agent id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle state of an agent.
///
/// ```text
/// idle -> activating -> active -> deactivating -> inactive
///   any state -> error (on a failed transition; retryable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Registered, never activated.
    Idle,
    /// Runtime initialization in flight.
    Activating,
    /// Runtime initialized successfully.
    Active,
    /// Runtime release in flight.
    Deactivating,
    /// Deactivated; channel ports released.
    Inactive,
    /// The last transition failed. Not terminal.
    Error,
}

impl AgentState {
    /// Whether a transition is currently in flight.
    pub fn is_transitioning(self) -> bool {
        matches!(self, AgentState::Activating | AgentState::Deactivating)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Activating => write!(f, "activating"),
            AgentState::Active => write!(f, "active"),
            AgentState::Deactivating => write!(f, "deactivating"),
            AgentState::Inactive => write!(f, "inactive"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

/// Per-agent resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCounters {
    /// Self-reported CPU usage (>= 0).
    pub cpu_usage: f64,
    /// Self-reported memory usage (>= 0).
    pub memory_usage: f64,
    /// Degree of the agent in the connection graph.
    pub active_connections: u32,
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    /// Domain the agent operates in (e.g. "nlp", "vision").
    pub domain: String,
    pub state: AgentState,
    pub resources: ResourceCounters,
    /// Reason for the most recent failed transition, if the agent is in `error`.
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
}
