//! The closed set of failures the fabric reports.

use crate::agent::{AgentId, AgentState};
use thiserror::Error;

/// Every failure a fabric operation can return.
///
/// All variants are local to one call: the fabric's invariants hold after any
/// of them is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FabricError {
    /// An agent with this id is already registered.
    #[error("Agent already registered: {0}")]
    Duplicate(AgentId),

    /// The referenced agent is not registered.
    #[error("Agent not found: {0}")]
    NotFound(AgentId),

    /// The two agents already share a connection.
    #[error("Agents already connected: {a} <-> {b}")]
    AlreadyConnected { a: AgentId, b: AgentId },

    /// The two agents share no direct connection.
    #[error("Agents not connected: {a} <-> {b}")]
    NotConnected { a: AgentId, b: AgentId },

    /// The agent still has connections and cannot be unregistered.
    #[error("Agent {id} still has {count} active connection(s)")]
    HasConnections { id: AgentId, count: u32 },

    /// No channel is installed for this direction.
    #[error("No channel from {from} to {to}")]
    NoChannel { from: AgentId, to: AgentId },

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {waited_ms}ms")]
    Timeout {
        operation: &'static str,
        waited_ms: u64,
    },

    /// A lifecycle transition is already in flight for this agent.
    #[error("Agent {id} is already {state}")]
    TransitionInProgress { id: AgentId, state: AgentState },

    /// The agent's runtime failed to initialize.
    #[error("Initialization of agent {id} failed: {reason}")]
    InitializationFailure { id: AgentId, reason: String },

    /// The agent's runtime failed to release its resources.
    #[error("Teardown of agent {id} failed: {reason}")]
    TeardownFailure { id: AgentId, reason: String },

    /// An agent cannot be connected to itself.
    #[error("Agent {0} cannot connect to itself")]
    SelfConnection(AgentId),

    /// A blocking operation was cancelled before it completed.
    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    /// The fabric has been shut down.
    #[error("Fabric is offline")]
    Offline,

    /// Malformed caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Field-less discriminant of [`FabricError`], for branching on failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Duplicate,
    NotFound,
    AlreadyConnected,
    NotConnected,
    HasConnections,
    NoChannel,
    Timeout,
    TransitionInProgress,
    InitializationFailure,
    TeardownFailure,
    SelfConnection,
    Cancelled,
    Offline,
    InvalidInput,
}

impl FabricError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FabricError::Duplicate(_) => ErrorKind::Duplicate,
            FabricError::NotFound(_) => ErrorKind::NotFound,
            FabricError::AlreadyConnected { .. } => ErrorKind::AlreadyConnected,
            FabricError::NotConnected { .. } => ErrorKind::NotConnected,
            FabricError::HasConnections { .. } => ErrorKind::HasConnections,
            FabricError::NoChannel { .. } => ErrorKind::NoChannel,
            FabricError::Timeout { .. } => ErrorKind::Timeout,
            FabricError::TransitionInProgress { .. } => ErrorKind::TransitionInProgress,
            FabricError::InitializationFailure { .. } => ErrorKind::InitializationFailure,
            FabricError::TeardownFailure { .. } => ErrorKind::TeardownFailure,
            FabricError::SelfConnection(_) => ErrorKind::SelfConnection,
            FabricError::Cancelled { .. } => ErrorKind::Cancelled,
            FabricError::Offline => ErrorKind::Offline,
            FabricError::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }

    /// Shorthand for [`FabricError::NotFound`] from a string id.
    pub fn missing(id: &str) -> Self {
        FabricError::NotFound(AgentId::from(id))
    }

    /// Shorthand for [`FabricError::NotConnected`] from string ids.
    pub fn not_connected(a: &str, b: &str) -> Self {
        FabricError::NotConnected {
            a: AgentId::from(a),
            b: AgentId::from(b),
        }
    }

    /// Shorthand for [`FabricError::NoChannel`] from string ids.
    pub fn no_channel(from: &str, to: &str) -> Self {
        FabricError::NoChannel {
            from: AgentId::from(from),
            to: AgentId::from(to),
        }
    }
}

/// Alias for Result with FabricError.
pub type FabricResult<T> = Result<T, FabricError>;
