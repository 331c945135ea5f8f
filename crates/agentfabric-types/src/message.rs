//! Message envelopes carried by fabric channels.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single relayed message.
///
/// `seq` is drawn from a fabric-wide counter at the moment the envelope is
/// enqueued, so within one direction of one channel sequence numbers are
/// strictly increasing in delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub from: AgentId,
    pub to: AgentId,
    pub payload: String,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(seq: u64, from: AgentId, to: AgentId, payload: impl Into<String>) -> Self {
        Self {
            seq,
            from,
            to,
            payload: payload.into(),
            sent_at: Utc::now(),
        }
    }
}
