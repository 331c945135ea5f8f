//! Event bus: fan-out of fabric events with a bounded history ring buffer.

use agentfabric_types::agent::AgentId;
use agentfabric_types::event::FabricEvent;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the fabric-wide broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Capacity of each per-agent broadcast channel.
const AGENT_CHANNEL_CAPACITY: usize = 256;

/// Publishes fabric events to subscribers and keeps recent history.
///
/// Publishing never blocks and never fails: lagging or absent subscribers
/// only lose their own copy.
pub struct EventBus {
    sender: broadcast::Sender<FabricEvent>,
    /// Subscriptions scoped to events concerning one agent.
    agent_channels: DashMap<AgentId, broadcast::Sender<FabricEvent>>,
    history: Mutex<VecDeque<FabricEvent>>,
    history_size: usize,
}

impl EventBus {
    /// Create an event bus keeping the newest `history_size` events.
    pub fn new(history_size: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let history_size = history_size.max(1);
        Self {
            sender,
            agent_channels: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_size.min(1024))),
            history_size,
        }
    }

    /// Record an event and fan it out to global and per-agent subscribers.
    pub fn publish(&self, event: FabricEvent) {
        debug!(event_id = %event.id, payload = ?event.payload, "Publishing fabric event");

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        for subject in event.subjects() {
            if let Some(sender) = self.agent_channels.get(subject.as_str()) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events that concern one agent.
    pub fn subscribe_agent(&self, agent: &AgentId) -> broadcast::Receiver<FabricEvent> {
        self.agent_channels
            .entry(agent.clone())
            .or_insert_with(|| broadcast::channel(AGENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop an agent's subscription channel once it leaves the fabric.
    pub fn unsubscribe_agent(&self, agent: &str) {
        self.agent_channels.remove(agent);
    }

    /// Most recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<FabricEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }
}
