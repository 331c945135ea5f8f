//! The fabric: agent registry, connection graph and channel table behind one
//! lock, plus single-hop message relay.
//!
//! Every structural mutation (register, unregister, connect, disconnect,
//! shutdown) runs as one critical section over [`FabricState`], so observers
//! never see an edge without its channel or a counter out of step with the
//! graph. Lock order is fabric state, then an agent's own mutexes. No lock is
//! held across an `.await`: blocking relays clone the queue handle and wait on
//! it after the guard is gone.

use crate::agent::{Agent, AgentParts, AgentRuntime, NoopRuntime};
use crate::channel::{CancelScope, Channel, ChannelKey, ReceiveMode, Sequencer};
use crate::event_bus::EventBus;
use crate::graph::{ConnectionGraph, Neighbors};
use agentfabric_types::agent::{AgentId, AgentRecord, AgentState};
use agentfabric_types::config::FabricConfig;
use agentfabric_types::error::{FabricError, FabricResult};
use agentfabric_types::event::{EventPayload, FabricEvent};
use agentfabric_types::fabric::{Disconnection, FabricSnapshot, FabricStatus, ResourceUsage};
use agentfabric_types::message::Envelope;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct FabricState {
    online: bool,
    registry: HashMap<AgentId, Arc<Agent>>,
    graph: ConnectionGraph,
    /// One channel per graph edge, keyed order-independently.
    channels: HashMap<ChannelKey, Arc<Channel>>,
    /// Last computed aggregate; see [`Fabric::refresh_usage`].
    resource_usage: ResourceUsage,
}

impl FabricState {
    fn ensure_online(&self) -> FabricResult<()> {
        if self.online {
            Ok(())
        } else {
            Err(FabricError::Offline)
        }
    }

    fn agent(&self, id: &str) -> FabricResult<&Arc<Agent>> {
        self.registry
            .get(id)
            .ok_or_else(|| FabricError::missing(id))
    }

    fn status(&self) -> FabricStatus {
        if !self.online {
            FabricStatus::Offline
        } else if self
            .registry
            .values()
            .any(|agent| agent.state() == AgentState::Error)
        {
            FabricStatus::Degraded
        } else {
            FabricStatus::Online
        }
    }
}

/// A running fabric instance.
pub struct Fabric {
    config: FabricConfig,
    state: Mutex<FabricState>,
    events: Arc<EventBus>,
    sequencer: Sequencer,
    /// Cancelled by [`Fabric::shutdown`]; every blocking wait listens to it.
    shutdown: CancellationToken,
    default_runtime: Arc<dyn AgentRuntime>,
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new(FabricConfig::default())
    }
}

impl Fabric {
    /// Start a fabric whose agents use [`NoopRuntime`] unless registered with
    /// their own.
    pub fn new(config: FabricConfig) -> Self {
        Self::with_runtime(config, Arc::new(NoopRuntime))
    }

    /// Start a fabric with a default runtime for every registered agent.
    pub fn with_runtime(mut config: FabricConfig, runtime: Arc<dyn AgentRuntime>) -> Self {
        for field in config.sanitize() {
            warn!(field, "Invalid fabric config value replaced with default");
        }
        let events = Arc::new(EventBus::new(config.event_history));
        info!(
            channel_capacity = config.channel_capacity,
            send_timeout_ms = config.send_timeout_ms,
            "Fabric online"
        );
        Self {
            state: Mutex::new(FabricState {
                online: true,
                registry: HashMap::new(),
                graph: ConnectionGraph::new(),
                channels: HashMap::new(),
                resource_usage: ResourceUsage::default(),
            }),
            events,
            sequencer: Sequencer::new(),
            shutdown: CancellationToken::new(),
            default_runtime: runtime,
            config,
        }
    }

    /// The sanitized configuration this fabric runs with.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// The fabric's event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Subscribe to every fabric event.
    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.events.subscribe()
    }

    /// Subscribe to events concerning one registered agent.
    pub fn subscribe_agent(&self, id: &str) -> FabricResult<broadcast::Receiver<FabricEvent>> {
        let agent = self.agent(id)?;
        Ok(self.events.subscribe_agent(agent.id()))
    }

    /// Token cancelled when the fabric shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Registry ──────────────────────────────────────────────────────────────

    /// Register a new agent in `idle` state with the fabric's default runtime.
    pub fn register(&self, id: &str, domain: &str) -> FabricResult<Arc<Agent>> {
        self.register_with_runtime(id, domain, self.default_runtime.clone())
    }

    /// Register a new agent driven by `runtime`.
    pub fn register_with_runtime(
        &self,
        id: &str,
        domain: &str,
        runtime: Arc<dyn AgentRuntime>,
    ) -> FabricResult<Arc<Agent>> {
        if id.trim().is_empty() {
            return Err(FabricError::InvalidInput(
                "agent id must not be empty".to_string(),
            ));
        }

        let agent = {
            let mut state = self.lock_state();
            state.ensure_online()?;
            if state.registry.contains_key(id) {
                return Err(FabricError::Duplicate(AgentId::from(id)));
            }
            let agent = Arc::new(Agent::new(AgentParts {
                id: AgentId::from(id),
                domain: domain.to_string(),
                runtime,
                sequencer: self.sequencer.clone(),
                send_timeout: self.config.send_timeout(),
                shutdown: self.shutdown.clone(),
                events: self.events.clone(),
            }));
            state.graph.add_node(agent.id().clone());
            state.registry.insert(agent.id().clone(), agent.clone());
            agent
        };

        info!(agent = %id, domain, "Registered agent");
        self.events
            .publish(FabricEvent::new(EventPayload::AgentRegistered {
                agent: agent.id().clone(),
                domain: domain.to_string(),
            }));
        Ok(agent)
    }

    /// Remove an agent with no connections. Returns its final record.
    pub fn unregister(&self, id: &str) -> FabricResult<AgentRecord> {
        let agent = {
            let mut state = self.lock_state();
            state.ensure_online()?;
            let agent = state.agent(id)?.clone();
            state.graph.remove_node(id)?;
            state.registry.remove(id);
            agent
        };
        agent.clear_ports();

        info!(agent = %id, "Unregistered agent");
        self.events
            .publish(FabricEvent::new(EventPayload::AgentUnregistered {
                agent: agent.id().clone(),
            }));
        self.events.unsubscribe_agent(id);
        Ok(agent.record())
    }

    /// Look up a registered agent.
    pub fn agent(&self, id: &str) -> FabricResult<Arc<Agent>> {
        self.lock_state().agent(id).cloned()
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.lock_state().registry.len()
    }

    // ─── Connections ───────────────────────────────────────────────────────────

    /// Connect two registered agents and open their channel.
    pub fn connect(&self, a: &str, b: &str) -> FabricResult<()> {
        let (a_id, b_id) = {
            let mut state = self.lock_state();
            state.ensure_online()?;
            let agent_a = state.agent(a)?.clone();
            let agent_b = state.agent(b)?.clone();
            state.graph.add_edge(a, b)?;

            let channel = Arc::new(Channel::open(
                agent_a.endpoint(),
                agent_b.endpoint(),
                self.config.channel_capacity,
            ));
            agent_a.attach(&channel);
            agent_b.attach(&channel);
            agent_a.connection_opened();
            agent_b.connection_opened();
            state.channels.insert(channel.key().clone(), channel);
            (agent_a.id().clone(), agent_b.id().clone())
        };

        info!(a = %a_id, b = %b_id, "Agents connected");
        self.events
            .publish(FabricEvent::new(EventPayload::Connected { a: a_id, b: b_id }));
        Ok(())
    }

    /// Remove the connection between two agents, closing its channel.
    ///
    /// Messages still queued in either direction are discarded and counted.
    /// Senders blocked on the channel wake with `NoChannel`.
    pub fn disconnect(&self, a: &str, b: &str) -> FabricResult<Disconnection> {
        let report = {
            let mut state = self.lock_state();
            state.ensure_online()?;
            let agent_a = state.agent(a)?.clone();
            let agent_b = state.agent(b)?.clone();
            state.graph.remove_edge(a, b)?;

            let discarded = state
                .channels
                .remove(&ChannelKey::new(a, b))
                .map(|channel| channel.close())
                .unwrap_or(0);
            agent_a.detach(b);
            agent_b.detach(a);
            agent_a.connection_closed();
            agent_b.connection_closed();
            Disconnection {
                a: agent_a.id().clone(),
                b: agent_b.id().clone(),
                discarded,
            }
        };

        if report.discarded > 0 {
            warn!(a = %report.a, b = %report.b, discarded = report.discarded, "Disconnected with undelivered messages");
        } else {
            info!(a = %report.a, b = %report.b, "Agents disconnected");
        }
        self.events
            .publish(FabricEvent::new(EventPayload::Disconnected {
                a: report.a.clone(),
                b: report.b.clone(),
                discarded: report.discarded,
            }));
        Ok(report)
    }

    /// Whether `a` and `b` are directly connected.
    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        self.lock_state().graph.contains_edge(a, b)
    }

    /// Snapshot of an agent's direct neighbors.
    pub fn neighbors(&self, id: &str) -> FabricResult<Neighbors> {
        self.lock_state().graph.neighbors(id)
    }

    /// Every connection once, smaller id first, sorted.
    pub fn connections(&self) -> Vec<(AgentId, AgentId)> {
        self.lock_state().graph.edges()
    }

    // ─── Relay ─────────────────────────────────────────────────────────────────

    /// Deliver `payload` from one agent to a directly connected agent.
    ///
    /// Only single hops are relayed; agents that merely share a neighbor are
    /// `NotConnected`. Waits for queue space up to the configured send
    /// timeout. Relays are accepted regardless of either agent's lifecycle
    /// state.
    pub async fn relay(&self, from: &str, to: &str, payload: impl Into<String>) -> FabricResult<()> {
        self.relay_scoped(from, to, payload.into(), None).await
    }

    /// Like [`Fabric::relay`], abandoning the wait when `cancel` fires.
    pub async fn relay_with_cancel(
        &self,
        from: &str,
        to: &str,
        payload: impl Into<String>,
        cancel: &CancellationToken,
    ) -> FabricResult<()> {
        self.relay_scoped(from, to, payload.into(), Some(cancel))
            .await
    }

    async fn relay_scoped(
        &self,
        from: &str,
        to: &str,
        payload: String,
        caller: Option<&CancellationToken>,
    ) -> FabricResult<()> {
        let queue = {
            let state = self.lock_state();
            state.ensure_online()?;
            state.agent(from)?;
            state.agent(to)?;
            if !state.graph.contains_edge(from, to) {
                return Err(FabricError::not_connected(from, to));
            }
            state
                .channels
                .get(&ChannelKey::new(from, to))
                .and_then(|channel| channel.queue(from, to))
                .ok_or_else(|| FabricError::no_channel(from, to))?
        };

        let scope = CancelScope {
            shutdown: &self.shutdown,
            caller,
        };
        let seq = queue
            .push(payload, &self.sequencer, self.config.send_timeout(), scope)
            .await?;
        debug!(from, to, seq, "Relayed message");
        Ok(())
    }

    /// Receive the oldest message pending for agent `id`.
    pub async fn receive(&self, id: &str, mode: ReceiveMode) -> FabricResult<Option<Envelope>> {
        let agent = self.agent(id)?;
        agent.receive(mode).await
    }

    /// Blocking mode bounded by the configured receive timeout.
    pub fn blocking_receive_mode(&self) -> ReceiveMode {
        ReceiveMode::Blocking {
            timeout: self.config.receive_timeout(),
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────────

    /// Activate an agent and install ports for all of its current connections.
    pub async fn activate(&self, id: &str) -> FabricResult<()> {
        let agent = self.live_agent(id)?;
        agent.activate().await?;

        let state = self.lock_state();
        // The agent may have been unregistered while its runtime initialized.
        let current = state
            .registry
            .get(id)
            .is_some_and(|registered| Arc::ptr_eq(registered, &agent));
        if current {
            if let Ok(neighbors) = state.graph.neighbors(id) {
                for peer in &neighbors {
                    if agent.has_port(peer.as_str()) {
                        continue;
                    }
                    // Refused if a deactivation finished in the meantime.
                    if let Some(channel) = state.channels.get(&ChannelKey::new(id, peer.as_str())) {
                        agent.attach(channel);
                    }
                }
            }
        }
        Ok(())
    }

    /// Deactivate an agent. Its connections stay in place.
    pub async fn deactivate(&self, id: &str) -> FabricResult<()> {
        let agent = self.live_agent(id)?;
        agent.deactivate().await
    }

    fn live_agent(&self, id: &str) -> FabricResult<Arc<Agent>> {
        let state = self.lock_state();
        state.ensure_online()?;
        state.agent(id).cloned()
    }

    // ─── Observation ───────────────────────────────────────────────────────────

    /// Recompute the aggregate resource usage from every agent's counters.
    pub fn refresh_usage(&self) -> ResourceUsage {
        let mut state = self.lock_state();
        let mut usage = state
            .registry
            .values()
            .fold(ResourceUsage::default(), |mut acc, agent| {
                let counters = agent.resources();
                acc.cpu += counters.cpu_usage;
                acc.memory += counters.memory_usage;
                acc.connections += u64::from(counters.active_connections);
                acc.agents += 1;
                acc
            });
        usage.refreshed_at = Some(Utc::now());
        state.resource_usage = usage;
        usage
    }

    /// The aggregate computed by the last [`Fabric::refresh_usage`].
    pub fn resource_usage(&self) -> ResourceUsage {
        self.lock_state().resource_usage
    }

    /// Current health: `offline`, `degraded` or `online`.
    pub fn status(&self) -> FabricStatus {
        self.lock_state().status()
    }

    /// Whether [`Fabric::shutdown`] has not yet run.
    pub fn is_online(&self) -> bool {
        self.lock_state().online
    }

    /// Consistent point-in-time view of the whole fabric.
    pub fn snapshot(&self) -> FabricSnapshot {
        let state = self.lock_state();
        let mut agents: Vec<AgentRecord> =
            state.registry.values().map(|agent| agent.record()).collect();
        agents.sort_by(|x, y| x.id.cmp(&y.id));
        FabricSnapshot {
            status: state.status(),
            agents,
            connections: state.graph.edges(),
            channels: state.channels.len(),
            pending_messages: state.channels.values().map(|c| c.pending()).sum(),
            resource_usage: state.resource_usage,
            taken_at: Utc::now(),
        }
    }

    // ─── Shutdown ──────────────────────────────────────────────────────────────

    /// Take the fabric offline.
    ///
    /// Closes every channel, drops every connection and cancels every blocked
    /// send and receive. Agents stay registered for inspection, but all
    /// mutating operations fail with `Offline` from here on. Returns the
    /// number of undelivered messages discarded. Idempotent.
    pub fn shutdown(&self) -> usize {
        let discarded = {
            let mut state = self.lock_state();
            if !state.online {
                return 0;
            }
            state.online = false;
            let discarded: usize = state
                .channels
                .drain()
                .map(|(_, channel)| channel.close())
                .sum();
            state.graph.clear_edges();
            for agent in state.registry.values() {
                agent.clear_ports();
                agent.reset_connections();
            }
            discarded
        };
        self.shutdown.cancel();

        info!(discarded, "Fabric shut down");
        self.events
            .publish(FabricEvent::new(EventPayload::Shutdown { discarded }));
        discarded
    }
}
