//! Agent handles: identity, lifecycle state machine, counters and mailbox.
//!
//! An [`Agent`] only ever touches its own state. The fabric installs and
//! removes its channel [`Port`]s; the agent sends and receives through them
//! and never reaches into fabric state.

use crate::channel::{CancelScope, Channel, Endpoint, Queue, ReceiveMode, Sequencer};
use crate::event_bus::EventBus;
use agentfabric_types::agent::{AgentId, AgentRecord, AgentState, ResourceCounters};
use agentfabric_types::error::{FabricError, FabricResult};
use agentfabric_types::event::{EventPayload, FabricEvent};
use agentfabric_types::message::Envelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type returned by domain runtimes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a runtime is told about the agent it drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub id: AgentId,
    pub domain: String,
}

/// Domain-specific behavior run by the lifecycle state machine.
///
/// `initialize` runs during `activate()` and `release` during `deactivate()`.
/// Both report success or failure synchronously to the state machine; neither
/// is called with any fabric or agent lock held.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn initialize(&self, ctx: &AgentContext) -> Result<(), BoxError>;

    async fn release(&self, _ctx: &AgentContext) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Runtime that does nothing and always succeeds. The fabric's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRuntime;

#[async_trait]
impl AgentRuntime for NoopRuntime {
    async fn initialize(&self, _ctx: &AgentContext) -> Result<(), BoxError> {
        Ok(())
    }
}

/// An agent's view of one channel.
#[derive(Debug, Clone)]
pub(crate) struct Port {
    outbound: Arc<Queue>,
    inbound: Arc<Queue>,
}

#[derive(Debug)]
struct Lifecycle {
    state: AgentState,
    last_error: Option<String>,
}

/// Everything the fabric hands an agent at registration.
pub(crate) struct AgentParts {
    pub id: AgentId,
    pub domain: String,
    pub runtime: Arc<dyn AgentRuntime>,
    pub sequencer: Sequencer,
    pub send_timeout: Duration,
    pub shutdown: CancellationToken,
    pub events: Arc<EventBus>,
}

/// A registered agent.
pub struct Agent {
    id: AgentId,
    domain: String,
    registered_at: DateTime<Utc>,
    runtime: Arc<dyn AgentRuntime>,
    lifecycle: Mutex<Lifecycle>,
    resources: Mutex<ResourceCounters>,
    /// Installed ports keyed by peer id.
    ports: DashMap<AgentId, Port>,
    /// Rung by every inbound queue on arrival.
    bell: Arc<Notify>,
    sequencer: Sequencer,
    send_timeout: Duration,
    shutdown: CancellationToken,
    events: Arc<EventBus>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("state", &self.state())
            .field("ports", &self.ports.len())
            .finish()
    }
}

impl Agent {
    pub(crate) fn new(parts: AgentParts) -> Self {
        Self {
            id: parts.id,
            domain: parts.domain,
            registered_at: Utc::now(),
            runtime: parts.runtime,
            lifecycle: Mutex::new(Lifecycle {
                state: AgentState::Idle,
                last_error: None,
            }),
            resources: Mutex::new(ResourceCounters::default()),
            ports: DashMap::new(),
            bell: Arc::new(Notify::new()),
            sequencer: parts.sequencer,
            send_timeout: parts.send_timeout,
            shutdown: parts.shutdown,
            events: parts.events,
        }
    }

    /// This agent's id.
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Domain the agent was registered under.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// When the agent was registered.
    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.lock_lifecycle().state
    }

    /// Reason for the most recent failed transition, cleared on success.
    pub fn last_error(&self) -> Option<String> {
        self.lock_lifecycle().last_error.clone()
    }

    /// Copy of the agent's resource counters.
    pub fn resources(&self) -> ResourceCounters {
        *self.lock_resources()
    }

    /// Point-in-time record of this agent.
    pub fn record(&self) -> AgentRecord {
        let (state, last_error) = {
            let lifecycle = self.lock_lifecycle();
            (lifecycle.state, lifecycle.last_error.clone())
        };
        AgentRecord {
            id: self.id.clone(),
            domain: self.domain.clone(),
            state,
            resources: self.resources(),
            last_error,
            registered_at: self.registered_at,
        }
    }

    fn context(&self) -> AgentContext {
        AgentContext {
            id: self.id.clone(),
            domain: self.domain.clone(),
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_resources(&self) -> MutexGuard<'_, ResourceCounters> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────────

    /// Run the runtime's initialization and move to `active`.
    ///
    /// No-op when already active. On failure the agent moves to `error` and
    /// the fault is returned as `InitializationFailure`.
    pub async fn activate(&self) -> FabricResult<()> {
        if !self.begin(AgentState::Activating, AgentState::Active)? {
            return Ok(());
        }
        let guard = TransitionGuard::new(self, AgentState::Activating);
        info!(agent = %self.id, domain = %self.domain, "Activating agent");

        let outcome = self.runtime.initialize(&self.context()).await;
        guard.disarm();

        match outcome {
            Ok(()) => {
                self.finish(AgentState::Activating, AgentState::Active, None);
                info!(agent = %self.id, "Agent active");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(agent = %self.id, error = %reason, "Agent activation failed");
                self.finish(AgentState::Activating, AgentState::Error, Some(reason.clone()));
                Err(FabricError::InitializationFailure {
                    id: self.id.clone(),
                    reason,
                })
            }
        }
    }

    /// Run the runtime's release hook, drop every channel port and move to
    /// `inactive`.
    ///
    /// No-op when already inactive. Connections stay in the fabric's graph;
    /// only this agent's references to their channels are released.
    pub async fn deactivate(&self) -> FabricResult<()> {
        if !self.begin(AgentState::Deactivating, AgentState::Inactive)? {
            return Ok(());
        }
        let guard = TransitionGuard::new(self, AgentState::Deactivating);
        info!(agent = %self.id, "Deactivating agent");

        let outcome = self.runtime.release(&self.context()).await;
        guard.disarm();

        match outcome {
            Ok(()) => {
                // Cleared under the lifecycle lock `attach` checks.
                let released = {
                    let mut lifecycle = self.lock_lifecycle();
                    let released = self.ports.len();
                    self.ports.clear();
                    lifecycle.state = AgentState::Inactive;
                    lifecycle.last_error = None;
                    released
                };
                self.announce(AgentState::Deactivating, AgentState::Inactive);
                info!(agent = %self.id, released, "Agent inactive");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(agent = %self.id, error = %reason, "Agent deactivation failed");
                self.finish(AgentState::Deactivating, AgentState::Error, Some(reason.clone()));
                Err(FabricError::TeardownFailure {
                    id: self.id.clone(),
                    reason,
                })
            }
        }
    }

    /// Enter `transitional` unless already in `target`.
    ///
    /// Returns `Ok(false)` for the no-op case.
    fn begin(&self, transitional: AgentState, target: AgentState) -> FabricResult<bool> {
        let from = {
            let mut lifecycle = self.lock_lifecycle();
            let current = lifecycle.state;
            if current == target {
                return Ok(false);
            }
            if current.is_transitioning() {
                return Err(FabricError::TransitionInProgress {
                    id: self.id.clone(),
                    state: current,
                });
            }
            lifecycle.state = transitional;
            current
        };
        self.announce(from, transitional);
        Ok(true)
    }

    fn finish(&self, from: AgentState, to: AgentState, error: Option<String>) {
        {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.state = to;
            lifecycle.last_error = error;
        }
        self.announce(from, to);
    }

    fn announce(&self, from: AgentState, to: AgentState) {
        self.events.publish(FabricEvent::new(EventPayload::Lifecycle {
            agent: self.id.clone(),
            from,
            to,
        }));
    }

    // ─── Resources ─────────────────────────────────────────────────────────────

    /// Report this agent's own CPU and memory figures.
    pub fn record_usage(&self, cpu_usage: f64, memory_usage: f64) -> FabricResult<()> {
        for (name, value) in [("cpu_usage", cpu_usage), ("memory_usage", memory_usage)] {
            if !value.is_finite() || value < 0.0 {
                return Err(FabricError::InvalidInput(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        let mut resources = self.lock_resources();
        resources.cpu_usage = cpu_usage;
        resources.memory_usage = memory_usage;
        Ok(())
    }

    pub(crate) fn connection_opened(&self) {
        self.lock_resources().active_connections += 1;
    }

    pub(crate) fn connection_closed(&self) {
        let mut resources = self.lock_resources();
        resources.active_connections = resources.active_connections.saturating_sub(1);
    }

    pub(crate) fn reset_connections(&self) {
        self.lock_resources().active_connections = 0;
    }

    // ─── Ports ─────────────────────────────────────────────────────────────────

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint {
            id: self.id.clone(),
            bell: self.bell.clone(),
        }
    }

    /// Install this agent's port on `channel`.
    ///
    /// Returns `false` if the channel does not involve this agent, or if the
    /// agent is `inactive` or `deactivating` and so must hold no ports.
    pub(crate) fn attach(&self, channel: &Channel) -> bool {
        let key = channel.key();
        let peer = if key.low() == &self.id {
            key.high()
        } else if key.high() == &self.id {
            key.low()
        } else {
            return false;
        };
        let me = self.id.as_str();
        let (Some(outbound), Some(inbound)) =
            (channel.queue(me, peer.as_str()), channel.queue(peer.as_str(), me))
        else {
            return false;
        };

        let lifecycle = self.lock_lifecycle();
        if matches!(
            lifecycle.state,
            AgentState::Inactive | AgentState::Deactivating
        ) {
            debug!(agent = %self.id, peer = %peer, state = %lifecycle.state, "Port not installed");
            return false;
        }
        self.ports.insert(peer.clone(), Port { outbound, inbound });
        true
    }

    pub(crate) fn detach(&self, peer: &str) -> bool {
        self.ports.remove(peer).is_some()
    }

    pub(crate) fn clear_ports(&self) {
        self.ports.clear();
    }

    /// Whether a port to `peer` is installed.
    pub fn has_port(&self, peer: &str) -> bool {
        self.ports.contains_key(peer)
    }

    /// Peers this agent currently holds ports for, sorted.
    pub fn peers(&self) -> Vec<AgentId> {
        let mut peers: Vec<AgentId> = self.ports.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Messages waiting in this agent's inbound queues.
    pub fn pending(&self) -> usize {
        self.ports.iter().map(|e| e.value().inbound.len()).sum()
    }

    // ─── Messaging ─────────────────────────────────────────────────────────────

    /// Send `payload` to a connected peer.
    ///
    /// Waits for queue space up to the fabric's send timeout.
    pub async fn send(&self, to: &str, payload: impl Into<String>) -> FabricResult<()> {
        self.send_scoped(to, payload.into(), None).await
    }

    /// Like [`Agent::send`], abandoning the wait when `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        to: &str,
        payload: impl Into<String>,
        cancel: &CancellationToken,
    ) -> FabricResult<()> {
        self.send_scoped(to, payload.into(), Some(cancel)).await
    }

    async fn send_scoped(
        &self,
        to: &str,
        payload: String,
        caller: Option<&CancellationToken>,
    ) -> FabricResult<()> {
        let queue = self
            .ports
            .get(to)
            .map(|port| port.outbound.clone())
            .ok_or_else(|| FabricError::no_channel(self.id.as_str(), to))?;

        let scope = CancelScope {
            shutdown: &self.shutdown,
            caller,
        };
        let seq = queue
            .push(payload, &self.sequencer, self.send_timeout, scope)
            .await?;
        debug!(from = %self.id, to, seq, "Message sent");
        Ok(())
    }

    /// Dequeue the oldest pending message without waiting.
    pub fn try_receive(&self) -> Option<Envelope> {
        loop {
            let inbound: Vec<Arc<Queue>> = self
                .ports
                .iter()
                .map(|e| e.value().inbound.clone())
                .collect();
            let (_, queue) = inbound
                .iter()
                .filter_map(|q| q.head_seq().map(|seq| (seq, q)))
                .min_by_key(|(seq, _)| *seq)?;

            // A concurrent receiver may have taken the head; rescan if so.
            if let Some(envelope) = queue.pop() {
                debug!(agent = %self.id, from = %envelope.from, seq = envelope.seq, "Message received");
                return Some(envelope);
            }
        }
    }

    /// Receive the oldest pending message.
    ///
    /// `NonBlocking` returns `Ok(None)` when nothing is pending. `Blocking`
    /// waits for an arrival and fails with `Timeout` when none comes in time.
    pub async fn receive(&self, mode: ReceiveMode) -> FabricResult<Option<Envelope>> {
        self.receive_scoped(mode, None).await
    }

    /// Like [`Agent::receive`], abandoning the wait when `cancel` fires.
    pub async fn receive_with_cancel(
        &self,
        mode: ReceiveMode,
        cancel: &CancellationToken,
    ) -> FabricResult<Option<Envelope>> {
        self.receive_scoped(mode, Some(cancel)).await
    }

    async fn receive_scoped(
        &self,
        mode: ReceiveMode,
        caller: Option<&CancellationToken>,
    ) -> FabricResult<Option<Envelope>> {
        let timeout = match mode {
            ReceiveMode::NonBlocking => return Ok(self.try_receive()),
            ReceiveMode::Blocking { timeout } => timeout,
        };
        let scope = CancelScope {
            shutdown: &self.shutdown,
            caller,
        };
        let deadline = Instant::now() + timeout;

        loop {
            let arrival = self.bell.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if scope.is_cancelled() {
                return Err(FabricError::Cancelled {
                    operation: "receive",
                });
            }
            if let Some(envelope) = self.try_receive() {
                return Ok(Some(envelope));
            }

            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(FabricError::Timeout {
                        operation: "receive",
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
                _ = scope.cancelled() => {
                    return Err(FabricError::Cancelled { operation: "receive" });
                }
            }
        }
    }
}

/// Moves an agent stuck mid-transition to `error` if the transition future is
/// dropped before the runtime hook returns.
struct TransitionGuard<'a> {
    agent: &'a Agent,
    transitional: AgentState,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(agent: &'a Agent, transitional: AgentState) -> Self {
        Self {
            agent,
            transitional,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let interrupted = {
            let mut lifecycle = self.agent.lock_lifecycle();
            if lifecycle.state == self.transitional {
                lifecycle.state = AgentState::Error;
                lifecycle.last_error = Some(format!("{} interrupted", self.transitional));
                true
            } else {
                false
            }
        };
        if interrupted {
            warn!(agent = %self.agent.id, state = %self.transitional, "Lifecycle transition interrupted");
            self.agent.announce(self.transitional, AgentState::Error);
        }
    }
}
