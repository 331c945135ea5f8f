//! Usage monitor: periodically refreshes the fabric's aggregate resource
//! usage and flags agents stuck in `error`.
//!
//! [`check_fabric`] does one pass and never spawns anything; callers that want
//! it on a timer use [`spawn_usage_monitor`], which stops when the fabric
//! shuts down.

use crate::fabric::Fabric;
use agentfabric_types::agent::{AgentId, AgentState};
use agentfabric_types::fabric::ResourceUsage;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one monitor pass.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageReport {
    pub usage: ResourceUsage,
    /// Agents currently in `error`, sorted by id.
    pub failed: Vec<AgentId>,
}

/// Refresh the aggregate and collect failed agents.
pub fn check_fabric(fabric: &Fabric) -> UsageReport {
    let usage = fabric.refresh_usage();
    let failed: Vec<AgentId> = fabric
        .snapshot()
        .agents
        .into_iter()
        .filter(|record| record.state == AgentState::Error)
        .map(|record| {
            warn!(
                agent = %record.id,
                error = record.last_error.as_deref().unwrap_or("unknown"),
                "Agent in error state"
            );
            record.id
        })
        .collect();

    debug!(
        cpu = usage.cpu,
        memory = usage.memory,
        connections = usage.connections,
        agents = usage.agents,
        failed = failed.len(),
        "Fabric usage refreshed"
    );
    UsageReport { usage, failed }
}

/// Run [`check_fabric`] every `usage_refresh_interval_ms` until shutdown.
pub fn spawn_usage_monitor(fabric: Arc<Fabric>) -> JoinHandle<()> {
    let period = fabric.config().usage_refresh_interval();
    let shutdown = fabric.shutdown_token();
    info!(interval_ms = period.as_millis() as u64, "Starting usage monitor");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Usage monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    check_fabric(&fabric);
                }
            }
        }
    })
}
