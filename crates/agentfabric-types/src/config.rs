//! Fabric configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level fabric configuration, usually loaded from
/// `~/.agentfabric/config.toml`. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
    /// Capacity of each directed queue of a channel.
    pub channel_capacity: usize,
    /// How long a send waits on a full queue before failing with `Timeout`.
    pub send_timeout_ms: u64,
    /// Default wait used by blocking receives.
    pub receive_timeout_ms: u64,
    /// Interval of the background usage monitor.
    pub usage_refresh_interval_ms: u64,
    /// Number of events retained by the event bus history.
    pub event_history: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            channel_capacity: 64,
            send_timeout_ms: 5_000,
            receive_timeout_ms: 5_000,
            usage_refresh_interval_ms: 10_000,
            event_history: 1_000,
        }
    }
}

impl FabricConfig {
    /// How long a send waits for queue space.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Default bound on a blocking receive.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn usage_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.usage_refresh_interval_ms)
    }

    /// Replace values that would make the fabric unusable with their defaults.
    ///
    /// Returns the names of the fields that were reset.
    pub fn sanitize(&mut self) -> Vec<&'static str> {
        let defaults = Self::default();
        let mut reset = Vec::new();
        if self.channel_capacity == 0 {
            self.channel_capacity = defaults.channel_capacity;
            reset.push("channel_capacity");
        }
        if self.usage_refresh_interval_ms == 0 {
            self.usage_refresh_interval_ms = defaults.usage_refresh_interval_ms;
            reset.push("usage_refresh_interval_ms");
        }
        if self.event_history == 0 {
            self.event_history = defaults.event_history;
            reset.push("event_history");
        }
        reset
    }
}
