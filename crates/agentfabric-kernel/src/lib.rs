//! AgentFabric kernel: registry, connection graph, channels and relay for a
//! network of domain agents.
//!
//! A [`Fabric`] owns every registered [`Agent`], the undirected
//! [`ConnectionGraph`] between them and one bounded, bidirectional
//! [`Channel`] per connection. Messages only travel between directly
//! connected agents, either through [`Fabric::relay`] or an agent's own
//! [`Agent::send`] / [`Agent::receive`].
//!
//! ```no_run
//! # async fn demo() -> agentfabric_types::error::FabricResult<()> {
//! use agentfabric_kernel::{Fabric, ReceiveMode};
//!
//! let fabric = Fabric::default();
//! fabric.register("nlp-1", "nlp")?;
//! let vision = fabric.register("vision-1", "vision")?;
//! fabric.connect("nlp-1", "vision-1")?;
//! fabric.relay("nlp-1", "vision-1", "caption this").await?;
//! let msg = vision.receive(ReceiveMode::NonBlocking).await?;
//! assert_eq!(msg.map(|m| m.payload).as_deref(), Some("caption this"));
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod channel;
pub mod config;
pub mod event_bus;
pub mod fabric;
pub mod graph;
pub mod monitor;
pub mod telemetry;

pub use agent::{Agent, AgentContext, AgentRuntime, BoxError, NoopRuntime};
pub use channel::{Channel, ChannelKey, Queue, ReceiveMode};
pub use event_bus::EventBus;
pub use fabric::Fabric;
pub use graph::{ConnectionGraph, Neighbors};
pub use monitor::{check_fabric, spawn_usage_monitor, UsageReport};
