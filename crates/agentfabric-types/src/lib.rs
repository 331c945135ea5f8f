//! Core types for the AgentFabric communication fabric.
//!
//! This crate defines the shared data structures used by the fabric kernel and
//! by anything that observes it: agent identities and lifecycle states,
//! message envelopes, fabric events, configuration and the closed error set.
//! It contains no business logic.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod fabric;
pub mod message;
