//! Meshwarden - resilience core for a sidecar mesh
//!
//! Discovers the registered sidecar topology, detects faults through
//! dead-letter traffic and health transitions, escalates them to a
//! remediation agent, and coordinates cross-sidecar workflows as
//! compensating sagas.

pub mod api;
pub mod config;
pub mod mesh;
pub mod pulse;
pub mod registry;
pub mod saga;
pub mod server;
pub mod storage;
pub mod worker;
