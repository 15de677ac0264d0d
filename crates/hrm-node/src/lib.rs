//! HRM Node - runs HRM controllers over a topology
//!
//! Two drivers feed the sans-IO [`hrm_hierarchy::HrmController`]:
//! - [`simulation::Simulation`], a single-threaded, virtual-clock driver
//!   whose link interleaving is fixed by a seed, used by scenario tests
//! - [`runtime::NodeRuntime`], one tokio task per node over in-memory
//!   channels with real timers
//!
//! Both are built from the same [`config::NodeConfig`] topology.

pub mod config;
pub mod runtime;
pub mod simulation;

pub use config::{LinkSpec, NodeConfig, NodeSpec};
pub use runtime::{NodeHandle, NodeRuntime, NodeSnapshot};
pub use simulation::Simulation;

use thiserror::Error;

/// Errors originating from the node drivers.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Node task stopped: {0}")]
    NodeStopped(String),

    #[error("Network error: {0}")]
    Network(#[from] hrm_network::NetworkError),
}
