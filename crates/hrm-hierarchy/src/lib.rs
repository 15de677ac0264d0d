//! HRM Hierarchy - clustering, elections and forwarding-table synthesis
//!
//! Implements the hierarchical organization of routing nodes:
//! - the RoutableClusterGraph of local and remote clusters
//! - per-cluster Bully elections with deterministic tie-breaking
//! - coordinator liveness monitoring and re-election
//! - neighbor cluster gossip, discovery and rejection handling
//! - coordinator address assignment and TopologyData (FIB) construction
//!
//! Everything is driven through [`HrmController`], a sans-IO state machine:
//! frames and timer events go in, frames and timer requests come out.

pub mod cluster;
pub mod controller;
pub mod coordinator;
pub mod discovery;
pub mod elections;
pub mod graph;
pub mod liveness;
pub mod registry;

pub use cluster::{Cluster, ClusterRef, CoordinatorBinding, MemberChannel, NeighborCluster};
pub use controller::{
    node_scope, Actions, HrmConfig, HrmController, Outgoing, RouteOutcome, SharedRoutingTable, TimerEvent,
    TimerRequest,
};
pub use coordinator::Coordinator;
pub use discovery::DiscoveryConfig;
pub use elections::{ElectionConfig, ElectionOutcome, ElectionRegistry, Elector, ElectorState};
pub use graph::{ClusterLink, LinkType, RoutableClusterGraph, SharedClusterGraph};
pub use liveness::{CoordinatorMonitor, LivenessConfig};
pub use registry::{ClusterRegistry, UpsertOutcome};

use thiserror::Error;

/// Errors originating from the hierarchy layer.
#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error("Election timed out on {0}")]
    ElectionTimeout(String),

    #[error("Duplicate coordinator for {0}")]
    DuplicateCoordinator(String),

    #[error("Cluster unreachable: {0}")]
    UnreachableCluster(String),

    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Identity collision on {0}")]
    IdentityCollision(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] hrm_protocol::ProtocolError),

    #[error("State error: {0}")]
    State(#[from] hrm_state::StateError),
}
