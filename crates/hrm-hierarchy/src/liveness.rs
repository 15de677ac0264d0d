//! Coordinator liveness monitoring.
//!
//! Coordinators flood BullyAlive heartbeats through their cluster every
//! `alive_interval_ms`. Members check at every `timeout_ms` whether at least
//! one heartbeat arrived since the previous check; a silent period means the
//! coordinator is lost and the cluster re-elects.
//!
//! Checks are driven by timer events rather than wall-clock comparisons, so
//! the monitor behaves identically under simulated and real time. The
//! wall-clock `last_seen` is kept for status reporting only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use hrm_protocol::{ClusterKey, NodeName, COORDINATOR_ALIVE_INTERVAL_MS, COORDINATOR_TIMEOUT_MS};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub alive_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            alive_interval_ms: COORDINATOR_ALIVE_INTERVAL_MS,
            timeout_ms: COORDINATOR_TIMEOUT_MS,
        }
    }
}

impl LivenessConfig {
    pub fn with_timeouts(alive_interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            alive_interval_ms,
            timeout_ms,
        }
    }
}

/// Status of a monitored coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub coordinator: NodeName,
    pub epoch: u64,
    /// Last time a heartbeat was received.
    pub last_seen: DateTime<Utc>,
    /// Heartbeats since the previous check.
    pub heard_since_check: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    Alive,
    Lost,
    /// The cluster is not monitored (anymore).
    Unmonitored,
}

/// Tracks the coordinators this node follows.
#[derive(Debug, Default)]
pub struct CoordinatorMonitor {
    monitored: BTreeMap<ClusterKey, CoordinatorStatus>,
}

impl CoordinatorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring a coordinator. Binding counts as a first heartbeat.
    pub fn monitor(&mut self, cluster: ClusterKey, coordinator: NodeName, epoch: u64) {
        self.monitored.insert(
            cluster,
            CoordinatorStatus {
                coordinator,
                epoch,
                last_seen: Utc::now(),
                heard_since_check: 1,
            },
        );
    }

    pub fn unmonitor(&mut self, cluster: &ClusterKey) -> Option<CoordinatorStatus> {
        self.monitored.remove(cluster)
    }

    /// Record a heartbeat. Heartbeats of another coordinator are ignored.
    pub fn record_alive(&mut self, cluster: &ClusterKey, coordinator: &NodeName) -> bool {
        match self.monitored.get_mut(cluster) {
            Some(status) if &status.coordinator == coordinator => {
                status.last_seen = Utc::now();
                status.heard_since_check += 1;
                true
            }
            _ => false,
        }
    }

    /// Periodic check. A coordinator unheard since the previous check is lost
    /// and no longer monitored.
    pub fn check(&mut self, cluster: &ClusterKey) -> LivenessVerdict {
        let Some(status) = self.monitored.get_mut(cluster) else {
            return LivenessVerdict::Unmonitored;
        };
        if status.heard_since_check == 0 {
            tracing::warn!(
                cluster = %cluster,
                coordinator = %status.coordinator,
                last_seen = %status.last_seen,
                "Coordinator timeout detected"
            );
            self.monitored.remove(cluster);
            return LivenessVerdict::Lost;
        }
        status.heard_since_check = 0;
        LivenessVerdict::Alive
    }

    pub fn status(&self, cluster: &ClusterKey) -> Option<&CoordinatorStatus> {
        self.monitored.get(cluster)
    }

    pub fn monitored_count(&self) -> usize {
        self.monitored.len()
    }
}
