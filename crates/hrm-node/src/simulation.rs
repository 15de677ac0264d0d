//! Deterministic simulation driver.
//!
//! All controllers live in one thread and share a virtual clock. Frames
//! travel over [`SimulatedLinks`], whose interleaving across links is fixed
//! by a seed; timers sit in a queue ordered by due time and arming order.
//! Time only advances when no frame is in flight, so a run is a pure
//! function of topology, configuration and seed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hrm_hierarchy::{Actions, HrmConfig, HrmController, RouteOutcome, TimerEvent};
use hrm_network::sim::LinkStats;
use hrm_network::{MemoryNameService, NameService, SimulatedLinks};
use hrm_protocol::{BullyPriority, ClusterName, Hrmid, L2Address, NodeName};

use crate::config::NodeConfig;
use crate::NodeError;

/// Frames delivered in one instant before the driver gives up on reaching
/// quiescence.
const MAX_DELIVERIES_PER_INSTANT: usize = 1_000_000;

struct SimNode {
    controller: HrmController,
    crashed: bool,
}

pub struct Simulation {
    config: HrmConfig,
    names: Arc<MemoryNameService>,
    nodes: BTreeMap<NodeName, SimNode>,
    links: SimulatedLinks,
    /// Undirected physical adjacencies, smaller name first.
    adjacency: BTreeSet<(NodeName, NodeName)>,
    timers: BTreeMap<(u64, u64), (NodeName, TimerEvent)>,
    timer_seq: u64,
    now_ms: u64,
    next_address: u64,
}

impl Simulation {
    pub fn new(config: HrmConfig, seed: u64) -> Self {
        Self {
            config,
            names: Arc::new(MemoryNameService::new()),
            nodes: BTreeMap::new(),
            links: SimulatedLinks::new(seed),
            adjacency: BTreeSet::new(),
            timers: BTreeMap::new(),
            timer_seq: 0,
            now_ms: 0,
            next_address: 1,
        }
    }

    /// Build every node and link of a topology. Elections are not started.
    pub fn from_config(config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let mut simulation = Self::new(config.hrm_config(), config.simulation.seed);
        for node in &config.nodes {
            simulation.add_node(node.node_name(), node.bully_priority(), node.foreign)?;
        }
        for link in &config.links {
            simulation.connect(&NodeName::new(link.a.clone()), &NodeName::new(link.b.clone()), link.cluster)?;
        }
        Ok(simulation)
    }

    pub fn add_node(&mut self, name: NodeName, priority: BullyPriority, foreign: bool) -> Result<(), NodeError> {
        if self.nodes.contains_key(&name) {
            return Err(NodeError::DuplicateNode(name.to_string()));
        }
        let address = L2Address(self.next_address);
        self.next_address += 1;
        let names: Arc<dyn NameService> = self.names.clone();
        let controller = HrmController::new(name.clone(), address, priority, foreign, self.config.clone(), names);
        self.nodes.insert(
            name,
            SimNode {
                controller,
                crashed: false,
            },
        );
        Ok(())
    }

    /// Open a physical link; with a cluster id both ends join that
    /// base-level cluster.
    pub fn connect(&mut self, a: &NodeName, b: &NodeName, cluster: Option<i64>) -> Result<(), NodeError> {
        let a_address = self.node(a)?.controller.address();
        let b_address = self.node(b)?.controller.address();
        self.adjacency.insert(Self::undirected(a, b));
        self.links.heal(a, b);
        let actions = self.node_mut(a)?.controller.attach_link(b.clone(), b_address, cluster);
        self.apply(a, actions);
        let actions = self.node_mut(b)?.controller.attach_link(a.clone(), a_address, cluster);
        self.apply(b, actions);
        Ok(())
    }

    /// Start elections on every live node.
    pub fn start(&mut self) {
        let names: Vec<NodeName> = self.live_nodes();
        for name in names {
            let Some(node) = self.nodes.get_mut(&name) else {
                continue;
            };
            let actions = node.controller.start_elections();
            self.apply(&name, actions);
        }
    }

    /// Advance the virtual clock by `duration_ms`, delivering every frame
    /// and firing every timer that falls due.
    pub fn run_for(&mut self, duration_ms: u64) {
        let end = self.now_ms.saturating_add(duration_ms);
        loop {
            self.drain_links();
            let Some((&(due, seq), _)) = self.timers.iter().next() else {
                break;
            };
            if due > end {
                break;
            }
            let Some((node, event)) = self.timers.remove(&(due, seq)) else {
                break;
            };
            self.now_ms = due;
            self.fire(&node, event);
        }
        self.drain_links();
        self.now_ms = end;
    }

    fn drain_links(&mut self) {
        let mut delivered = 0usize;
        while let Some(delivery) = self.links.next_delivery() {
            delivered += 1;
            if delivered > MAX_DELIVERIES_PER_INSTANT {
                tracing::warn!(at_ms = self.now_ms, "Simulation did not reach quiescence");
                return;
            }
            let Some(node) = self.nodes.get_mut(&delivery.to) else {
                continue;
            };
            if node.crashed {
                continue;
            }
            let actions = node.controller.handle_frame(&delivery.from, &delivery.bytes);
            self.apply(&delivery.to, actions);
        }
    }

    fn fire(&mut self, name: &NodeName, event: TimerEvent) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if node.crashed {
            return;
        }
        tracing::trace!(node = %name, timer = event.as_str(), at_ms = self.now_ms, "Timer fired");
        let actions = node.controller.on_timer(event);
        self.apply(name, actions);
    }

    fn apply(&mut self, from: &NodeName, actions: Actions) {
        for outgoing in actions.outgoing {
            if !self.adjacency.contains(&Self::undirected(from, &outgoing.to)) {
                tracing::warn!(from = %from, to = %outgoing.to, "Frame for a node that is not adjacent");
                continue;
            }
            self.links.enqueue(from.clone(), outgoing.to, outgoing.bytes);
        }
        for timer in actions.timers {
            self.timer_seq += 1;
            self.timers.insert(
                (self.now_ms + timer.after_ms, self.timer_seq),
                (from.clone(), timer.event),
            );
        }
    }

    // ── Faults ──

    /// Cut the link between `a` and `b`. Both ends notice immediately.
    pub fn fail_link(&mut self, a: &NodeName, b: &NodeName) -> Result<(), NodeError> {
        if !self.adjacency.remove(&Self::undirected(a, b)) {
            return Err(NodeError::InvalidTopology(format!("no link {}-{}", a, b)));
        }
        self.links.fail(a, b);
        for (local, peer) in [(a, b), (b, a)] {
            let node = self.node_mut(local)?;
            if node.crashed {
                continue;
            }
            let actions = node.controller.detach(peer);
            self.apply(local, actions);
        }
        Ok(())
    }

    /// Stop `name` silently. Its neighbors keep the links and must notice
    /// the silence on their own.
    pub fn crash(&mut self, name: &NodeName) -> Result<(), NodeError> {
        self.node_mut(name)?.crashed = true;
        self.links.purge(name);
        self.timers.retain(|_, (owner, _)| owner != name);
        tracing::info!(node = %name, at_ms = self.now_ms, "Node crashed");
        Ok(())
    }

    // ── Requests ──

    /// Let `node` ask all its neighbors for a coordinator.
    pub fn request_coordinator(&mut self, node: &NodeName) -> Result<(), NodeError> {
        let actions = self.node_mut(node)?.controller.request_coordinator();
        self.apply(node, actions);
        Ok(())
    }

    pub fn discover(&mut self, node: &NodeName, peer: &NodeName) -> Result<(), NodeError> {
        let actions = self.node_mut(node)?.controller.discover(peer.clone());
        self.apply(node, actions);
        Ok(())
    }

    /// Open a route request session on `node`.
    pub fn route_request(
        &mut self,
        node: &NodeName,
        target: Hrmid,
        required: Vec<ClusterName>,
    ) -> Result<u64, NodeError> {
        let (session, actions) = self.node_mut(node)?.controller.route_request(target, required);
        self.apply(node, actions);
        Ok(session)
    }

    pub fn route_result(&self, node: &NodeName, session: u64) -> Option<RouteOutcome> {
        self.controller(node)?.route_result(session).cloned()
    }

    /// Hand a raw frame to `to` as if `from` had sent it.
    pub fn inject(&mut self, from: &NodeName, to: &NodeName, bytes: Vec<u8>) -> Result<(), NodeError> {
        let actions = self.node_mut(to)?.controller.handle_frame(from, &bytes);
        self.apply(to, actions);
        Ok(())
    }

    // ── Accessors ──

    pub fn controller(&self, name: &NodeName) -> Option<&HrmController> {
        self.nodes.get(name).map(|node| &node.controller)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &HrmController> {
        self.nodes.values().map(|node| &node.controller)
    }

    pub fn is_crashed(&self, name: &NodeName) -> bool {
        self.nodes.get(name).map(|node| node.crashed).unwrap_or(false)
    }

    pub fn live_nodes(&self) -> Vec<NodeName> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.crashed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn link_stats(&self) -> LinkStats {
        self.links.stats()
    }

    pub fn name_service(&self) -> &MemoryNameService {
        &self.names
    }

    /// JSON summary of every node.
    pub fn status(&self) -> serde_json::Value {
        let nodes: Vec<serde_json::Value> = self
            .nodes
            .values()
            .map(|node| {
                let mut status = node.controller.status();
                status["crashed"] = serde_json::Value::Bool(node.crashed);
                status
            })
            .collect();
        serde_json::json!({
            "now_ms": self.now_ms,
            "nodes": nodes,
        })
    }

    fn node(&self, name: &NodeName) -> Result<&SimNode, NodeError> {
        self.nodes
            .get(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()))
    }

    fn node_mut(&mut self, name: &NodeName) -> Result<&mut SimNode, NodeError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| NodeError::UnknownNode(name.to_string()))
    }

    fn undirected(a: &NodeName, b: &NodeName) -> (NodeName, NodeName) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_due_order() {
        let mut simulation = Simulation::new(HrmConfig::default(), 1);
        simulation
            .add_node("a".into(), BullyPriority::new(1.0), false)
            .unwrap();
        let mut actions = Actions::new();
        actions.arm(50, TimerEvent::SuperiorCheck { level: hrm_protocol::HierarchyLevel::BASE });
        actions.arm(10, TimerEvent::SuperiorCheck { level: hrm_protocol::HierarchyLevel::BASE });
        simulation.apply(&"a".into(), actions);
        assert_eq!(simulation.pending_timers(), 2);
        simulation.run_for(20);
        assert_eq!(simulation.pending_timers(), 1);
        assert_eq!(simulation.now_ms(), 20);
        simulation.run_for(100);
        assert_eq!(simulation.pending_timers(), 0);
    }

    #[test]
    fn unknown_nodes_are_reported() {
        let mut simulation = Simulation::new(HrmConfig::default(), 1);
        let err = simulation.connect(&"a".into(), &"b".into(), None).unwrap_err();
        assert!(matches!(err, NodeError::UnknownNode(_)));
    }
}
