//! RequestCoordinator and ClusterDiscovery exchanges.

use hrm_protocol::{
    ClusterDiscovery, ClusterKey, ClusterName, DiscoveryEntry, HierarchyLevel, HrmMessage,
    NestedDiscovery, NodeName, RequestCoordinator, RoutingVector,
};

use super::{node_scope, Actions, HrmController, Inbound, TimerEvent};
use crate::cluster::NeighborCluster;
use crate::discovery::{answer_nested, coordinator_entries, AnswerVerdict, RequestKind};
use crate::graph::LinkType;
use crate::registry::UpsertOutcome;

impl HrmController {
    /// Ask every direct neighbor which coordinators it knows. All copies
    /// share one correlation id; the first answer naming a coordinator
    /// settles the request.
    pub fn request_coordinator(&mut self) -> Actions {
        let mut actions = Actions::new();
        let peers: Vec<NodeName> = self.links.keys().cloned().collect();
        if peers.is_empty() {
            tracing::debug!(node = %self.name, "No neighbor to ask for a coordinator");
            return actions;
        }
        let request = RequestCoordinator::request();
        let id = request.correlation_id;
        self.requests.insert(id, RequestKind::Coordinator, peers.iter().cloned());
        tracing::debug!(node = %self.name, peers = peers.len(), correlation = %id, "Requesting coordinator");
        let scope = node_scope(HierarchyLevel::UNDEFINED);
        for peer in peers {
            self.send(&[peer], scope, scope, HrmMessage::RequestCoordinator(request.clone()), &mut actions);
        }
        actions.arm(
            self.config.discovery.reply_timeout_ms,
            TimerEvent::RequestExpiry { id },
        );
        actions
    }

    /// Explore the clusters around a direct neighbor, one nested discovery
    /// per local base-level cluster.
    pub fn discover(&mut self, peer: NodeName) -> Actions {
        let mut actions = Actions::new();
        let radius = self.config.discovery.radius;
        let known: Vec<i32> = self.graph_read().nodes().iter().map(|name| name.token).collect();
        let mut discovery = ClusterDiscovery::request();
        for key in self.registry.local_keys_at(HierarchyLevel::BASE) {
            let token = self.registry.local(&key).map(|c| c.token()).unwrap_or(0);
            let mut nested = NestedDiscovery::new(key.cluster_id, token, key.level, radius);
            nested.tokens = known.clone();
            discovery.add_nested(nested);
        }
        if discovery.nested.is_empty() {
            let mut nested = NestedDiscovery::new(0, 0, HierarchyLevel::BASE, radius);
            nested.tokens = known;
            discovery.add_nested(nested);
        }
        let id = discovery.identification;
        self.requests.insert(id, RequestKind::Discovery, [peer.clone()]);
        tracing::debug!(
            node = %self.name,
            peer = %peer,
            nested = discovery.nested.len(),
            "Starting cluster discovery"
        );
        let scope = node_scope(HierarchyLevel::BASE);
        self.send(&[peer], scope, scope, HrmMessage::ClusterDiscovery(discovery), &mut actions);
        actions.arm(
            self.config.discovery.reply_timeout_ms,
            TimerEvent::RequestExpiry { id },
        );
        actions
    }

    pub(crate) fn on_request_coordinator(&mut self, inbound: Inbound, msg: RequestCoordinator, actions: &mut Actions) {
        if !msg.is_answer {
            let level = if inbound.receiver.level.is_undefined() {
                HierarchyLevel::BASE
            } else {
                inbound.receiver.level
            };
            let entries = {
                let graph = self.graph_read();
                coordinator_entries(
                    &self.registry,
                    &graph,
                    Some(level),
                    self.config.discovery.radius,
                    &self.name,
                    self.foreign,
                )
            };
            tracing::debug!(
                node = %self.name,
                requester = %inbound.origin,
                entries = entries.len(),
                "Answering coordinator request"
            );
            let answer = RequestCoordinator::answer(msg.correlation_id, entries);
            let scope = node_scope(HierarchyLevel::UNDEFINED);
            self.send(&inbound.reply_route(), scope, inbound.sender, HrmMessage::RequestCoordinator(answer), actions);
            return;
        }

        match self.requests.answer(&msg.correlation_id, &inbound.origin, msg.coordinator_known) {
            AnswerVerdict::Accepted(_) | AnswerVerdict::Exhausted(_) => {}
            AnswerVerdict::Unhelpful | AnswerVerdict::Discarded => return,
        }
        let segment = inbound.segment(&self.name);
        let via = self.registry.local_keys_at(HierarchyLevel::BASE).first().copied();
        for entry in &msg.discovery_entries {
            let via = via.unwrap_or_else(|| entry.cluster_name().key());
            self.adopt_entry(entry, &inbound.origin, via, &segment, actions);
        }
        tracing::info!(
            node = %self.name,
            responder = %inbound.origin,
            known = msg.coordinator_known,
            entries = msg.discovery_entries.len(),
            "Coordinator request answered"
        );
        self.coordinator_answers.push(msg);
    }

    pub(crate) fn on_cluster_discovery(&mut self, inbound: Inbound, mut msg: ClusterDiscovery, actions: &mut Actions) {
        if msg.request {
            {
                let graph = self.graph_read();
                for nested in msg.nested.iter_mut() {
                    let origins: Vec<ClusterName> = self
                        .registry
                        .locals()
                        .filter(|cluster| cluster.key().level == nested.level && cluster.coordinator().is_some())
                        .map(|cluster| cluster.name())
                        .collect();
                    answer_nested(&self.registry, &graph, &origins, &self.name, self.foreign, nested);
                }
            }
            msg.request = false;
            msg.dealt_with = true;
            let scope = node_scope(HierarchyLevel::BASE);
            self.send(&inbound.reply_route(), scope, inbound.sender, HrmMessage::ClusterDiscovery(msg), actions);
            return;
        }

        if self.requests.satisfy(&msg.identification).is_none() {
            return;
        }
        let segment = inbound.segment(&self.name);
        let mut learned = 0usize;
        for nested in &msg.nested {
            let via = ClusterKey::new(nested.source_cluster_id, nested.level);
            let via_name = self.registry.local(&via).map(|cluster| cluster.name());
            for entry in &nested.discovery_entries {
                let Some(name) = self.adopt_entry(entry, &inbound.origin, via, &segment, actions) else {
                    continue;
                };
                learned += 1;
                if entry.cluster_hops != 1 {
                    continue;
                }
                let Some(via_name) = via_name else {
                    continue;
                };
                let linked = self.graph_write().store_link(via_name, name, LinkType::LogicalLink);
                if linked {
                    self.raise_connectivity(via, entry.foreign, actions);
                }
            }
            for (a, b) in &nested.neighbor_relations {
                let (Some(a), Some(b)) = (self.normalize(a), self.normalize(b)) else {
                    continue;
                };
                if a != b {
                    self.graph_write().store_link(a, b, LinkType::LogicalLink);
                }
            }
        }
        tracing::info!(
            node = %self.name,
            responder = %inbound.origin,
            learned,
            "Cluster discovery answered"
        );
    }

    /// Register a discovered cluster as a remote proxy and graph node.
    /// Returns its current identity, or `None` for local clusters.
    fn adopt_entry(
        &mut self,
        entry: &DiscoveryEntry,
        announcer: &NodeName,
        via: ClusterKey,
        segment: &RoutingVector,
        actions: &mut Actions,
    ) -> Option<ClusterName> {
        let key = entry.cluster_name().key();
        if self.registry.has_local(&key) {
            return None;
        }
        let mut extended = entry.clone();
        extended.routing_vectors.push(segment.clone());
        let neighbor = NeighborCluster::from_discovery(&extended, announcer.clone(), via, &self.name);
        let name = neighbor.name;
        let coordinator = neighbor.coordinator_name.clone();
        self.names.register_node(&coordinator, neighbor.coordinator_address);
        self.names
            .register_route(&self.name, &coordinator, neighbor.route_to_coordinator.clone());

        match self.registry.upsert_remote(neighbor) {
            Ok(UpsertOutcome::Created) => {
                if name.level.is_base_level() {
                    let mut graph = self.graph_write();
                    graph.add_node(name);
                    if let Some(predecessor) = entry.predecessor.and_then(|p| self.normalize(&p)) {
                        if predecessor != name {
                            graph.store_link(predecessor, name, LinkType::LogicalLink);
                        }
                    }
                }
                if (via.level.value() + 1) < self.config.height as i32 && self.registry.has_local(&via) {
                    actions.arm(0, TimerEvent::SuperiorCheck { level: via.level });
                }
                Some(name)
            }
            Ok(UpsertOutcome::Replaced { old }) => {
                self.graph_write().replace_node(&old, name);
                Some(name)
            }
            Ok(UpsertOutcome::Updated) | Ok(UpsertOutcome::Unchanged) => Some(name),
            Ok(UpsertOutcome::Rejected { current }) => Some(current.name),
            Err(e) => {
                tracing::warn!(node = %self.name, cluster = %name, error = %e, "Ignoring discovery entry");
                None
            }
        }
    }

    /// Current identity of a reported cluster. Stale incarnations of known
    /// clusters are dropped.
    pub(crate) fn normalize(&self, name: &ClusterName) -> Option<ClusterName> {
        match self.registry.current_name(&name.key()) {
            Some(current) if current == *name || !name.has_token() => Some(current),
            Some(_) => None,
            None => Some(*name),
        }
    }
}
