//! Neighbor cluster gossip: NeighborClusterAnnounce propagation, remote
//! proxy maintenance and rejection bounces.

use std::cmp::Ordering;

use hrm_protocol::{BullyResign, ClusterKey, ClusterName, HrmMessage, NeighborClusterAnnounce, NodeName};

use super::{Actions, HrmController, Inbound, TimerEvent};
use crate::cluster::{claim_order, MemberChannel, NeighborCluster};
use crate::discovery::coordinator_vectors;
use crate::elections::ElectorState;
use crate::graph::LinkType;
use crate::registry::UpsertOutcome;

impl HrmController {
    /// Announcement of local cluster `key`, if it has a coordinator.
    pub(crate) fn neighbor_announce_for(&self, key: ClusterKey) -> Option<NeighborClusterAnnounce> {
        let cluster = self.registry.local(&key)?;
        let binding = cluster.coordinator()?;
        Some(NeighborClusterAnnounce {
            coordinator_name: binding.name.clone(),
            coordinator_signature: binding.signature.clone(),
            coordinator_address: binding.address,
            token: cluster.token(),
            cluster_id: key.cluster_id,
            level: key.level,
            priority: binding.priority,
            epoch: binding.epoch,
            routing_vectors: coordinator_vectors(binding, &self.name),
            rejected: false,
            foreign: self.foreign,
        })
    }

    /// Cross-announce `key` and its sibling clusters on this node once `key`
    /// has a coordinator, and replay what was buffered for it.
    pub(crate) fn after_coordinator_bound(&mut self, key: ClusterKey, actions: &mut Actions) {
        let siblings: Vec<ClusterKey> = self
            .registry
            .local_keys_at(key.level)
            .into_iter()
            .filter(|other| *other != key)
            .collect();

        if let Some(own) = self.neighbor_announce_for(key) {
            for sibling in &siblings {
                self.deliver_neighbor_announce(*sibling, key, own.clone(), actions);
            }
        }
        for sibling in &siblings {
            if let Some(theirs) = self.neighbor_announce_for(*sibling) {
                self.deliver_neighbor_announce(key, *sibling, theirs, actions);
            }
        }

        let buffered = self
            .registry
            .local_mut(&key)
            .map(|cluster| cluster.take_buffered())
            .unwrap_or_default();
        if !buffered.is_empty() {
            tracing::debug!(
                node = %self.name,
                cluster = %key,
                count = buffered.len(),
                "Replaying buffered neighbor announcements"
            );
        }
        for announce in buffered {
            let about = announce.cluster_name().key();
            self.deliver_neighbor_announce(key, about, announce, actions);
        }
    }

    /// Hand an announcement about `about` to the coordinator of local
    /// cluster `target`; buffered until `target` has one.
    fn deliver_neighbor_announce(
        &mut self,
        target: ClusterKey,
        about: ClusterKey,
        announce: NeighborClusterAnnounce,
        actions: &mut Actions,
    ) {
        let about_local = self.registry.has_local(&about);
        let sender = self
            .registry
            .current_name(&about)
            .unwrap_or_else(|| announce.cluster_name());
        let Some(cluster) = self.registry.local_mut(&target) else {
            return;
        };
        let receiver = cluster.name();
        let Some(binding) = cluster.coordinator() else {
            cluster.buffer_announcement(announce);
            return;
        };
        if binding.is_local() {
            // Sibling clusters coordinated here are already linked physically.
            if about_local {
                return;
            }
            let local = self.name.clone();
            self.handle_remote_announce(target, local, announce, Vec::new(), receiver, actions);
            return;
        }
        let route = binding.route.clone();
        self.send(&route, sender, receiver, HrmMessage::NeighborClusterAnnounce(announce), actions);
    }

    pub(crate) fn on_neighbor_announce(
        &mut self,
        key: ClusterKey,
        inbound: Inbound,
        mut msg: NeighborClusterAnnounce,
        actions: &mut Actions,
    ) {
        if msg.coordinator_signature.signer != msg.coordinator_name || msg.coordinator_signature.verify().is_err() {
            tracing::warn!(
                node = %self.name,
                cluster = %msg.cluster_name(),
                coordinator = %msg.coordinator_name,
                "Dropping neighbor announcement with invalid signature"
            );
            return;
        }
        msg.routing_vectors.push(inbound.segment(&self.name));
        let about = msg.cluster_name().key();

        if self.registry.has_local(&about) {
            if msg.rejected {
                self.on_rejection(about, msg, actions);
            } else {
                tracing::debug!(node = %self.name, cluster = %about, "Ignoring gossip about a local cluster");
            }
            return;
        }

        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        match cluster.coordinator() {
            Some(binding) if binding.is_local() => {
                let reply_route = inbound.reply_route();
                self.handle_remote_announce(key, inbound.origin, msg, reply_route, inbound.sender, actions);
            }
            Some(binding) => {
                let route = binding.route.clone();
                let receiver = cluster.name();
                self.send(&route, inbound.sender, receiver, HrmMessage::NeighborClusterAnnounce(msg), actions);
            }
            None => {
                tracing::debug!(
                    node = %self.name,
                    cluster = %key,
                    about = %msg.cluster_name(),
                    "No coordinator yet, buffering neighbor announcement"
                );
                cluster.buffer_announcement(msg);
            }
        }
    }

    /// Coordinator side of a neighbor announcement.
    fn handle_remote_announce(
        &mut self,
        key: ClusterKey,
        announcer: NodeName,
        msg: NeighborClusterAnnounce,
        reply_route: Vec<NodeName>,
        reply_to: ClusterName,
        actions: &mut Actions,
    ) {
        let Some(local_name) = self.registry.current_name(&key) else {
            return;
        };
        let neighbor = NeighborCluster::from_announce(&msg, announcer, key, &self.name);
        let remote_name = neighbor.name;
        let coordinator = neighbor.coordinator_name.clone();
        let address = neighbor.coordinator_address;
        let route = neighbor.route_to_coordinator.clone();

        let outcome = match self.registry.upsert_remote(neighbor) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(node = %self.name, cluster = %remote_name, error = %e, "Dropping neighbor announcement");
                return;
            }
        };
        match outcome {
            UpsertOutcome::Created => {
                let linked = self
                    .graph_write()
                    .store_link(local_name, remote_name, LinkType::LogicalLink);
                tracing::info!(
                    node = %self.name,
                    cluster = %local_name,
                    neighbor = %remote_name,
                    coordinator = %coordinator,
                    "Neighbor cluster discovered"
                );
                self.register_coordinator(&coordinator, address, route.clone());
                if linked {
                    self.raise_connectivity(key, msg.foreign, actions);
                }
                if self.config.discovery.discover_on_new_neighbor {
                    if let Some(first) = route.first().cloned() {
                        if self.links.contains_key(&first) {
                            actions.merge(self.discover(first));
                        }
                    }
                }
                if (key.level.value() + 1) < self.config.height as i32 {
                    actions.arm(0, TimerEvent::SuperiorCheck { level: key.level });
                }
            }
            UpsertOutcome::Updated => {
                self.graph_write()
                    .store_link(local_name, remote_name, LinkType::LogicalLink);
                self.register_coordinator(&coordinator, address, route);
            }
            UpsertOutcome::Replaced { old } => {
                {
                    let mut graph = self.graph_write();
                    graph.replace_node(&old, remote_name);
                    graph.store_link(local_name, remote_name, LinkType::LogicalLink);
                }
                tracing::info!(
                    node = %self.name,
                    old = %old,
                    new = %remote_name,
                    coordinator = %coordinator,
                    "Neighbor cluster re-tokened"
                );
                self.register_coordinator(&coordinator, address, route);
            }
            UpsertOutcome::Rejected { current } => {
                let Some(mut bounce) = current.to_announce() else {
                    return;
                };
                bounce.set_rejection();
                tracing::debug!(
                    node = %self.name,
                    cluster = %remote_name,
                    offered = %coordinator,
                    held = %current.coordinator_name,
                    "Rejecting weaker neighbor announcement"
                );
                if reply_route.is_empty() {
                    return;
                }
                self.send(&reply_route, local_name, reply_to, HrmMessage::NeighborClusterAnnounce(bounce), actions);
            }
            UpsertOutcome::Unchanged => {}
        }
    }

    fn register_coordinator(&self, coordinator: &NodeName, address: hrm_protocol::L2Address, route: Vec<NodeName>) {
        self.names.register_node(coordinator, address);
        self.names.register_route(&self.name, coordinator, route);
    }

    /// A rejection bounced back for local cluster `key`.
    fn on_rejection(&mut self, key: ClusterKey, msg: NeighborClusterAnnounce, actions: &mut Actions) {
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let Some(binding) = cluster.coordinator() else {
            return;
        };
        if binding.is_local() {
            let better = claim_order(&msg.candidate(), msg.epoch, &binding.candidate(), binding.epoch)
                == Ordering::Greater;
            if !better {
                return;
            }
            tracing::info!(
                node = %self.name,
                cluster = %key,
                asserted = %msg.coordinator_name,
                "Rejected by a better coordinator, resigning"
            );
            let (priority, epoch) = (binding.priority, binding.epoch);
            let name = cluster.name();
            let members: Vec<MemberChannel> = cluster.members().cloned().collect();
            cluster.clear_coordinator();
            cluster.observe(msg.candidate());
            self.coordinators.remove(&key);
            let resign = BullyResign::new(&self.identity, key.level, priority, epoch);
            for member in &members {
                self.send(&member.route, name, name, HrmMessage::BullyResign(resign.clone()), actions);
            }
            self.elections.elector(key).reset();
            self.begin_election(key, actions);
            return;
        }
        let route = binding.route.clone();
        let name = cluster.name();
        if self.elections.state(&key) == ElectorState::Following {
            self.send(&route, name, name, HrmMessage::NeighborClusterAnnounce(msg), actions);
        }
    }
}
