//! Membership reports, address distribution, TopologyData handling and the
//! growth of the hierarchy into superior clusters.

use std::collections::BTreeMap;

use hrm_protocol::{
    ClusterKey, ClusterName, FibEntry, HierarchyLevel, HrmMessage, InformClusterMembershipCanceled, L2Address,
    NodeName, RequestClusterMembership, TopologyData,
};
use hrm_state::StateError;

use super::{Actions, HrmController, Inbound, TimerEvent};
use crate::cluster::{Cluster, ClusterRef, MemberChannel};
use crate::coordinator::{MemberRecord, TopologyPush};
use crate::graph::LinkType;
use crate::registry::ClusterRegistry;
use crate::HierarchyError;

impl HrmController {
    /// Clusters this node reports alongside membership of `key`: sibling
    /// clusters at the base level, the clusters it coordinates one level
    /// down otherwise.
    pub(crate) fn attachments_of(&self, key: ClusterKey) -> Vec<ClusterName> {
        match key.level.inferior() {
            None => self
                .registry
                .locals()
                .filter(|cluster| cluster.key().level == key.level && cluster.key() != key)
                .map(|cluster| cluster.name())
                .collect(),
            Some(below) => self
                .registry
                .locals()
                .filter(|cluster| cluster.key().level == below && cluster.is_coordinator(&self.name))
                .map(|cluster| cluster.name())
                .collect(),
        }
    }

    // ── Membership ──

    pub(crate) fn send_membership(&mut self, key: ClusterKey, actions: &mut Actions) {
        let attached = self.attachments_of(key);
        let relations: Vec<(ClusterName, ClusterName)> = self
            .graph_read()
            .links()
            .into_iter()
            .map(|link| (link.from, link.to))
            .collect();
        let Some(cluster) = self.registry.local(&key) else {
            return;
        };
        let Some(binding) = cluster.coordinator().filter(|binding| !binding.is_local()) else {
            return;
        };
        let request = RequestClusterMembership {
            coordinator: binding.name.clone(),
            member: self.name.clone(),
            address: self.address,
            priority: cluster.priority(),
            path: vec![self.name.clone()],
            attached_clusters: attached,
            neighbor_relations: relations,
        };
        let route = binding.route.clone();
        let name = cluster.name();
        self.send(&route, name, name, HrmMessage::RequestClusterMembership(request), actions);
    }

    pub(crate) fn on_membership(
        &mut self,
        key: ClusterKey,
        inbound: Inbound,
        msg: RequestClusterMembership,
        actions: &mut Actions,
    ) {
        if msg.coordinator == self.name && !self.coordinators.contains_key(&key) {
            tracing::info!(
                node = %self.name,
                cluster = %key,
                member = %msg.member,
                "No longer coordinating, canceling membership"
            );
            if let Some(name) = self.registry.current_name(&key) {
                let canceled = InformClusterMembershipCanceled {
                    coordinator: self.name.clone(),
                    member: msg.member.clone(),
                };
                self.send(
                    &inbound.reply_route(),
                    name,
                    inbound.sender,
                    HrmMessage::InformClusterMembershipCanceled(canceled),
                    actions,
                );
            }
            return;
        }
        if msg.coordinator != self.name {
            tracing::debug!(
                node = %self.name,
                member = %msg.member,
                coordinator = %msg.coordinator,
                "Dropping stale membership request"
            );
            return;
        }
        let mut path = msg.path.clone();
        path.extend(inbound.trail.iter().cloned());
        path.push(self.name.clone());
        let route: Vec<NodeName> = path.iter().rev().skip(1).cloned().collect();

        let base = key.level.is_base_level();
        for (a, b) in &msg.neighbor_relations {
            if !(a.level.is_base_level() && b.level.is_base_level()) {
                continue;
            }
            let (Some(a), Some(b)) = (self.normalize(a), self.normalize(b)) else {
                continue;
            };
            if a != b {
                self.graph_write().store_link(a, b, LinkType::LogicalLink);
            }
        }
        if base {
            // Sibling clusters of a base-level member are graph neighbors of
            // this cluster.
            if let Some(own) = self.registry.current_name(&key) {
                for attached in &msg.attached_clusters {
                    if let Some(attached) = self.normalize(attached) {
                        if attached != own && attached.level == own.level {
                            self.graph_write().store_link(own, attached, LinkType::LogicalLink);
                        }
                    }
                }
            }
        }

        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        cluster.add_member(MemberChannel::routed(msg.member.clone(), route.clone()));
        cluster.record_priority(&msg.member, msg.priority);
        let generation = cluster.generation();

        let record = MemberRecord {
            name: msg.member.clone(),
            address: msg.address,
            priority: msg.priority,
            route,
            attached_clusters: msg.attached_clusters,
        };
        let Some(coordinator) = self.coordinators.get_mut(&key) else {
            return;
        };
        let changed = coordinator.add_member(record);
        tracing::debug!(
            node = %self.name,
            cluster = %key,
            member = %msg.member,
            changed,
            "Membership recorded"
        );
        if changed && coordinator.arm_distribution() {
            actions.arm(
                self.config.address_distribution_delay_ms,
                TimerEvent::AddressDistribution { cluster: key, generation },
            );
        }
    }

    /// The node this cluster follows stopped coordinating it.
    pub(crate) fn on_membership_canceled(
        &mut self,
        key: ClusterKey,
        msg: InformClusterMembershipCanceled,
        actions: &mut Actions,
    ) {
        let follows = self
            .registry
            .local(&key)
            .and_then(Cluster::coordinator)
            .map(|binding| !binding.is_local() && binding.name == msg.coordinator)
            .unwrap_or(false);
        if msg.member != self.name || !follows {
            return;
        }
        tracing::info!(
            node = %self.name,
            cluster = %key,
            coordinator = %msg.coordinator,
            "Membership canceled by coordinator"
        );
        self.coordinator_lost(key, actions);
    }

    // ── Address distribution ──

    pub(crate) fn on_distribution_timer(&mut self, key: ClusterKey, generation: u64, actions: &mut Actions) {
        let current = self.registry.local(&key).map(|cluster| cluster.generation());
        if current != Some(generation) {
            return;
        }
        let Some(coordinator) = self.coordinators.get_mut(&key) else {
            return;
        };
        coordinator.distribution_fired();
        self.distribute(key, actions);
    }

    /// Assign addresses in `key` and push TopologyData to every member.
    pub(crate) fn distribute(&mut self, key: ClusterKey, actions: &mut Actions) {
        let attachments = self.attachments_of(key);
        let Some(cluster_name) = self.registry.current_name(&key) else {
            return;
        };
        let Some(coordinator) = self.coordinators.get_mut(&key) else {
            return;
        };
        coordinator.set_local_attachments(attachments);

        let pushes: Result<Vec<TopologyPush>, HierarchyError> = if key.level.is_base_level() {
            let names = &self.names;
            coordinator.build_member_topology(cluster_name, &self.identity, |name| names.resolve(name))
        } else {
            let graph = self.graph.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            let registry = &self.registry;
            let built = coordinator.build_cluster_topology(
                &graph,
                self.config.discovery.radius,
                &self.identity,
                |cluster| coordinator_address(registry, cluster),
            );
            built
        };
        let pushes = match pushes {
            Ok(pushes) => pushes,
            Err(e) => {
                tracing::warn!(node = %self.name, cluster = %key, error = %e, "Address distribution failed");
                return;
            }
        };
        tracing::info!(
            node = %self.name,
            cluster = %cluster_name,
            pushes = pushes.len(),
            "Addresses distributed"
        );

        for push in pushes {
            if push.member == self.name {
                if key.level.is_base_level() {
                    self.apply_member_topology(key, push.data);
                } else {
                    let target = push.data.cluster.key();
                    self.apply_superior_topology(target, push.data, actions);
                }
                continue;
            }
            let receiver = if key.level.is_base_level() {
                cluster_name
            } else {
                push.data.cluster
            };
            self.send(&push.route, cluster_name, receiver, HrmMessage::TopologyData(push.data), actions);
        }
    }

    pub(crate) fn on_topology(&mut self, key: ClusterKey, _inbound: Inbound, data: TopologyData, actions: &mut Actions) {
        if data.level() > key.level {
            self.apply_superior_topology(key, data, actions);
        } else {
            self.apply_member_topology(key, data);
        }
    }

    /// Install the address and entries a coordinator of `key` assigned to
    /// this node.
    fn apply_member_topology(&mut self, key: ClusterKey, data: TopologyData) {
        if let Err(e) = self.admit_topology(&data) {
            tracing::warn!(node = %self.name, cluster = %key, error = %e, "Rejecting topology data");
            return;
        }
        let Some(cluster) = self.registry.local_mut(&key) else {
            return;
        };
        let previous = cluster.hrmid();
        cluster.set_hrmid(data.hrmid);

        let mut table = self.routing.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = previous.filter(|previous| *previous != data.hrmid) {
            table.remove(&previous);
            table.remove_signed_by(&data.signature.signer);
        }
        let report = table.merge_topology(&data, &self.approved);
        let own = FibEntry {
            destination: data.hrmid,
            next_hop: self.address,
            next_cluster: data.cluster,
            farthest_cluster: Some(data.cluster),
            signature: data.signature.clone(),
            routing_vectors: Vec::new(),
        };
        match table.insert_local(own) {
            Ok(()) | Err(StateError::WriteProtected(_)) => {}
            Err(e) => tracing::warn!(node = %self.name, error = %e, "Cannot install own address"),
        }
        drop(table);

        if previous != Some(data.hrmid) {
            tracing::info!(
                node = %self.name,
                cluster = %data.cluster,
                hrmid = %data.hrmid,
                coordinator = %data.signature.signer,
                entries = report.inserted + report.replaced,
                "Address assigned"
            );
        }
    }

    /// Adopt the prefix handed down for cluster `key`, which this node
    /// coordinates, and redistribute inside it.
    fn apply_superior_topology(&mut self, key: ClusterKey, data: TopologyData, actions: &mut Actions) {
        if let Err(e) = self.admit_topology(&data) {
            tracing::warn!(node = %self.name, cluster = %key, error = %e, "Rejecting superior topology data");
            return;
        }
        let Some(coordinator) = self.coordinators.get_mut(&key) else {
            tracing::debug!(node = %self.name, cluster = %key, "Not coordinating, ignoring superior topology");
            return;
        };
        let changed = coordinator.apply_superior(data.hrmid, data.entries().to_vec(), data.signature.clone());
        self.table_write().merge_topology(&data, &self.approved);
        tracing::info!(
            node = %self.name,
            cluster = %key,
            prefix = %data.hrmid,
            changed,
            "Cluster prefix assigned"
        );
        self.distribute(key, actions);
    }

    /// Check that the push is intact and sealed by an approved coordinator,
    /// then trust the signatures it vouches for.
    fn admit_topology(&mut self, data: &TopologyData) -> Result<(), HierarchyError> {
        data.verify()
            .map_err(|e| HierarchyError::SignatureMismatch(format!("{} from {}", e, data.signature.signer)))?;
        self.approved
            .validate(&data.signature)
            .map_err(|e| match e {
                StateError::SignatureMismatch(reason) => HierarchyError::SignatureMismatch(reason),
                other => HierarchyError::State(other),
            })?;
        for signature in &data.approved_signatures {
            if let Err(e) = self.approved.approve(signature) {
                tracing::warn!(node = %self.name, signer = %signature.signer, error = %e, "Chain signature rejected");
            }
        }
        Ok(())
    }

    // ── Superior clusters ──

    pub(crate) fn on_superior_check(&mut self, level: HierarchyLevel, actions: &mut Actions) {
        if level.is_undefined() || level.value() + 1 >= self.config.height as i32 {
            return;
        }
        if !self.coordinates_on(level) {
            return;
        }
        if !self.elections.settled_on_level(level) {
            actions.arm(
                self.config.election.reply_timeout_ms,
                TimerEvent::SuperiorCheck { level },
            );
            return;
        }

        let candidates = self.superior_candidates(level);
        if candidates.is_empty() {
            tracing::debug!(node = %self.name, level = %level, "No neighbor clusters, hierarchy stops here");
            return;
        }
        let (key, created) = self.ensure_superior(level);
        let mut joined = Vec::new();
        if let Some(cluster) = self.registry.local_mut(&key) {
            for (peer, route) in candidates {
                if cluster.add_member(MemberChannel::routed(peer.clone(), route)) {
                    joined.push(peer);
                }
            }
        }
        if created {
            self.begin_election(key, actions);
            return;
        }
        for peer in &joined {
            self.greet_member(key, peer, actions);
        }
    }

    /// Coordinators of clusters adjacent to the ones this node coordinates on
    /// `level`, with the shortest known route to each.
    fn superior_candidates(&self, level: HierarchyLevel) -> BTreeMap<NodeName, Vec<NodeName>> {
        let mut candidates: BTreeMap<NodeName, Vec<NodeName>> = BTreeMap::new();
        let graph = self.graph_read();
        let coordinated: Vec<ClusterName> = self
            .registry
            .locals()
            .filter(|cluster| cluster.key().level == level && cluster.is_coordinator(&self.name))
            .map(|cluster| cluster.name())
            .collect();

        for own in coordinated {
            for neighbor in graph.get_neighbors(&own) {
                let (name, route) = match self.registry.resolve(&neighbor) {
                    ClusterRef::Local(key) => {
                        let Some(binding) = self.registry.local(&key).and_then(Cluster::coordinator) else {
                            continue;
                        };
                        (binding.name.clone(), binding.route.clone())
                    }
                    ClusterRef::Remote(remote) => (remote.coordinator_name, remote.route_to_coordinator),
                    ClusterRef::Identity(_) => continue,
                };
                if name == self.name || route.is_empty() || !self.links.contains_key(&route[0]) {
                    continue;
                }
                let shorter = candidates
                    .get(&name)
                    .map(|known| route.len() < known.len())
                    .unwrap_or(true);
                if shorter {
                    candidates.insert(name, route);
                }
            }
        }
        candidates
    }

    /// The superior cluster of `level`, created if missing.
    pub(crate) fn ensure_superior(&mut self, level: HierarchyLevel) -> (ClusterKey, bool) {
        let key = self.superior_key(level);
        if self.registry.has_local(&key) {
            return (key, false);
        }
        let priority = self
            .registry
            .locals()
            .filter(|cluster| cluster.key().level == level && cluster.is_coordinator(&self.name))
            .map(|cluster| cluster.priority())
            .max_by(|a, b| a.total_cmp(b))
            .unwrap_or(self.base_priority);
        let cluster = Cluster::new(key, priority);
        let name = cluster.name();
        match self.registry.insert_local(cluster) {
            Ok(Some(proxy)) => self.rekey_in_graph(proxy.name, name),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(node = %self.name, error = %e, "Cannot create superior cluster");
                return (key, false);
            }
        }
        self.elections.elector(key);
        tracing::info!(
            node = %self.name,
            cluster = %key,
            priority = %priority,
            "Superior cluster prepared"
        );
        (key, true)
    }
}

/// Transport address of the coordinator of `cluster`.
fn coordinator_address(registry: &ClusterRegistry, cluster: &ClusterName) -> Option<L2Address> {
    match registry.resolve(cluster) {
        ClusterRef::Local(key) => registry
            .local(&key)
            .and_then(Cluster::coordinator)
            .map(|binding| binding.address),
        ClusterRef::Remote(remote) => Some(remote.coordinator_address),
        ClusterRef::Identity(_) => None,
    }
}
