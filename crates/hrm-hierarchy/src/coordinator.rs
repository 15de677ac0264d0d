//! Coordinator duties: hierarchical address assignment and forwarding-table
//! synthesis for the members of one cluster.
//!
//! At the base level the members are nodes. The coordinator takes digit 1,
//! the remaining members are numbered in name order, and every member gets a
//! TopologyData push with one entry per other member plus gateway entries
//! toward the cluster prefixes handed down from the level above.
//!
//! At higher levels the members are coordinators of the level below and the
//! addressed units are their clusters. Each cluster gets a prefix digit and
//! entries toward every other cluster, computed over the cluster graph.

use std::collections::{BTreeMap, BTreeSet};

use hrm_protocol::{
    BullyPriority, ClusterKey, ClusterName, FibEntry, Hrmid, HrmSignature, L2Address, NodeIdentity,
    NodeName, TopologyData,
};

use crate::cluster::route_crosses;
use crate::graph::{LinkType, RoutableClusterGraph};
use crate::HierarchyError;

/// What a coordinator knows about one member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub name: NodeName,
    pub address: L2Address,
    pub priority: BullyPriority,
    /// Physical route from the coordinator to the member, member last.
    /// Empty for the coordinator itself.
    pub route: Vec<NodeName>,
    /// Other clusters the member belongs to (base level) or represents
    /// (higher levels).
    pub attached_clusters: Vec<ClusterName>,
}

/// One TopologyData push.
#[derive(Debug, Clone)]
pub struct TopologyPush {
    pub member: NodeName,
    /// Route to the member; empty when the member is the coordinator.
    pub route: Vec<NodeName>,
    pub data: TopologyData,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    cluster: ClusterKey,
    local: NodeName,
    prefix: Hrmid,
    members: BTreeMap<NodeName, MemberRecord>,
    /// Inter-cluster entries received from the coordinator one level up.
    superior_entries: Vec<FibEntry>,
    superior_signature: Option<HrmSignature>,
    distribution_armed: bool,
    distributions: u64,
}

impl Coordinator {
    pub fn new(cluster: ClusterKey, local: NodeName, address: L2Address, priority: BullyPriority) -> Self {
        let mut members = BTreeMap::new();
        members.insert(
            local.clone(),
            MemberRecord {
                name: local.clone(),
                address,
                priority,
                route: Vec::new(),
                attached_clusters: Vec::new(),
            },
        );
        Self {
            cluster,
            local,
            prefix: Hrmid::UNASSIGNED,
            members,
            superior_entries: Vec::new(),
            superior_signature: None,
            distribution_armed: false,
            distributions: 0,
        }
    }

    pub fn cluster(&self) -> ClusterKey {
        self.cluster
    }

    pub fn prefix(&self) -> Hrmid {
        self.prefix
    }

    fn level_digit(&self) -> u32 {
        self.cluster.level.value().max(0) as u32
    }

    /// Record or refresh a member. Returns true if anything changed.
    pub fn add_member(&mut self, record: MemberRecord) -> bool {
        match self.members.get(&record.name) {
            Some(existing) if *existing == record => false,
            Some(existing) if existing.route.len() < record.route.len() => {
                let mut merged = record;
                merged.route = existing.route.clone();
                let changed = self.members.get(&merged.name) != Some(&merged);
                self.members.insert(merged.name.clone(), merged);
                changed
            }
            _ => {
                self.members.insert(record.name.clone(), record);
                true
            }
        }
    }

    pub fn remove_member(&mut self, name: &NodeName) -> bool {
        if name == &self.local {
            return false;
        }
        self.members.remove(name).is_some()
    }

    /// Drop every member reached over the link between `a` and `b`.
    pub fn remove_members_crossing(&mut self, a: &NodeName, b: &NodeName) -> Vec<NodeName> {
        let lost: Vec<NodeName> = self
            .members
            .values()
            .filter(|record| record.name != self.local && route_crosses(&self.local, &record.route, a, b))
            .map(|record| record.name.clone())
            .collect();
        for name in &lost {
            self.members.remove(name);
        }
        lost
    }

    pub fn member(&self, name: &NodeName) -> Option<&MemberRecord> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberRecord> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Set attached clusters of the coordinator itself.
    pub fn set_local_attachments(&mut self, clusters: Vec<ClusterName>) {
        if let Some(own) = self.members.get_mut(&self.local) {
            own.attached_clusters = clusters;
        }
    }

    // ── Distribution scheduling ──

    /// Returns true if a distribution timer must be armed.
    pub fn arm_distribution(&mut self) -> bool {
        if self.distribution_armed {
            return false;
        }
        self.distribution_armed = true;
        true
    }

    pub fn distribution_fired(&mut self) {
        self.distribution_armed = false;
        self.distributions += 1;
    }

    pub fn distributions(&self) -> u64 {
        self.distributions
    }

    /// Adopt the prefix and entries handed down from the level above.
    /// Returns true if the prefix changed.
    pub fn apply_superior(
        &mut self,
        prefix: Hrmid,
        entries: Vec<FibEntry>,
        signature: HrmSignature,
    ) -> bool {
        let changed = prefix != self.prefix;
        self.prefix = prefix;
        self.superior_entries = entries;
        self.superior_signature = Some(signature);
        changed
    }

    pub fn superior_entries(&self) -> &[FibEntry] {
        &self.superior_entries
    }

    // ── Base level ──

    /// Hierarchical address of every member: the coordinator takes digit 1,
    /// the others follow in name order.
    pub fn assign_addresses(&self) -> Result<BTreeMap<NodeName, Hrmid>, HierarchyError> {
        let level = self.level_digit();
        let mut assigned = BTreeMap::new();
        assigned.insert(self.local.clone(), self.prefix.with_level_address(level, 1)?);
        let mut digit = 2u64;
        for name in self.members.keys() {
            if name == &self.local {
                continue;
            }
            assigned.insert(name.clone(), self.prefix.with_level_address(level, digit)?);
            digit += 1;
        }
        Ok(assigned)
    }

    /// Physical topology among members, as learned from member routes.
    pub fn member_graph(&self) -> RoutableClusterGraph<NodeName> {
        let mut graph = RoutableClusterGraph::new();
        graph.add_node(self.local.clone());
        for record in self.members.values() {
            let mut previous = self.local.clone();
            for hop in &record.route {
                graph.store_link(previous.clone(), hop.clone(), LinkType::PhysicalLink);
                previous = hop.clone();
            }
        }
        graph
    }

    /// Gateway toward `cluster`: the member attached to it with the
    /// smallest name.
    pub fn gateway_for(&self, cluster: &ClusterName) -> Option<&NodeName> {
        self.members
            .values()
            .filter(|record| record.attached_clusters.iter().any(|c| c.key() == cluster.key()))
            .map(|record| &record.name)
            .min()
    }

    /// One TopologyData per member of a base-level cluster.
    pub fn build_member_topology<F>(
        &self,
        cluster_name: ClusterName,
        identity: &NodeIdentity,
        address_of: F,
    ) -> Result<Vec<TopologyPush>, HierarchyError>
    where
        F: Fn(&NodeName) -> Option<L2Address>,
    {
        let assigned = self.assign_addresses()?;
        let graph = self.member_graph();
        let signature = identity.sign(self.cluster.level);
        let resolve = |name: &NodeName| {
            self.members
                .get(name)
                .map(|record| record.address)
                .or_else(|| address_of(name))
        };

        let mut pushes = Vec::new();
        for (source, source_hrmid) in &assigned {
            let mut data = TopologyData::new(*source_hrmid, cluster_name, signature.clone());
            if let Some(chain) = &self.superior_signature {
                data.add_approved_signature(chain.clone());
            }

            for (destination, destination_hrmid) in &assigned {
                if destination == source {
                    continue;
                }
                let path = graph.get_intermediate_nodes(source, destination);
                let Some(next_hop) = path.first().and_then(|hop| resolve(hop)) else {
                    continue;
                };
                data.add_entry(FibEntry {
                    destination: *destination_hrmid,
                    next_hop,
                    next_cluster: cluster_name,
                    farthest_cluster: Some(cluster_name),
                    signature: signature.clone(),
                    routing_vectors: Vec::new(),
                });
            }

            for upper in &self.superior_entries {
                if upper.destination == self.prefix {
                    continue;
                }
                let Some(gateway) = self.gateway_for(&upper.next_cluster) else {
                    continue;
                };
                if gateway == source {
                    continue;
                }
                let path = graph.get_intermediate_nodes(source, gateway);
                let Some(next_hop) = path.first().and_then(|hop| resolve(hop)) else {
                    continue;
                };
                data.add_entry(FibEntry {
                    destination: upper.destination,
                    next_hop,
                    next_cluster: upper.next_cluster,
                    farthest_cluster: upper.farthest_cluster,
                    signature: signature.clone(),
                    routing_vectors: upper.routing_vectors.clone(),
                });
            }

            data.seal(identity);
            let route = self
                .members
                .get(source)
                .map(|record| record.route.clone())
                .unwrap_or_default();
            pushes.push(TopologyPush {
                member: source.clone(),
                route,
                data,
            });
        }
        Ok(pushes)
    }

    // ── Higher levels ──

    /// Prefix of every represented cluster, numbered in cluster order.
    pub fn assign_cluster_prefixes(&self) -> Result<BTreeMap<ClusterKey, Hrmid>, HierarchyError> {
        let level = self.level_digit();
        let keys: BTreeSet<ClusterKey> = self
            .members
            .values()
            .flat_map(|record| record.attached_clusters.iter().map(|c| c.key()))
            .collect();
        let mut prefixes = BTreeMap::new();
        for (index, key) in keys.into_iter().enumerate() {
            prefixes.insert(key, self.prefix.with_level_address(level, index as u64 + 1)?);
        }
        Ok(prefixes)
    }

    /// One TopologyData per represented cluster, with entries toward every
    /// other represented cluster. `next_cluster` is the first cluster on the
    /// graph path and `farthest_cluster` the last one still within `radius`.
    pub fn build_cluster_topology<F>(
        &self,
        graph: &RoutableClusterGraph<ClusterName>,
        radius: u32,
        identity: &NodeIdentity,
        coordinator_address: F,
    ) -> Result<Vec<TopologyPush>, HierarchyError>
    where
        F: Fn(&ClusterName) -> Option<L2Address>,
    {
        let prefixes = self.assign_cluster_prefixes()?;
        let signature = identity.sign(self.cluster.level);
        let by_key: BTreeMap<ClusterKey, ClusterName> = graph
            .nodes()
            .into_iter()
            .map(|name| (name.key(), name))
            .collect();
        let represented_address = |cluster: &ClusterName| {
            self.members
                .values()
                .find(|record| record.attached_clusters.iter().any(|c| c.key() == cluster.key()))
                .map(|record| record.address)
                .or_else(|| coordinator_address(cluster))
        };

        let mut pushes = Vec::new();
        for record in self.members.values() {
            for attached in &record.attached_clusters {
                let Some(prefix) = prefixes.get(&attached.key()) else {
                    continue;
                };
                let source = by_key.get(&attached.key()).copied().unwrap_or(*attached);
                let mut data = TopologyData::new(*prefix, *attached, signature.clone());

                for (target_key, target_prefix) in &prefixes {
                    if *target_key == attached.key() {
                        continue;
                    }
                    let Some(target) = by_key.get(target_key) else {
                        continue;
                    };
                    let path = graph.get_intermediate_nodes(&source, target);
                    let Some(next_cluster) = path.first().copied() else {
                        continue;
                    };
                    let reach = (radius.max(1) as usize).min(path.len());
                    let farthest = path[reach - 1];
                    let Some(next_hop) = represented_address(&next_cluster) else {
                        continue;
                    };
                    data.add_entry(FibEntry {
                        destination: *target_prefix,
                        next_hop,
                        next_cluster,
                        farthest_cluster: Some(farthest),
                        signature: signature.clone(),
                        routing_vectors: Vec::new(),
                    });
                }

                data.seal(identity);
                pushes.push(TopologyPush {
                    member: record.name.clone(),
                    route: record.route.clone(),
                    data,
                });
            }
        }
        Ok(pushes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrm_protocol::HierarchyLevel;

    fn record(name: &str, address: u64, route: &[&str], attached: Vec<ClusterName>) -> MemberRecord {
        MemberRecord {
            name: name.into(),
            address: L2Address(address),
            priority: BullyPriority::new(1.0),
            route: route.iter().map(|hop| NodeName::from(*hop)).collect(),
            attached_clusters: attached,
        }
    }

    fn base() -> ClusterKey {
        ClusterKey::new(10, HierarchyLevel::BASE)
    }

    #[test]
    fn coordinator_takes_first_digit() {
        let mut coordinator = Coordinator::new(base(), "m".into(), L2Address(1), BullyPriority::new(5.0));
        coordinator.add_member(record("a", 2, &["a"], Vec::new()));
        coordinator.add_member(record("z", 3, &["a", "z"], Vec::new()));
        let assigned = coordinator.assign_addresses().unwrap();
        assert_eq!(assigned[&NodeName::from("m")].to_string(), "0.0.1");
        assert_eq!(assigned[&NodeName::from("a")].to_string(), "0.0.2");
        assert_eq!(assigned[&NodeName::from("z")].to_string(), "0.0.3");
    }

    #[test]
    fn member_entries_follow_member_paths() {
        let identity = NodeIdentity::derived("m".into());
        let mut coordinator = Coordinator::new(base(), "m".into(), L2Address(1), BullyPriority::new(5.0));
        coordinator.add_member(record("a", 2, &["a"], Vec::new()));
        coordinator.add_member(record("z", 3, &["a", "z"], Vec::new()));
        let name = ClusterName::new(4, 10, HierarchyLevel::BASE);
        let pushes = coordinator.build_member_topology(name, &identity, |_| None).unwrap();
        assert_eq!(pushes.len(), 3);

        let to_m = pushes.iter().find(|p| p.member.as_str() == "z").unwrap();
        let entry = to_m
            .data
            .entries()
            .iter()
            .find(|e| e.destination.to_string() == "0.0.1")
            .unwrap();
        assert_eq!(entry.next_hop, L2Address(2));
        assert_eq!(to_m.route, vec![NodeName::from("a"), "z".into()]);
        assert!(pushes.iter().all(|push| push.data.verify().is_ok()));
    }

    #[test]
    fn members_behind_a_lost_link_are_removed() {
        let mut coordinator = Coordinator::new(base(), "m".into(), L2Address(1), BullyPriority::new(5.0));
        coordinator.add_member(record("a", 2, &["a"], Vec::new()));
        coordinator.add_member(record("z", 3, &["a", "z"], Vec::new()));
        coordinator.add_member(record("q", 4, &["q"], Vec::new()));

        assert_eq!(coordinator.remove_members_crossing(&"z".into(), &"a".into()), vec![NodeName::from("z")]);
        assert_eq!(
            coordinator.remove_members_crossing(&"m".into(), &"a".into()),
            vec![NodeName::from("a")]
        );
        let left: Vec<NodeName> = coordinator.members().map(|record| record.name.clone()).collect();
        assert_eq!(left, vec![NodeName::from("m"), "q".into()]);
    }

    #[test]
    fn cluster_prefixes_and_farthest_within_radius() {
        let identity = NodeIdentity::derived("m".into());
        let level1 = ClusterKey::new(99, HierarchyLevel::new(1));
        let c = |id: i64| ClusterName::new(id as i32, id, HierarchyLevel::BASE);
        let mut graph = RoutableClusterGraph::new();
        graph.store_link(c(1), c(2), LinkType::LogicalLink);
        graph.store_link(c(2), c(3), LinkType::LogicalLink);

        let mut coordinator = Coordinator::new(level1, "m".into(), L2Address(1), BullyPriority::new(5.0));
        coordinator.set_local_attachments(vec![c(1)]);
        coordinator.add_member(record("b", 2, &["x", "b"], vec![c(2)]));
        coordinator.add_member(record("d", 3, &["x", "b", "d"], vec![c(3)]));

        let prefixes = coordinator.assign_cluster_prefixes().unwrap();
        assert_eq!(prefixes[&c(1).key()].to_string(), "0.1.0");
        assert_eq!(prefixes[&c(3).key()].to_string(), "0.3.0");

        let pushes = coordinator.build_cluster_topology(&graph, 1, &identity, |_| None).unwrap();
        let own = pushes.iter().find(|p| p.data.cluster == c(1)).unwrap();
        let toward_three = own
            .data
            .entries()
            .iter()
            .find(|e| e.destination.to_string() == "0.3.0")
            .unwrap();
        assert_eq!(toward_three.next_cluster, c(2));
        assert_eq!(toward_three.farthest_cluster, Some(c(2)));
        assert_eq!(toward_three.next_hop, L2Address(2));
    }
}
