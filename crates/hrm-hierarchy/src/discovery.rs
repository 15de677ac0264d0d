//! Discovery bookkeeping and DiscoveryEntry construction.
//!
//! Two request kinds exist: RequestCoordinator (who coordinates the clusters
//! around the answering node) and ClusterDiscovery (which clusters lie within
//! a radius, and how they are connected). Both are correlated by a random
//! uuid; the first valid answer satisfies and cancels the request, later ones
//! are logged and discarded. A RequestCoordinator goes to every neighbor
//! under one uuid and stays open while neighbors answer that they know no
//! coordinator.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use hrm_protocol::{
    ClusterName, DiscoveryEntry, NestedDiscovery, NodeName, RoutingVector,
    DISCOVERY_REPLY_TIMEOUT_MS, EXPANSION_MAX_RADIUS,
};

use crate::cluster::{Cluster, CoordinatorBinding};
use crate::graph::RoutableClusterGraph;
use crate::registry::ClusterRegistry;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Maximum cluster distance explored and reported.
    pub radius: u32,
    pub reply_timeout_ms: u64,
    /// Run a ClusterDiscovery toward every newly learned neighbor cluster.
    pub discover_on_new_neighbor: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            radius: EXPANSION_MAX_RADIUS,
            reply_timeout_ms: DISCOVERY_REPLY_TIMEOUT_MS,
            discover_on_new_neighbor: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Coordinator,
    Discovery,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Coordinator => "request_coordinator",
            RequestKind::Discovery => "cluster_discovery",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: RequestKind,
    /// Neighbors that have not answered yet.
    pub peers: BTreeSet<NodeName>,
    pub issued_at: DateTime<Utc>,
}

/// How an answer to a fanned-out request is treated.
#[derive(Debug, Clone)]
pub enum AnswerVerdict {
    /// First useful answer; the request is settled.
    Accepted(PendingRequest),
    /// The last outstanding neighbor answered without anything useful.
    Exhausted(PendingRequest),
    /// Nothing useful, other neighbors are still outstanding.
    Unhelpful,
    /// Late or unknown answer.
    Discarded,
}

/// Outstanding discovery requests of one node.
#[derive(Debug, Default)]
pub struct PendingRequests {
    pending: BTreeMap<Uuid, PendingRequest>,
    discarded: u64,
    expired: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Uuid, kind: RequestKind, peers: impl IntoIterator<Item = NodeName>) {
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                peers: peers.into_iter().collect(),
                issued_at: Utc::now(),
            },
        );
    }

    /// Record an answer from `peer`. A useful answer settles the request;
    /// an empty one only retires that neighbor.
    pub fn answer(&mut self, id: &Uuid, peer: &NodeName, useful: bool) -> AnswerVerdict {
        let Some(request) = self.pending.get_mut(id) else {
            self.discarded += 1;
            tracing::debug!(correlation = %id, peer = %peer, "Discarding answer to a settled request");
            return AnswerVerdict::Discarded;
        };
        if !request.peers.remove(peer) && !useful {
            self.discarded += 1;
            return AnswerVerdict::Discarded;
        }
        if useful {
            return self.pending.remove(id).map(AnswerVerdict::Accepted).unwrap_or(AnswerVerdict::Discarded);
        }
        if !request.peers.is_empty() {
            tracing::debug!(
                correlation = %id,
                peer = %peer,
                outstanding = request.peers.len(),
                "Neighbor knows no coordinator, waiting for the others"
            );
            return AnswerVerdict::Unhelpful;
        }
        self.pending
            .remove(id)
            .map(AnswerVerdict::Exhausted)
            .unwrap_or(AnswerVerdict::Discarded)
    }

    /// Take the request an answer belongs to. `None` for late or unknown
    /// answers, which are counted as discarded.
    pub fn satisfy(&mut self, id: &Uuid) -> Option<PendingRequest> {
        let request = self.pending.remove(id);
        if request.is_none() {
            self.discarded += 1;
            tracing::debug!(correlation = %id, "Discarding answer to a settled request");
        }
        request
    }

    /// Timer expiry. `None` if the request was answered in time.
    pub fn expire(&mut self, id: &Uuid) -> Option<PendingRequest> {
        let request = self.pending.remove(id);
        if let Some(request) = &request {
            self.expired += 1;
            tracing::warn!(
                correlation = %id,
                kind = request.kind.as_str(),
                outstanding = request.peers.len(),
                "Discovery request timed out"
            );
        }
        request
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn expired(&self) -> u64 {
        self.expired
    }
}

/// Path segment from a coordinator to `responder`, derived from the
/// responder's route to the coordinator.
pub fn coordinator_vectors(binding: &CoordinatorBinding, responder: &NodeName) -> Vec<RoutingVector> {
    if binding.is_local() {
        return Vec::new();
    }
    let mut hops: Vec<NodeName> = binding.route.iter().rev().skip(1).cloned().collect();
    hops.retain(|hop| hop != responder && hop != &binding.name);
    vec![RoutingVector {
        source: binding.name.clone(),
        destination: responder.clone(),
        hops,
    }]
}

/// Entry describing a local cluster with a bound coordinator.
pub fn local_entry(
    cluster: &Cluster,
    responder: &NodeName,
    cluster_hops: u32,
    predecessor: Option<ClusterName>,
    foreign: bool,
) -> Option<DiscoveryEntry> {
    let binding = cluster.coordinator()?;
    Some(DiscoveryEntry {
        token: cluster.token(),
        coordinator_name: binding.name.clone(),
        cluster_id: cluster.key().cluster_id,
        coordinator_address: binding.address,
        priority: binding.priority,
        level: cluster.key().level,
        cluster_hops,
        predecessor,
        routing_vectors: coordinator_vectors(binding, responder),
        foreign,
    })
}

/// Entry for any cluster known to the registry.
pub fn entry_for(
    registry: &ClusterRegistry,
    name: &ClusterName,
    responder: &NodeName,
    cluster_hops: u32,
    predecessor: Option<ClusterName>,
    foreign: bool,
) -> Option<DiscoveryEntry> {
    let key = name.key();
    if let Some(cluster) = registry.local(&key) {
        return local_entry(cluster, responder, cluster_hops, predecessor, foreign);
    }
    registry
        .remote(&key)
        .map(|remote| remote.to_discovery_entry(cluster_hops, predecessor))
}

/// Answer one nested discovery: every cluster within `nested.distance` of
/// any of `origins` that the requester does not know yet, plus the graph
/// edges among the reported clusters.
pub fn answer_nested(
    registry: &ClusterRegistry,
    graph: &RoutableClusterGraph<ClusterName>,
    origins: &[ClusterName],
    responder: &NodeName,
    foreign: bool,
    nested: &mut NestedDiscovery,
) {
    let mut reported: BTreeSet<ClusterName> = BTreeSet::new();
    for origin in origins {
        let distances = graph.distances_from(origin);
        for (name, distance) in &distances {
            if *distance > nested.distance || nested.knows_token(name.token) {
                continue;
            }
            let predecessor = if *distance == 0 {
                None
            } else {
                Some(*origin)
            };
            if let Some(entry) = entry_for(registry, name, responder, distance + 1, predecessor, foreign) {
                nested.add_discovery_entry(entry);
                reported.insert(*name);
            }
        }
    }
    for link in graph.links() {
        if reported.contains(&link.from) && reported.contains(&link.to) {
            nested.add_neighbor_relation(link.from, link.to);
        }
    }
}

/// Answer a RequestCoordinator: every local cluster on `level` with a known
/// coordinator at one hop, plus every graph cluster within `radius` of them.
pub fn coordinator_entries(
    registry: &ClusterRegistry,
    graph: &RoutableClusterGraph<ClusterName>,
    level: Option<hrm_protocol::HierarchyLevel>,
    radius: u32,
    responder: &NodeName,
    foreign: bool,
) -> Vec<DiscoveryEntry> {
    let mut entries: Vec<DiscoveryEntry> = Vec::new();
    let mut seen: BTreeSet<ClusterName> = BTreeSet::new();
    let locals: Vec<&Cluster> = registry
        .locals()
        .filter(|cluster| level.map(|l| cluster.key().level == l).unwrap_or(true))
        .filter(|cluster| cluster.coordinator().is_some())
        .collect();

    for cluster in &locals {
        let name = cluster.name();
        if let Some(entry) = local_entry(cluster, responder, 1, Some(name), foreign) {
            seen.insert(name);
            entries.push(entry);
        }
    }
    for cluster in &locals {
        let origin = cluster.name();
        for (name, distance) in graph.distances_from(&origin) {
            if distance == 0 || distance > radius || seen.contains(&name) {
                continue;
            }
            if let Some(entry) = entry_for(registry, &name, responder, distance + 1, Some(origin), foreign) {
                seen.insert(name);
                entries.push(entry);
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrm_protocol::{BullyPriority, ClusterKey, HierarchyLevel, L2Address, NodeIdentity};

    fn bound_cluster(id: i64, coordinator: &str, route: &[&str]) -> Cluster {
        let mut cluster = Cluster::new(ClusterKey::new(id, HierarchyLevel::BASE), BullyPriority::new(1.0));
        cluster.set_token(id as i32);
        let identity = NodeIdentity::derived(coordinator.into());
        cluster.set_coordinator(CoordinatorBinding {
            name: coordinator.into(),
            address: L2Address(7),
            priority: BullyPriority::new(3.0),
            signature: identity.sign(HierarchyLevel::BASE),
            token: id as i32,
            epoch: 1,
            channel: route.first().map(|hop| NodeName::from(*hop)),
            route: route.iter().map(|hop| NodeName::from(*hop)).collect(),
        });
        cluster
    }

    #[test]
    fn late_answers_are_discarded() {
        let mut pending = PendingRequests::new();
        let id = Uuid::new_v4();
        pending.insert(id, RequestKind::Discovery, [NodeName::from("peer")]);
        assert!(pending.satisfy(&id).is_some());
        assert!(pending.satisfy(&id).is_none());
        assert_eq!(pending.discarded(), 1);
        assert!(pending.expire(&id).is_none());
    }

    #[test]
    fn fanned_out_request_waits_for_a_useful_answer() {
        let mut pending = PendingRequests::new();
        let id = Uuid::new_v4();
        pending.insert(id, RequestKind::Coordinator, ["a", "b", "c"].map(NodeName::from));

        assert!(matches!(pending.answer(&id, &"a".into(), false), AnswerVerdict::Unhelpful));
        assert!(matches!(pending.answer(&id, &"a".into(), false), AnswerVerdict::Discarded));
        assert!(pending.is_pending(&id));
        match pending.answer(&id, &"b".into(), true) {
            AnswerVerdict::Accepted(request) => assert!(request.peers.contains(&NodeName::from("c"))),
            other => panic!("unexpected verdict {:?}", other),
        }
        assert!(matches!(pending.answer(&id, &"c".into(), true), AnswerVerdict::Discarded));
        assert_eq!(pending.discarded(), 2);
    }

    #[test]
    fn request_ends_when_nobody_knows_a_coordinator() {
        let mut pending = PendingRequests::new();
        let id = Uuid::new_v4();
        pending.insert(id, RequestKind::Coordinator, ["a", "b"].map(NodeName::from));
        assert!(matches!(pending.answer(&id, &"b".into(), false), AnswerVerdict::Unhelpful));
        assert!(matches!(pending.answer(&id, &"a".into(), false), AnswerVerdict::Exhausted(_)));
        assert!(pending.is_empty());
    }

    #[test]
    fn coordinator_vectors_lead_back_to_responder() {
        let cluster = bound_cluster(1, "coord", &["x", "y", "coord"]);
        let vectors = coordinator_vectors(cluster.coordinator().unwrap(), &"me".into());
        assert_eq!(
            RoutingVector::flatten(&vectors),
            vec![NodeName::from("coord"), "y".into(), "x".into(), "me".into()]
        );
    }

    #[test]
    fn local_cluster_reported_at_one_hop() {
        let mut registry = ClusterRegistry::new();
        registry.insert_local(bound_cluster(1, "coord", &["coord"])).unwrap();
        let graph = RoutableClusterGraph::new();
        let entries = coordinator_entries(&registry, &graph, None, 4, &"me".into(), false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cluster_hops, 1);
        assert_eq!(entries[0].coordinator_name, NodeName::from("coord"));
    }
}
