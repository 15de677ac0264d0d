//! Local clusters and remote cluster proxies.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use hrm_protocol::{
    BullyAnnounce, BullyPriority, Candidate, ClusterKey, ClusterName, DiscoveryEntry, Hrmid,
    HrmSignature, L2Address, NeighborClusterAnnounce, NodeName, RoutingVector,
};

/// Order two coordinator claims: candidate first, announcement epoch second.
pub fn claim_order(a: &Candidate, a_epoch: u64, b: &Candidate, b_epoch: u64) -> Ordering {
    a.cmp(b).then(a_epoch.cmp(&b_epoch))
}

/// Whether the physical path `origin` -> `route` uses the link between `a`
/// and `b`, in either direction.
pub fn route_crosses(origin: &NodeName, route: &[NodeName], a: &NodeName, b: &NodeName) -> bool {
    let path: Vec<&NodeName> = std::iter::once(origin).chain(route.iter()).collect();
    path.windows(2)
        .any(|pair| (pair[0] == a && pair[1] == b) || (pair[0] == b && pair[1] == a))
}

/// A logical channel to another member of the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberChannel {
    pub peer: NodeName,
    /// Physical hops to the peer; a single element for direct neighbors.
    pub route: Vec<NodeName>,
    pub priority: BullyPriority,
}

impl MemberChannel {
    pub fn direct(peer: NodeName) -> Self {
        Self {
            route: vec![peer.clone()],
            peer,
            priority: BullyPriority::UNDEFINED,
        }
    }

    pub fn routed(peer: NodeName, route: Vec<NodeName>) -> Self {
        let route = if route.is_empty() {
            vec![peer.clone()]
        } else {
            route
        };
        Self {
            peer,
            route,
            priority: BullyPriority::UNDEFINED,
        }
    }

    pub fn next_hop(&self) -> &NodeName {
        self.route.first().unwrap_or(&self.peer)
    }
}

/// The coordinator a cluster currently follows.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorBinding {
    pub name: NodeName,
    pub address: L2Address,
    pub priority: BullyPriority,
    pub signature: HrmSignature,
    pub token: i32,
    pub epoch: u64,
    /// Member through which the coordinator is reached; `None` when this
    /// node is the coordinator.
    pub channel: Option<NodeName>,
    /// Physical hops to the coordinator.
    pub route: Vec<NodeName>,
}

impl CoordinatorBinding {
    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.name.clone(), self.priority)
    }

    pub fn is_local(&self) -> bool {
        self.channel.is_none()
    }

    /// Whether the way from `local` to the coordinator uses the link between
    /// `a` and `b`.
    pub fn reached_across(&self, local: &NodeName, a: &NodeName, b: &NodeName) -> bool {
        !self.is_local() && route_crosses(local, &self.route, a, b)
    }
}

/// A cluster this node is a member of.
#[derive(Debug, Clone)]
pub struct Cluster {
    key: ClusterKey,
    token: i32,
    priority: BullyPriority,
    members: BTreeMap<NodeName, MemberChannel>,
    highest_seen: Option<Candidate>,
    coordinator: Option<CoordinatorBinding>,
    /// Last accepted (or issued) announcement, re-sent to late joiners.
    last_announce: Option<BullyAnnounce>,
    buffered: Vec<NeighborClusterAnnounce>,
    /// Whether the cluster borders a foreign domain.
    boundary: bool,
    hrmid: Option<Hrmid>,
    awaiting_topology: bool,
    /// Bumped whenever the coordinator binding changes; timers carry it.
    generation: u64,
    alive_sent: u64,
    alive_seen: u64,
    /// Coordinator declared dead, with the epoch it died in.
    failed_coordinator: Option<(NodeName, u64)>,
    /// Election winners that never announced.
    suspects: BTreeSet<NodeName>,
}

impl Cluster {
    pub fn new(key: ClusterKey, priority: BullyPriority) -> Self {
        Self {
            key,
            token: 0,
            priority,
            members: BTreeMap::new(),
            highest_seen: None,
            coordinator: None,
            last_announce: None,
            buffered: Vec::new(),
            boundary: false,
            hrmid: None,
            awaiting_topology: false,
            generation: 0,
            alive_sent: 0,
            alive_seen: 0,
            failed_coordinator: None,
            suspects: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> ClusterKey {
        self.key
    }

    /// Current identity triple. The token is zero until a coordinator exists.
    pub fn name(&self) -> ClusterName {
        ClusterName::new(self.token, self.key.cluster_id, self.key.level)
    }

    pub fn token(&self) -> i32 {
        self.token
    }

    /// Switch to a new incarnation, returning the previous identity.
    pub fn set_token(&mut self, token: i32) -> ClusterName {
        let old = self.name();
        self.token = token;
        old
    }

    pub fn priority(&self) -> BullyPriority {
        self.priority
    }

    pub fn increase_connectivity(&mut self, offset: f64) {
        self.priority.increase_connectivity(offset);
    }

    pub fn own_candidate(&self, local: &NodeName) -> Candidate {
        Candidate::new(local.clone(), self.priority)
    }

    // ── Membership ──

    /// Add a member, keeping the shorter route if it is already known.
    pub fn add_member(&mut self, channel: MemberChannel) -> bool {
        match self.members.get_mut(&channel.peer) {
            Some(existing) => {
                if channel.route.len() < existing.route.len() {
                    existing.route = channel.route;
                }
                false
            }
            None => {
                self.members.insert(channel.peer.clone(), channel);
                true
            }
        }
    }

    pub fn remove_member(&mut self, peer: &NodeName) -> Option<MemberChannel> {
        self.members.remove(peer)
    }

    /// Drop every member whose channel from `local` uses the link between
    /// `a` and `b`. Returns the dropped members.
    pub fn drop_members_crossing(&mut self, local: &NodeName, a: &NodeName, b: &NodeName) -> Vec<NodeName> {
        let lost: Vec<NodeName> = self
            .members
            .values()
            .filter(|member| route_crosses(local, &member.route, a, b))
            .map(|member| member.peer.clone())
            .collect();
        for peer in &lost {
            self.members.remove(peer);
        }
        lost
    }

    pub fn has_member(&self, peer: &NodeName) -> bool {
        self.members.contains_key(peer)
    }

    pub fn member(&self, peer: &NodeName) -> Option<&MemberChannel> {
        self.members.get(peer)
    }

    /// Snapshot of member names.
    pub fn member_names(&self) -> Vec<NodeName> {
        self.members.keys().cloned().collect()
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberChannel> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn record_priority(&mut self, peer: &NodeName, priority: BullyPriority) {
        if let Some(member) = self.members.get_mut(peer) {
            member.priority = priority;
        }
    }

    /// Members not yet in `already_informed`, which is extended with them.
    pub fn broadcast_targets(&self, already_informed: &mut BTreeSet<NodeName>) -> Vec<MemberChannel> {
        let mut targets = Vec::new();
        for member in self.members.values() {
            if already_informed.insert(member.peer.clone()) {
                targets.push(member.clone());
            }
        }
        targets
    }

    // ── Election state ──

    /// Raise the highest-priority watermark. Returns true if it moved.
    pub fn observe(&mut self, candidate: Candidate) -> bool {
        if candidate.priority.is_undefined() {
            return false;
        }
        let raise = self
            .highest_seen
            .as_ref()
            .map(|seen| candidate > *seen)
            .unwrap_or(true);
        if raise {
            self.highest_seen = Some(candidate);
        }
        raise
    }

    pub fn highest_seen(&self) -> Option<&Candidate> {
        self.highest_seen.as_ref()
    }

    pub fn reset_highest_seen(&mut self) {
        self.highest_seen = None;
    }

    pub fn coordinator(&self) -> Option<&CoordinatorBinding> {
        self.coordinator.as_ref()
    }

    pub fn is_coordinator(&self, local: &NodeName) -> bool {
        self.coordinator
            .as_ref()
            .map(|binding| binding.is_local() && &binding.name == local)
            .unwrap_or(false)
    }

    pub fn set_coordinator(&mut self, binding: CoordinatorBinding) {
        self.coordinator = Some(binding);
        self.generation += 1;
        self.alive_seen = 0;
    }

    pub fn clear_coordinator(&mut self) -> Option<CoordinatorBinding> {
        self.generation += 1;
        self.awaiting_topology = false;
        self.coordinator.take()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_announce(&self) -> Option<&BullyAnnounce> {
        self.last_announce.as_ref()
    }

    pub fn set_last_announce(&mut self, announce: BullyAnnounce) {
        self.last_announce = Some(announce);
    }

    pub fn mark_failed(&mut self, coordinator: NodeName, epoch: u64) {
        if self
            .highest_seen
            .as_ref()
            .map(|seen| seen.name == coordinator)
            .unwrap_or(false)
        {
            self.highest_seen = None;
        }
        self.failed_coordinator = Some((coordinator, epoch));
    }

    /// Whether an announcement belongs to a coordinator declared dead.
    pub fn is_failed_claim(&self, coordinator: &NodeName, epoch: u64) -> bool {
        self.failed_coordinator
            .as_ref()
            .map(|(name, dead_epoch)| name == coordinator && epoch <= *dead_epoch)
            .unwrap_or(false)
    }

    /// Whether the node was declared dead.
    pub fn is_failed(&self, name: &NodeName) -> bool {
        self.failed_coordinator
            .as_ref()
            .map(|(dead, _)| dead == name)
            .unwrap_or(false)
    }

    /// A coordinator declared dead came back with a newer epoch.
    pub fn forgive(&mut self, name: &NodeName) {
        if self.is_failed(name) {
            self.failed_coordinator = None;
        }
    }

    pub fn suspect(&mut self, name: NodeName) {
        self.suspects.insert(name);
    }

    pub fn clear_suspects(&mut self) {
        self.suspects.clear();
    }

    /// Candidates that must not win the next round.
    pub fn is_excluded(&self, name: &NodeName) -> bool {
        self.is_failed(name) || self.suspects.contains(name)
    }

    // ── Neighbor announcements buffered before a coordinator existed ──

    pub fn buffer_announcement(&mut self, announce: NeighborClusterAnnounce) {
        let duplicate = self.buffered.iter().any(|buffered| {
            buffered.cluster_name() == announce.cluster_name() && buffered.epoch == announce.epoch
        });
        if !duplicate {
            self.buffered.push(announce);
        }
    }

    pub fn take_buffered(&mut self) -> Vec<NeighborClusterAnnounce> {
        std::mem::take(&mut self.buffered)
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    // ── Misc ──

    pub fn is_boundary(&self) -> bool {
        self.boundary
    }

    pub fn set_boundary(&mut self, boundary: bool) {
        self.boundary = boundary;
    }

    pub fn hrmid(&self) -> Option<Hrmid> {
        self.hrmid
    }

    pub fn set_hrmid(&mut self, hrmid: Hrmid) {
        self.hrmid = Some(hrmid);
        self.awaiting_topology = false;
    }

    pub fn is_awaiting_topology(&self) -> bool {
        self.awaiting_topology
    }

    pub fn set_awaiting_topology(&mut self, waiting: bool) {
        self.awaiting_topology = waiting;
    }

    pub fn next_alive_sequence(&mut self) -> u64 {
        self.alive_sent += 1;
        self.alive_sent
    }

    /// Accept a heartbeat sequence number once.
    pub fn accept_alive(&mut self, sequence: u64) -> bool {
        if sequence > self.alive_seen {
            self.alive_seen = sequence;
            true
        } else {
            false
        }
    }
}

/// Read-only proxy of a cluster known only through gossip.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborCluster {
    pub name: ClusterName,
    pub coordinator_name: NodeName,
    pub coordinator_address: L2Address,
    pub priority: BullyPriority,
    pub epoch: u64,
    /// Absent for clusters learned through discovery.
    pub signature: Option<HrmSignature>,
    /// Node whose channel delivered the announcement.
    pub announcer: NodeName,
    /// Local cluster the announcement was received for.
    pub via: ClusterKey,
    pub cluster_hops: u32,
    pub routing_vectors: Vec<RoutingVector>,
    /// Physical hops from this node to the coordinator.
    pub route_to_coordinator: Vec<NodeName>,
    pub foreign: bool,
}

impl NeighborCluster {
    pub fn from_announce(
        announce: &NeighborClusterAnnounce,
        announcer: NodeName,
        via: ClusterKey,
        local: &NodeName,
    ) -> Self {
        Self {
            name: announce.cluster_name(),
            coordinator_name: announce.coordinator_name.clone(),
            coordinator_address: announce.coordinator_address,
            priority: announce.priority,
            epoch: announce.epoch,
            signature: Some(announce.coordinator_signature.clone()),
            announcer,
            via,
            cluster_hops: 1,
            routing_vectors: announce.routing_vectors.clone(),
            route_to_coordinator: RoutingVector::route_back(&announce.routing_vectors, local),
            foreign: announce.foreign,
        }
    }

    pub fn from_discovery(entry: &DiscoveryEntry, announcer: NodeName, via: ClusterKey, local: &NodeName) -> Self {
        Self {
            name: entry.cluster_name(),
            coordinator_name: entry.coordinator_name.clone(),
            coordinator_address: entry.coordinator_address,
            priority: entry.priority,
            epoch: 0,
            signature: None,
            announcer,
            via,
            cluster_hops: entry.cluster_hops,
            routing_vectors: entry.routing_vectors.clone(),
            route_to_coordinator: RoutingVector::route_back(&entry.routing_vectors, local),
            foreign: entry.foreign,
        }
    }

    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.coordinator_name.clone(), self.priority)
    }

    /// Re-issue the announcement this proxy was built from. Clusters known
    /// only through discovery carry no signature and cannot be re-announced.
    pub fn to_announce(&self) -> Option<NeighborClusterAnnounce> {
        let signature = self.signature.clone()?;
        Some(NeighborClusterAnnounce {
            coordinator_name: self.coordinator_name.clone(),
            coordinator_signature: signature,
            coordinator_address: self.coordinator_address,
            token: self.name.token,
            cluster_id: self.name.cluster_id,
            level: self.name.level,
            priority: self.priority,
            epoch: self.epoch,
            routing_vectors: self.routing_vectors.clone(),
            rejected: false,
            foreign: self.foreign,
        })
    }

    pub fn to_discovery_entry(&self, cluster_hops: u32, predecessor: Option<ClusterName>) -> DiscoveryEntry {
        DiscoveryEntry {
            token: self.name.token,
            coordinator_name: self.coordinator_name.clone(),
            cluster_id: self.name.cluster_id,
            coordinator_address: self.coordinator_address,
            priority: self.priority,
            level: self.name.level,
            cluster_hops,
            predecessor,
            routing_vectors: self.routing_vectors.clone(),
            foreign: self.foreign,
        }
    }
}

/// Any cluster reference, resolved through the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterRef {
    /// Held by this node.
    Local(ClusterKey),
    /// Known through gossip.
    Remote(NeighborCluster),
    /// Only the identity is known.
    Identity(ClusterName),
}

impl ClusterRef {
    pub fn is_local(&self) -> bool {
        matches!(self, ClusterRef::Local(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrm_protocol::HierarchyLevel;

    fn key() -> ClusterKey {
        ClusterKey::new(5, HierarchyLevel::BASE)
    }

    #[test]
    fn watermark_only_rises() {
        let mut cluster = Cluster::new(key(), BullyPriority::new(1.0));
        assert!(cluster.observe(Candidate::new("b".into(), BullyPriority::new(3.0))));
        assert!(!cluster.observe(Candidate::new("a".into(), BullyPriority::new(2.0))));
        assert!(!cluster.observe(Candidate::new("z".into(), BullyPriority::UNDEFINED)));
        assert_eq!(cluster.highest_seen().unwrap().name, NodeName::from("b"));
    }

    #[test]
    fn broadcast_targets_skip_informed() {
        let mut cluster = Cluster::new(key(), BullyPriority::new(1.0));
        for peer in ["a", "b", "c"] {
            cluster.add_member(MemberChannel::direct(peer.into()));
        }
        let mut informed: BTreeSet<NodeName> = ["b".into()].into_iter().collect();
        let targets: Vec<NodeName> = cluster
            .broadcast_targets(&mut informed)
            .into_iter()
            .map(|m| m.peer)
            .collect();
        assert_eq!(targets, vec![NodeName::from("a"), "c".into()]);
        assert!(cluster.broadcast_targets(&mut informed).is_empty());
    }

    #[test]
    fn shorter_member_route_wins() {
        let mut cluster = Cluster::new(key(), BullyPriority::new(1.0));
        cluster.add_member(MemberChannel::routed("x".into(), vec!["a".into(), "b".into(), "x".into()]));
        assert!(!cluster.add_member(MemberChannel::routed("x".into(), vec!["c".into(), "x".into()])));
        assert_eq!(cluster.member(&"x".into()).unwrap().route.len(), 2);
        assert_eq!(cluster.member(&"x".into()).unwrap().next_hop(), &NodeName::from("c"));
    }

    #[test]
    fn members_behind_a_lost_link_are_dropped() {
        let mut cluster = Cluster::new(key(), BullyPriority::new(1.0));
        cluster.add_member(MemberChannel::direct("a".into()));
        cluster.add_member(MemberChannel::direct("b".into()));
        cluster.add_member(MemberChannel::routed("x".into(), vec!["b".into(), "x".into()]));
        cluster.add_member(MemberChannel::routed("y".into(), vec!["b".into(), "x".into(), "y".into()]));

        let lost = cluster.drop_members_crossing(&"me".into(), &"x".into(), &"b".into());
        assert_eq!(lost, vec![NodeName::from("x"), "y".into()]);
        assert_eq!(cluster.member_names(), vec![NodeName::from("a"), "b".into()]);

        let lost = cluster.drop_members_crossing(&"me".into(), &"me".into(), &"b".into());
        assert_eq!(lost, vec![NodeName::from("b")]);
        assert_eq!(cluster.member_count(), 1);
    }

    #[test]
    fn crossing_ignores_direction_and_unrelated_links() {
        let route: Vec<NodeName> = vec!["b".into(), "c".into()];
        assert!(route_crosses(&"a".into(), &route, &"c".into(), &"b".into()));
        assert!(route_crosses(&"a".into(), &route, &"a".into(), &"b".into()));
        assert!(!route_crosses(&"a".into(), &route, &"a".into(), &"c".into()));
        assert!(!route_crosses(&"a".into(), &[], &"a".into(), &"b".into()));
    }

    #[test]
    fn alive_sequences_accepted_once() {
        let mut cluster = Cluster::new(key(), BullyPriority::new(1.0));
        assert!(cluster.accept_alive(1));
        assert!(!cluster.accept_alive(1));
        assert!(cluster.accept_alive(3));
        assert!(!cluster.accept_alive(2));
    }

    #[test]
    fn claims_order_by_candidate_then_epoch() {
        let a = Candidate::new("a".into(), BullyPriority::new(2.0));
        let b = Candidate::new("b".into(), BullyPriority::new(1.0));
        assert_eq!(claim_order(&a, 1, &b, 9), Ordering::Greater);
        assert_eq!(claim_order(&a, 1, &a, 2), Ordering::Less);
        assert_eq!(claim_order(&a, 2, &a, 2), Ordering::Equal);
    }
}
