//! Per-node HRM engine.
//!
//! [`HrmController`] owns every cluster, elector and coordinator of one node
//! and the node's view of the cluster graph and routing table. It performs
//! no I/O: inbound frames and fired timers are fed in, and the resulting
//! frames (addressed to a direct neighbor) and timer requests are returned
//! as [`Actions`] for the runtime to carry out. All handlers run to
//! completion on `&mut self`, which serializes mutation per node.

mod elect;
mod gossip;
mod lookup;
mod routing;
mod topology;

pub use routing::RouteOutcome;

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use hrm_network::NameService;
use hrm_protocol::{
    BullyPriority, Candidate, ClusterKey, ClusterName, Envelope, HierarchyLevel, Hrmid, HrmMessage,
    InformClusterLeft, L2Address, NodeIdentity, NodeName, ProtocolError, RequestCoordinator, RoutingVector,
    ADDRESS_DISTRIBUTION_DELAY_MS, CONNECTIVITY_PRIORITY_OFFSET, DEFAULT_DOMAIN, DEFAULT_HIERARCHY_HEIGHT,
};
use hrm_state::{ApprovedSignatures, RoutingTable};

use crate::cluster::{route_crosses, Cluster, MemberChannel, NeighborCluster};
use crate::coordinator::Coordinator;
use crate::discovery::{DiscoveryConfig, PendingRequests};
use crate::elections::{ElectionConfig, ElectionRegistry, ElectorState};
use crate::graph::{shared_graph, RoutableClusterGraph, SharedClusterGraph};
use crate::liveness::{CoordinatorMonitor, LivenessConfig};
use crate::registry::ClusterRegistry;
use crate::HierarchyError;

/// Routing table shared with route consumers.
pub type SharedRoutingTable = Arc<RwLock<RoutingTable>>;

/// Protocol configuration of one node.
#[derive(Debug, Clone)]
pub struct HrmConfig {
    /// Number of hierarchy levels, base level included.
    pub height: u8,
    /// Seed for superior cluster identities.
    pub domain: String,
    pub connectivity_offset: f64,
    pub address_distribution_delay_ms: u64,
    /// Seed for tokens; mixed with the node name.
    pub seed: u64,
    /// Secret the signing key is derived from. Without one every node
    /// generates a fresh key.
    pub signing_secret: Option<String>,
    pub election: ElectionConfig,
    pub liveness: LivenessConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for HrmConfig {
    fn default() -> Self {
        Self {
            height: DEFAULT_HIERARCHY_HEIGHT,
            domain: DEFAULT_DOMAIN.to_string(),
            connectivity_offset: CONNECTIVITY_PRIORITY_OFFSET,
            address_distribution_delay_ms: ADDRESS_DISTRIBUTION_DELAY_MS,
            seed: 0,
            signing_secret: None,
            election: ElectionConfig::default(),
            liveness: LivenessConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// A frame for a direct neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: NodeName,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    ElectionReply { cluster: ClusterKey, round: u64 },
    AnnounceWait { cluster: ClusterKey, round: u64 },
    AliveTick { cluster: ClusterKey, generation: u64 },
    LivenessCheck { cluster: ClusterKey, generation: u64 },
    AddressDistribution { cluster: ClusterKey, generation: u64 },
    RequestExpiry { id: Uuid },
    SuperiorCheck { level: HierarchyLevel },
}

impl TimerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerEvent::ElectionReply { .. } => "election_reply",
            TimerEvent::AnnounceWait { .. } => "announce_wait",
            TimerEvent::AliveTick { .. } => "alive_tick",
            TimerEvent::LivenessCheck { .. } => "liveness_check",
            TimerEvent::AddressDistribution { .. } => "address_distribution",
            TimerEvent::RequestExpiry { .. } => "request_expiry",
            TimerEvent::SuperiorCheck { .. } => "superior_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    pub after_ms: u64,
    pub event: TimerEvent,
}

/// Side effects requested by the controller.
#[derive(Debug, Default)]
pub struct Actions {
    pub outgoing: Vec<Outgoing>,
    pub timers: Vec<TimerRequest>,
}

impl Actions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after_ms: u64, event: TimerEvent) {
        self.timers.push(TimerRequest { after_ms, event });
    }

    pub fn merge(&mut self, other: Actions) {
        self.outgoing.extend(other.outgoing);
        self.timers.extend(other.timers);
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.timers.is_empty()
    }
}

/// Envelope header of a message being handled.
#[derive(Debug, Clone)]
pub(crate) struct Inbound {
    pub message_id: u64,
    pub sender: ClusterName,
    pub receiver: ClusterName,
    pub origin: NodeName,
    pub trail: Vec<NodeName>,
}

impl Inbound {
    pub fn reply_route(&self) -> Vec<NodeName> {
        let mut route: Vec<NodeName> = self.trail.iter().rev().cloned().collect();
        route.push(self.origin.clone());
        route
    }

    /// The path segment this message travelled from its origin to `local`.
    pub fn segment(&self, local: &NodeName) -> RoutingVector {
        RoutingVector {
            source: self.origin.clone(),
            destination: local.clone(),
            hops: self.trail.clone(),
        }
    }
}

/// Decode a frame from a neighbor.
fn admit(bytes: &[u8]) -> Result<Envelope, HierarchyError> {
    Envelope::decode(bytes).map_err(malformed)
}

fn malformed(error: ProtocolError) -> HierarchyError {
    match error {
        ProtocolError::MalformedMessage(reason) => HierarchyError::MalformedMessage(reason),
        other => HierarchyError::Protocol(other),
    }
}

/// Identity used for messages addressed to a node rather than a cluster.
pub fn node_scope(level: HierarchyLevel) -> ClusterName {
    ClusterName::new(0, 0, level)
}

#[derive(Debug, Clone)]
struct LinkInfo {
    address: L2Address,
    cluster_id: Option<i64>,
}

pub struct HrmController {
    name: NodeName,
    address: L2Address,
    identity: NodeIdentity,
    base_priority: BullyPriority,
    foreign: bool,
    config: HrmConfig,
    names: Arc<dyn NameService>,
    rng: StdRng,
    next_message_id: u64,
    /// Incremented on every won election.
    epoch: u64,
    started: bool,
    links: BTreeMap<NodeName, LinkInfo>,
    registry: ClusterRegistry,
    elections: ElectionRegistry,
    monitor: CoordinatorMonitor,
    coordinators: BTreeMap<ClusterKey, Coordinator>,
    /// Winner a lost round is waiting for.
    expected_winners: BTreeMap<ClusterKey, Candidate>,
    graph: SharedClusterGraph,
    routing: SharedRoutingTable,
    approved: ApprovedSignatures,
    requests: PendingRequests,
    coordinator_answers: Vec<RequestCoordinator>,
    route_sessions: BTreeMap<u64, Option<RouteOutcome>>,
    next_session: u64,
}

impl HrmController {
    pub fn new(
        name: NodeName,
        address: L2Address,
        priority: BullyPriority,
        foreign: bool,
        config: HrmConfig,
        names: Arc<dyn NameService>,
    ) -> Self {
        let seed = {
            let digest = hrm_protocol::crypto::sha256(name.as_str().as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            u64::from_be_bytes(head) ^ config.seed
        };
        names.register_node(&name, address);
        let identity = match &config.signing_secret {
            Some(secret) => NodeIdentity::from_secret(name.clone(), secret),
            None => NodeIdentity::generate(name.clone()),
        };
        tracing::debug!(node = %name, address = %address, priority = %priority, "Controller created");
        Self {
            identity,
            name,
            address,
            base_priority: priority,
            foreign,
            config,
            names,
            rng: StdRng::seed_from_u64(seed),
            next_message_id: 0,
            epoch: 0,
            started: false,
            links: BTreeMap::new(),
            registry: ClusterRegistry::new(),
            elections: ElectionRegistry::new(),
            monitor: CoordinatorMonitor::new(),
            coordinators: BTreeMap::new(),
            expected_winners: BTreeMap::new(),
            graph: shared_graph(),
            routing: Arc::new(RwLock::new(RoutingTable::new())),
            approved: ApprovedSignatures::new(),
            requests: PendingRequests::new(),
            coordinator_answers: Vec::new(),
            route_sessions: BTreeMap::new(),
            next_session: 0,
        }
    }

    // ── Links ──

    /// Register a physical link. A link tagged with a cluster id makes the
    /// peer a member of that base-level cluster.
    pub fn attach_link(&mut self, peer: NodeName, address: L2Address, cluster_id: Option<i64>) -> Actions {
        let mut actions = Actions::new();
        self.names.register_node(&peer, address);
        self.names.register_route(&self.name, &peer, vec![peer.clone()]);
        self.links.insert(peer.clone(), LinkInfo { address, cluster_id });
        tracing::debug!(node = %self.name, peer = %peer, cluster = ?cluster_id, "Link attached");

        let Some(cluster_id) = cluster_id else {
            return actions;
        };
        let key = ClusterKey::new(cluster_id, HierarchyLevel::BASE);
        let created = self.ensure_local_cluster(key, &mut actions);
        let added = self
            .registry
            .local_mut(&key)
            .map(|cluster| cluster.add_member(MemberChannel::direct(peer.clone())))
            .unwrap_or(false);
        if !self.started {
            return actions;
        }
        if created {
            self.begin_election(key, &mut actions);
        } else if added {
            self.greet_member(key, &peer, &mut actions);
        }
        actions
    }

    /// Drop a physical link and everything routed over it, then tell the
    /// rest of the link's cluster.
    pub fn detach(&mut self, peer: &NodeName) -> Actions {
        let mut actions = Actions::new();
        let Some(link) = self.links.remove(peer) else {
            return actions;
        };
        tracing::info!(node = %self.name, peer = %peer, address = %link.address, "Link lost");
        let local = self.name.clone();
        self.prune_link(&local, peer, &mut actions);
        let purged = self.table_write().remove_via(link.address);
        if purged > 0 {
            tracing::debug!(node = %self.name, peer = %peer, purged, "Forwarding entries through lost link purged");
        }
        if let Some(cluster_id) = link.cluster_id {
            let key = ClusterKey::new(cluster_id, HierarchyLevel::BASE);
            let notice = InformClusterLeft {
                left: peer.clone(),
                reporter: self.name.clone(),
            };
            self.spread_cluster_left(key, notice, None, &mut actions);
        }
        actions
    }

    /// Forget everything reached over the physical link between `a` and
    /// `b`: member channels, coordinator members, neighbor clusters and the
    /// coordinators behind it. Returns true if anything was dropped.
    fn prune_link(&mut self, a: &NodeName, b: &NodeName, actions: &mut Actions) -> bool {
        let local = self.name.clone();
        let mut changed = false;
        let mut orphaned = Vec::new();
        for cluster in self.registry.locals_mut() {
            let lost = cluster.drop_members_crossing(&local, a, b);
            if !lost.is_empty() {
                tracing::debug!(node = %self.name, cluster = %cluster.key(), lost = ?lost, "Members out of reach");
                changed = true;
            }
            let behind = cluster
                .coordinator()
                .map(|binding| binding.reached_across(&local, a, b))
                .unwrap_or(false);
            if behind {
                orphaned.push(cluster.key());
            }
        }
        for (key, coordinator) in self.coordinators.iter_mut() {
            let lost = coordinator.remove_members_crossing(a, b);
            if lost.is_empty() {
                continue;
            }
            changed = true;
            tracing::info!(node = %self.name, cluster = %key, lost = ?lost, "Cluster members lost");
            if !coordinator.arm_distribution() {
                continue;
            }
            let generation = self.registry.local(key).map(|cluster| cluster.generation()).unwrap_or(0);
            actions.arm(
                self.config.address_distribution_delay_ms,
                TimerEvent::AddressDistribution { cluster: *key, generation },
            );
        }

        let unreachable: Vec<NeighborCluster> = self
            .registry
            .remotes()
            .filter(|remote| route_crosses(&local, &remote.route_to_coordinator, a, b))
            .cloned()
            .collect();
        for remote in unreachable {
            self.registry.remove_remote(&remote.name.key());
            let via = self.registry.current_name(&remote.via);
            let mut graph = self.graph_write();
            if let Some(via) = via {
                graph.remove_link(&via, &remote.name);
            }
            if graph.get_neighbors(&remote.name).is_empty() {
                graph.remove_node(&remote.name);
            }
            drop(graph);
            tracing::info!(node = %self.name, cluster = %remote.name, "Neighbor cluster out of reach");
            changed = true;
        }

        changed |= !orphaned.is_empty();
        for key in orphaned {
            self.coordinator_lost(key, actions);
        }
        changed
    }

    /// Send a link-loss notice to the members of `key`, skipping `except`.
    /// Forwarded copies only go to direct neighbors.
    fn spread_cluster_left(
        &mut self,
        key: ClusterKey,
        notice: InformClusterLeft,
        except: Option<&NodeName>,
        actions: &mut Actions,
    ) {
        let Some(cluster) = self.registry.local(&key) else {
            return;
        };
        let name = cluster.name();
        let forwarding = except.is_some();
        let targets: Vec<MemberChannel> = cluster
            .members()
            .filter(|member| Some(&member.peer) != except)
            .filter(|member| !forwarding || member.route.len() == 1)
            .cloned()
            .collect();
        for member in &targets {
            self.send(&member.route, name, name, HrmMessage::InformClusterLeft(notice.clone()), actions);
        }
    }

    /// A member of `key` lost its link toward `msg.left`.
    fn on_cluster_left(&mut self, key: ClusterKey, inbound: Inbound, msg: InformClusterLeft, actions: &mut Actions) {
        if msg.left == self.name || msg.reporter == self.name {
            return;
        }
        if !self.prune_link(&msg.reporter, &msg.left, actions) {
            return;
        }
        tracing::info!(
            node = %self.name,
            cluster = %key,
            reporter = %msg.reporter,
            left = %msg.left,
            "Cluster link lost"
        );
        self.spread_cluster_left(key, msg, Some(&inbound.origin), actions);
    }

    /// Begin elections on every base-level cluster.
    pub fn start_elections(&mut self) -> Actions {
        let mut actions = Actions::new();
        self.started = true;
        for key in self.registry.local_keys_at(HierarchyLevel::BASE) {
            if self.elections.state(&key) == ElectorState::Idle {
                self.begin_election(key, &mut actions);
            }
        }
        actions
    }

    // ── Inbound ──

    /// Handle a frame received from a direct neighbor.
    pub fn handle_frame(&mut self, from: &NodeName, bytes: &[u8]) -> Actions {
        match admit(bytes) {
            Ok(envelope) => self.receive(envelope),
            Err(e) => {
                tracing::warn!(node = %self.name, from = %from, error = %e, "Dropping frame");
                Actions::new()
            }
        }
    }

    /// Handle a decoded envelope: relay it if hops remain, else process it.
    pub fn receive(&mut self, envelope: Envelope) -> Actions {
        if !envelope.route.is_empty() {
            let mut actions = Actions::new();
            self.relay(envelope, &mut actions);
            return actions;
        }
        self.handle_envelope(envelope)
    }

    /// Handle an envelope addressed to this node.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> Actions {
        let mut actions = Actions::new();
        if let Err(e) = envelope.validate() {
            let error = malformed(e);
            tracing::warn!(node = %self.name, origin = %envelope.origin, error = %error, "Dropping invalid envelope");
            return actions;
        }
        let method = envelope.method();
        let Envelope {
            message_id,
            sender,
            receiver,
            origin,
            trail,
            payload,
            ..
        } = envelope;
        let inbound = Inbound {
            message_id,
            sender,
            receiver,
            origin,
            trail,
        };
        tracing::debug!(
            node = %self.name,
            method = %method,
            origin = %inbound.origin,
            message_id = inbound.message_id,
            receiver = %inbound.receiver,
            "Handling message"
        );

        match payload {
            HrmMessage::RequestCoordinator(msg) => self.on_request_coordinator(inbound, msg, &mut actions),
            HrmMessage::ClusterDiscovery(msg) => self.on_cluster_discovery(inbound, msg, &mut actions),
            HrmMessage::RouteRequest(msg) => self.on_route_request(inbound, msg, &mut actions),
            payload => {
                let Some(key) = self.cluster_for(&inbound, &mut actions) else {
                    tracing::warn!(
                        node = %self.name,
                        method = %method,
                        receiver = %inbound.receiver,
                        "Dropping message for a cluster this node is not part of"
                    );
                    return actions;
                };
                match payload {
                    HrmMessage::BullyElect(msg) => self.on_elect(key, inbound, msg, &mut actions),
                    HrmMessage::BullyReply(msg) => self.on_reply(key, inbound, msg, &mut actions),
                    HrmMessage::BullyAnnounce(msg) => self.on_announce(key, inbound, msg, &mut actions),
                    HrmMessage::BullyAlive(msg) => self.on_alive(key, inbound, msg, &mut actions),
                    HrmMessage::PriorityUpdate(msg) => {
                        self.on_priority_update(key, inbound, msg, &mut actions)
                    }
                    HrmMessage::NeighborClusterAnnounce(msg) => {
                        self.on_neighbor_announce(key, inbound, msg, &mut actions)
                    }
                    HrmMessage::BullyResign(msg) => self.on_resign(key, inbound, msg, &mut actions),
                    HrmMessage::RequestClusterMembership(msg) => {
                        self.on_membership(key, inbound, msg, &mut actions)
                    }
                    HrmMessage::InformClusterLeft(msg) => self.on_cluster_left(key, inbound, msg, &mut actions),
                    HrmMessage::InformClusterMembershipCanceled(msg) => {
                        self.on_membership_canceled(key, msg, &mut actions)
                    }
                    HrmMessage::TopologyData(msg) => self.on_topology(key, inbound, msg, &mut actions),
                    HrmMessage::RequestCoordinator(_)
                    | HrmMessage::ClusterDiscovery(_)
                    | HrmMessage::RouteRequest(_) => {}
                }
            }
        }
        actions
    }

    /// Handle a fired timer.
    pub fn on_timer(&mut self, event: TimerEvent) -> Actions {
        let mut actions = Actions::new();
        match event {
            TimerEvent::ElectionReply { cluster, round } => {
                self.on_reply_timeout(cluster, round, &mut actions)
            }
            TimerEvent::AnnounceWait { cluster, round } => {
                self.on_announce_timeout(cluster, round, &mut actions)
            }
            TimerEvent::AliveTick { cluster, generation } => {
                self.on_alive_tick(cluster, generation, &mut actions)
            }
            TimerEvent::LivenessCheck { cluster, generation } => {
                self.on_liveness_check(cluster, generation, &mut actions)
            }
            TimerEvent::AddressDistribution { cluster, generation } => {
                self.on_distribution_timer(cluster, generation, &mut actions)
            }
            TimerEvent::RequestExpiry { id } => {
                self.requests.expire(&id);
            }
            TimerEvent::SuperiorCheck { level } => self.on_superior_check(level, &mut actions),
        }
        actions
    }

    /// Resolve the local cluster an inbound message is addressed to.
    /// Superior clusters are created on demand by their eligible members.
    fn cluster_for(&mut self, inbound: &Inbound, actions: &mut Actions) -> Option<ClusterKey> {
        let key = inbound.receiver.key();
        if self.registry.has_local(&key) {
            return Some(key);
        }
        let below = key.level.inferior()?;
        if key != self.superior_key(below) || !self.coordinates_on(below) {
            return None;
        }
        let (key, _) = self.ensure_superior(below);
        Some(key)
    }

    // ── Outbound ──

    fn next_message_id(&mut self) -> u64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    /// Send `payload` along a physical route; the first hop must be a direct
    /// neighbor and the remaining hops are carried in the envelope.
    pub(crate) fn send(
        &mut self,
        route: &[NodeName],
        sender: ClusterName,
        receiver: ClusterName,
        payload: HrmMessage,
        actions: &mut Actions,
    ) {
        let Some((first, rest)) = route.split_first() else {
            tracing::warn!(node = %self.name, method = %payload.method(), "No route for message");
            return;
        };
        if !self.links.contains_key(first) {
            tracing::warn!(
                node = %self.name,
                next_hop = %first,
                method = %payload.method(),
                "Next hop is not a neighbor, dropping message"
            );
            return;
        }
        let id = self.next_message_id();
        let mut envelope = Envelope::new(id, sender, receiver, self.name.clone(), payload);
        envelope.route = rest.to_vec();
        match envelope.encode() {
            Ok(bytes) => actions.outgoing.push(Outgoing {
                to: first.clone(),
                bytes,
            }),
            Err(e) => tracing::warn!(node = %self.name, error = %e, "Failed to encode envelope"),
        }
    }

    fn relay(&mut self, mut envelope: Envelope, actions: &mut Actions) {
        let next = envelope.route.remove(0);
        if !self.links.contains_key(&next) {
            tracing::warn!(
                node = %self.name,
                next_hop = %next,
                method = %envelope.method(),
                "Cannot relay, next hop unreachable"
            );
            return;
        }
        envelope.trail.push(self.name.clone());
        match envelope.encode() {
            Ok(bytes) => actions.outgoing.push(Outgoing { to: next, bytes }),
            Err(e) => tracing::warn!(node = %self.name, error = %e, "Failed to encode relayed envelope"),
        }
    }

    // ── Shared state helpers ──

    pub(crate) fn graph_read(&self) -> RwLockReadGuard<'_, RoutableClusterGraph<ClusterName>> {
        self.graph.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn graph_write(&self) -> RwLockWriteGuard<'_, RoutableClusterGraph<ClusterName>> {
        self.graph.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn table_read(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routing.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn table_write(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routing.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a re-tokened cluster in the graph. Superior clusters are not
    /// graph nodes.
    pub(crate) fn rekey_in_graph(&self, old: ClusterName, new: ClusterName) {
        if old == new {
            return;
        }
        let mut graph = self.graph_write();
        if !graph.replace_node(&old, new) && new.level.is_base_level() {
            graph.add_node(new);
        }
    }

    pub(crate) fn random_token(&mut self) -> i32 {
        self.rng.gen_range(1..=i32::MAX)
    }

    /// Create a base-level cluster; local clusters of one node are
    /// physically adjacent to each other.
    fn ensure_local_cluster(&mut self, key: ClusterKey, actions: &mut Actions) -> bool {
        if self.registry.has_local(&key) {
            return false;
        }
        let cluster = Cluster::new(key, self.base_priority);
        let name = cluster.name();
        let displaced = match self.registry.insert_local(cluster) {
            Ok(displaced) => displaced,
            Err(e) => {
                tracing::warn!(node = %self.name, error = %e, "Cannot create cluster");
                return false;
            }
        };
        self.elections.elector(key);
        match displaced {
            Some(proxy) => {
                tracing::debug!(node = %self.name, proxy = %proxy.name, "Cluster proxy replaced by local cluster");
                self.rekey_in_graph(proxy.name, name);
            }
            None => {
                self.graph_write().add_node(name);
            }
        }
        tracing::info!(node = %self.name, cluster = %key, "Cluster created");

        let siblings: Vec<ClusterKey> = self
            .registry
            .local_keys_at(key.level)
            .into_iter()
            .filter(|other| *other != key)
            .collect();
        for sibling in siblings {
            let Some(sibling_name) = self.registry.current_name(&sibling) else {
                continue;
            };
            let linked = self.graph_write().store_link(
                name,
                sibling_name,
                crate::graph::LinkType::PhysicalLink,
            );
            if linked {
                self.raise_connectivity(key, false, actions);
                self.raise_connectivity(sibling, false, actions);
            }
        }
        true
    }

    pub(crate) fn coordinates_on(&self, level: HierarchyLevel) -> bool {
        self.registry
            .locals()
            .any(|cluster| cluster.key().level == level && cluster.is_coordinator(&self.name))
    }

    /// Identity of the cluster one level above `level`.
    pub fn superior_key(&self, level: HierarchyLevel) -> ClusterKey {
        let superior = level.superior();
        ClusterKey::new(
            hrm_protocol::crypto::derive_cluster_id(&self.config.domain, superior),
            superior,
        )
    }

    // ── Accessors ──

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn address(&self) -> L2Address {
        self.address
    }

    pub fn config(&self) -> &HrmConfig {
        &self.config
    }

    pub fn is_foreign(&self) -> bool {
        self.foreign
    }

    pub fn peers(&self) -> Vec<NodeName> {
        self.links.keys().cloned().collect()
    }

    pub fn cluster(&self, key: &ClusterKey) -> Option<&Cluster> {
        self.registry.local(key)
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.registry.locals()
    }

    pub fn cluster_keys(&self) -> Vec<ClusterKey> {
        self.registry.local_keys()
    }

    pub fn neighbor_clusters(&self) -> Vec<NeighborCluster> {
        self.registry.remotes().cloned().collect()
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Name of the coordinator this node accepted for `key`.
    pub fn coordinator_of(&self, key: &ClusterKey) -> Option<NodeName> {
        self.registry
            .local(key)
            .and_then(|cluster| cluster.coordinator())
            .map(|binding| binding.name.clone())
    }

    pub fn is_coordinator_of(&self, key: &ClusterKey) -> bool {
        self.coordinators.contains_key(key)
    }

    pub fn coordinator(&self, key: &ClusterKey) -> Option<&Coordinator> {
        self.coordinators.get(key)
    }

    pub fn elector_state(&self, key: &ClusterKey) -> ElectorState {
        self.elections.state(key)
    }

    pub fn elections(&self) -> &ElectionRegistry {
        &self.elections
    }

    pub fn monitor(&self) -> &CoordinatorMonitor {
        &self.monitor
    }

    pub fn priority(&self, key: &ClusterKey) -> Option<BullyPriority> {
        self.registry.local(key).map(|cluster| cluster.priority())
    }

    /// Handle on the cluster graph, for visualization-style consumers.
    pub fn graph(&self) -> SharedClusterGraph {
        Arc::clone(&self.graph)
    }

    /// Handle on the routing table, for route consumers.
    pub fn routing_table(&self) -> SharedRoutingTable {
        Arc::clone(&self.routing)
    }

    pub fn approved_signatures(&self) -> &ApprovedSignatures {
        &self.approved
    }

    /// Addresses assigned to this node, per base-level cluster.
    pub fn hrmids(&self) -> Vec<(ClusterKey, Hrmid)> {
        self.registry
            .locals()
            .filter_map(|cluster| cluster.hrmid().map(|hrmid| (cluster.key(), hrmid)))
            .collect()
    }

    /// First assigned address, if any.
    pub fn primary_hrmid(&self) -> Option<Hrmid> {
        self.hrmids().into_iter().map(|(_, hrmid)| hrmid).next()
    }

    /// Answers received for this node's RequestCoordinator messages.
    pub fn coordinator_answers(&self) -> &[RequestCoordinator] {
        &self.coordinator_answers
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.requests
    }

    /// JSON snapshot of the node's state.
    pub fn status(&self) -> serde_json::Value {
        let clusters: Vec<serde_json::Value> = self
            .registry
            .locals()
            .map(|cluster| {
                serde_json::json!({
                    "cluster": cluster.name().to_string(),
                    "state": self.elections.state(&cluster.key()).as_str(),
                    "priority": cluster.priority().value(),
                    "coordinator": cluster.coordinator().map(|b| b.name.to_string()),
                    "members": cluster.member_count(),
                    "hrmid": cluster.hrmid().map(|h| h.to_string()),
                })
            })
            .collect();
        let graph = self.graph_read();
        serde_json::json!({
            "node": self.name,
            "address": self.address.to_string(),
            "clusters": clusters,
            "neighbor_clusters": self.registry.remotes().count(),
            "graph_nodes": graph.node_count(),
            "graph_links": graph.link_count(),
            "routing_entries": self.table_read().len(),
        })
    }
}
