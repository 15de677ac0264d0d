use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_FRAME_BYTES;
use crate::crypto::{HrmSignature, NodeIdentity};
use crate::error::ProtocolError;
use crate::identity::*;
use crate::types::*;

/// Multiplexing envelope. Many logical clusters share one physical channel;
/// sender and receiver identities select the cluster on either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-node message number, for idempotent reprocessing and logs.
    pub message_id: u64,
    pub sender: ClusterName,
    pub receiver: ClusterName,
    /// Node that created this envelope.
    pub origin: NodeName,
    /// Remaining physical hops for relayed envelopes. Empty when the
    /// current holder is the destination.
    #[serde(default)]
    pub route: Vec<NodeName>,
    /// Relays the envelope already passed through.
    #[serde(default)]
    pub trail: Vec<NodeName>,
    pub payload: HrmMessage,
}

impl Envelope {
    pub fn new(
        message_id: u64,
        sender: ClusterName,
        receiver: ClusterName,
        origin: NodeName,
        payload: HrmMessage,
    ) -> Self {
        Self {
            message_id,
            sender,
            receiver,
            origin,
            route: Vec::new(),
            trail: Vec::new(),
            payload,
        }
    }

    pub fn method(&self) -> ProtocolMethod {
        self.payload.method()
    }

    /// Physical route from the current holder back to the origin.
    pub fn reply_route(&self) -> Vec<NodeName> {
        let mut route: Vec<NodeName> = self.trail.iter().rev().cloned().collect();
        route.push(self.origin.clone());
        route
    }

    /// Encode to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        Ok(bytes)
    }

    /// Decode and structurally validate a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_BYTES,
            });
        }
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Structural checks that do not need any local state.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.origin.as_str().is_empty() {
            return Err(ProtocolError::MalformedMessage("empty origin".into()));
        }
        let needs_receiver_level = !matches!(self.payload, HrmMessage::RequestCoordinator(_));
        if needs_receiver_level && self.receiver.level.is_undefined() {
            return Err(ProtocolError::MalformedMessage(format!(
                "{} addressed to undefined level",
                self.method()
            )));
        }
        match &self.payload {
            HrmMessage::BullyElect(elect) => {
                if elect.level != self.receiver.level {
                    return Err(ProtocolError::MalformedMessage(format!(
                        "election for {} sent to {}",
                        elect.level, self.receiver
                    )));
                }
                if elect.sender_priority.value().is_nan() {
                    return Err(ProtocolError::MalformedMessage("NaN priority".into()));
                }
            }
            HrmMessage::BullyAnnounce(announce) => {
                if announce.token == 0 {
                    return Err(ProtocolError::MalformedMessage(
                        "announcement without token".into(),
                    ));
                }
            }
            HrmMessage::NeighborClusterAnnounce(announce) => {
                if announce.token == 0 || announce.level.is_undefined() {
                    return Err(ProtocolError::MalformedMessage(
                        "neighbor announcement without identity".into(),
                    ));
                }
            }
            HrmMessage::TopologyData(data) => {
                if data.entries().iter().any(|e| e.destination.is_unassigned()) {
                    return Err(ProtocolError::MalformedMessage(
                        "forwarding entry without destination".into(),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// All signaling messages exchanged between clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum HrmMessage {
    #[serde(rename = "election.elect")]
    BullyElect(BullyElect),
    #[serde(rename = "election.reply")]
    BullyReply(BullyReply),
    #[serde(rename = "election.announce")]
    BullyAnnounce(BullyAnnounce),
    #[serde(rename = "election.alive")]
    BullyAlive(BullyAlive),
    #[serde(rename = "election.priority_update")]
    PriorityUpdate(PriorityUpdate),
    #[serde(rename = "election.resign")]
    BullyResign(BullyResign),
    #[serde(rename = "cluster.neighbor_announce")]
    NeighborClusterAnnounce(NeighborClusterAnnounce),
    #[serde(rename = "cluster.membership")]
    RequestClusterMembership(RequestClusterMembership),
    #[serde(rename = "cluster.left")]
    InformClusterLeft(InformClusterLeft),
    #[serde(rename = "cluster.membership_canceled")]
    InformClusterMembershipCanceled(InformClusterMembershipCanceled),
    #[serde(rename = "discovery.request_coordinator")]
    RequestCoordinator(RequestCoordinator),
    #[serde(rename = "discovery.cluster")]
    ClusterDiscovery(ClusterDiscovery),
    #[serde(rename = "routing.route_request")]
    RouteRequest(RouteRequest),
    #[serde(rename = "routing.topology")]
    TopologyData(TopologyData),
}

impl HrmMessage {
    pub fn method(&self) -> ProtocolMethod {
        match self {
            HrmMessage::BullyElect(_) => ProtocolMethod::BullyElect,
            HrmMessage::BullyReply(_) => ProtocolMethod::BullyReply,
            HrmMessage::BullyAnnounce(_) => ProtocolMethod::BullyAnnounce,
            HrmMessage::BullyAlive(_) => ProtocolMethod::BullyAlive,
            HrmMessage::PriorityUpdate(_) => ProtocolMethod::PriorityUpdate,
            HrmMessage::BullyResign(_) => ProtocolMethod::BullyResign,
            HrmMessage::NeighborClusterAnnounce(_) => ProtocolMethod::NeighborClusterAnnounce,
            HrmMessage::RequestClusterMembership(_) => ProtocolMethod::RequestClusterMembership,
            HrmMessage::InformClusterLeft(_) => ProtocolMethod::InformClusterLeft,
            HrmMessage::InformClusterMembershipCanceled(_) => ProtocolMethod::InformClusterMembershipCanceled,
            HrmMessage::RequestCoordinator(_) => ProtocolMethod::RequestCoordinator,
            HrmMessage::ClusterDiscovery(_) => ProtocolMethod::ClusterDiscovery,
            HrmMessage::RouteRequest(_) => ProtocolMethod::RouteRequest,
            HrmMessage::TopologyData(_) => ProtocolMethod::TopologyData,
        }
    }
}

/// Wire names of the signaling methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMethod {
    BullyElect,
    BullyReply,
    BullyAnnounce,
    BullyAlive,
    PriorityUpdate,
    BullyResign,
    NeighborClusterAnnounce,
    RequestClusterMembership,
    InformClusterLeft,
    InformClusterMembershipCanceled,
    RequestCoordinator,
    ClusterDiscovery,
    RouteRequest,
    TopologyData,
}

impl ProtocolMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BullyElect => "election.elect",
            Self::BullyReply => "election.reply",
            Self::BullyAnnounce => "election.announce",
            Self::BullyAlive => "election.alive",
            Self::PriorityUpdate => "election.priority_update",
            Self::BullyResign => "election.resign",
            Self::NeighborClusterAnnounce => "cluster.neighbor_announce",
            Self::RequestClusterMembership => "cluster.membership",
            Self::InformClusterLeft => "cluster.left",
            Self::InformClusterMembershipCanceled => "cluster.membership_canceled",
            Self::RequestCoordinator => "discovery.request_coordinator",
            Self::ClusterDiscovery => "discovery.cluster",
            Self::RouteRequest => "routing.route_request",
            Self::TopologyData => "routing.topology",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "election.elect" => Some(Self::BullyElect),
            "election.reply" => Some(Self::BullyReply),
            "election.announce" => Some(Self::BullyAnnounce),
            "election.alive" => Some(Self::BullyAlive),
            "election.priority_update" => Some(Self::PriorityUpdate),
            "election.resign" => Some(Self::BullyResign),
            "cluster.neighbor_announce" => Some(Self::NeighborClusterAnnounce),
            "cluster.membership" => Some(Self::RequestClusterMembership),
            "cluster.left" => Some(Self::InformClusterLeft),
            "cluster.membership_canceled" => Some(Self::InformClusterMembershipCanceled),
            "discovery.request_coordinator" => Some(Self::RequestCoordinator),
            "discovery.cluster" => Some(Self::ClusterDiscovery),
            "routing.route_request" => Some(Self::RouteRequest),
            "routing.topology" => Some(Self::TopologyData),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Election ──

/// Opens an election round on the receiver's cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BullyElect {
    pub sender_name: NodeName,
    pub sender_priority: BullyPriority,
    pub level: HierarchyLevel,
    /// Round number of the initiator, echoed in the reply.
    pub round: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BullyReply {
    pub priority: BullyPriority,
    pub initiator_name: NodeName,
    pub round: u64,
    /// Best candidate the replier has heard of so far.
    #[serde(default)]
    pub highest_seen: Option<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BullyAnnounce {
    pub coordinator_name: NodeName,
    pub coordinator_address: L2Address,
    pub priority: BullyPriority,
    pub signature: HrmSignature,
    pub token: i32,
    /// Monotonic per coordinator; orders successive incarnations.
    pub epoch: u64,
    #[serde(default)]
    pub covered_nodes: Vec<NodeName>,
    /// Path the announcement travelled, starting at the coordinator.
    #[serde(default)]
    pub routing_vectors: Vec<RoutingVector>,
}

impl BullyAnnounce {
    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.coordinator_name.clone(), self.priority)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BullyAlive {
    pub peer_name: NodeName,
    pub coordinator_name: NodeName,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityUpdate {
    pub priority: BullyPriority,
}

/// A coordinator stepping down. Members bound to that incarnation drop it
/// and elect again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BullyResign {
    pub coordinator_name: NodeName,
    pub priority: BullyPriority,
    pub epoch: u64,
    pub signature: HrmSignature,
}

impl BullyResign {
    pub fn new(identity: &NodeIdentity, level: HierarchyLevel, priority: BullyPriority, epoch: u64) -> Self {
        let coordinator_name = identity.name().clone();
        let signature = identity.sign_content(level, &Self::content(&coordinator_name, epoch));
        Self {
            coordinator_name,
            priority,
            epoch,
            signature,
        }
    }

    fn content(coordinator_name: &NodeName, epoch: u64) -> Vec<u8> {
        format!("resign:{}:{}", coordinator_name, epoch).into_bytes()
    }

    /// The resignation must be signed by the coordinator it names, for the
    /// epoch it names.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        if self.signature.signer != self.coordinator_name {
            return Err(ProtocolError::InvalidSignature(format!(
                "resignation of {} signed by {}",
                self.coordinator_name, self.signature.signer
            )));
        }
        self.signature
            .verify_content(&Self::content(&self.coordinator_name, self.epoch))
    }
}

// ── Cluster gossip ──

/// Cross-node gossip of a cluster's existence and coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborClusterAnnounce {
    pub coordinator_name: NodeName,
    pub coordinator_signature: HrmSignature,
    pub coordinator_address: L2Address,
    pub token: i32,
    pub cluster_id: i64,
    pub level: HierarchyLevel,
    pub priority: BullyPriority,
    pub epoch: u64,
    /// Path segments leading back to the coordinator.
    #[serde(default)]
    pub routing_vectors: Vec<RoutingVector>,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default)]
    pub foreign: bool,
}

impl NeighborClusterAnnounce {
    pub fn cluster_name(&self) -> ClusterName {
        ClusterName::new(self.token, self.cluster_id, self.level)
    }

    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.coordinator_name.clone(), self.priority)
    }

    pub fn set_rejection(&mut self) {
        self.rejected = true;
    }

    /// Append the traversal of one more physical link.
    pub fn add_hop(&mut self, from: NodeName, to: NodeName) {
        self.routing_vectors.push(RoutingVector::link(from, to));
    }
}

/// Sent by a member toward its coordinator after accepting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestClusterMembership {
    /// Coordinator the member accepted; stale requests are dropped.
    pub coordinator: NodeName,
    pub member: NodeName,
    pub address: L2Address,
    pub priority: BullyPriority,
    /// Physical path from the member to the current holder.
    pub path: Vec<NodeName>,
    /// Other clusters the member is part of or represents.
    #[serde(default)]
    pub attached_clusters: Vec<ClusterName>,
    /// Adjacencies of the attached clusters known to the member.
    #[serde(default)]
    pub neighbor_relations: Vec<(ClusterName, ClusterName)>,
}

/// Broadcast by a member that lost its link toward `left`; everything
/// reached across that link is gone from the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformClusterLeft {
    pub left: NodeName,
    pub reporter: NodeName,
}

/// Sent by a node that no longer coordinates the cluster a member still
/// asks to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformClusterMembershipCanceled {
    pub coordinator: NodeName,
    pub member: NodeName,
}

// ── Discovery ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCoordinator {
    pub correlation_id: Uuid,
    pub is_answer: bool,
    pub coordinator_known: bool,
    #[serde(default)]
    pub discovery_entries: Vec<DiscoveryEntry>,
}

impl RequestCoordinator {
    pub fn request() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            is_answer: false,
            coordinator_known: false,
            discovery_entries: Vec::new(),
        }
    }

    pub fn answer(correlation_id: Uuid, entries: Vec<DiscoveryEntry>) -> Self {
        Self {
            correlation_id,
            is_answer: true,
            coordinator_known: !entries.is_empty(),
            discovery_entries: entries,
        }
    }
}

/// Batch of nested discoveries sharing one physical link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDiscovery {
    pub identification: Uuid,
    pub request: bool,
    pub dealt_with: bool,
    pub nested: Vec<NestedDiscovery>,
}

impl ClusterDiscovery {
    pub fn request() -> Self {
        Self {
            identification: Uuid::new_v4(),
            request: true,
            dealt_with: false,
            nested: Vec::new(),
        }
    }

    pub fn add_nested(&mut self, nested: NestedDiscovery) {
        self.nested.push(nested);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedDiscovery {
    /// Tokens the requester already knows about.
    pub tokens: Vec<i32>,
    pub source_cluster_id: i64,
    pub target_cluster_id: Option<i64>,
    pub token: i32,
    pub level: HierarchyLevel,
    /// Maximum cluster distance to explore.
    pub distance: u32,
    #[serde(default)]
    pub discovery_entries: Vec<DiscoveryEntry>,
    #[serde(default)]
    pub neighbor_relations: Vec<(ClusterName, ClusterName)>,
}

impl NestedDiscovery {
    pub fn new(source_cluster_id: i64, token: i32, level: HierarchyLevel, distance: u32) -> Self {
        Self {
            tokens: Vec::new(),
            source_cluster_id,
            target_cluster_id: None,
            token,
            level,
            distance,
            discovery_entries: Vec::new(),
            neighbor_relations: Vec::new(),
        }
    }

    pub fn knows_token(&self, token: i32) -> bool {
        self.tokens.contains(&token)
    }

    pub fn add_discovery_entry(&mut self, entry: DiscoveryEntry) {
        let name = entry.cluster_name();
        if !self
            .discovery_entries
            .iter()
            .any(|existing| existing.cluster_name() == name)
        {
            self.discovery_entries.push(entry);
        }
    }

    /// Record an undirected adjacency once.
    pub fn add_neighbor_relation(&mut self, a: ClusterName, b: ClusterName) {
        if a == b {
            return;
        }
        let exists = self
            .neighbor_relations
            .iter()
            .any(|(x, y)| (*x == a && *y == b) || (*x == b && *y == a));
        if !exists {
            self.neighbor_relations.push((a, b));
        }
    }
}

// ── Routing ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub source: Hrmid,
    pub target: Hrmid,
    pub description: String,
    pub session: u64,
    /// Node waiting for the answer.
    pub requester: NodeName,
    #[serde(default)]
    pub required_clusters: Vec<ClusterName>,
    pub is_answer: bool,
    pub result: Option<RouteResult>,
    /// Next hops toward the target, nearest first.
    #[serde(default)]
    pub route: Vec<L2Address>,
}

impl RouteRequest {
    pub fn new(source: Hrmid, target: Hrmid, session: u64, requester: NodeName) -> Self {
        Self {
            source,
            target,
            description: String::new(),
            session,
            requester,
            required_clusters: Vec::new(),
            is_answer: false,
            result: None,
            route: Vec::new(),
        }
    }

    pub fn set_result(&mut self, result: RouteResult, route: Vec<L2Address>) {
        self.is_answer = true;
        self.result = Some(result);
        self.route = route;
    }
}
