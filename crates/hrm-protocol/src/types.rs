use serde::{Deserialize, Serialize};

use crate::crypto::{HrmSignature, NodeIdentity};
use crate::identity::*;
use crate::ProtocolError;

/// One segment of a physical path, from `source` through `hops` to
/// `destination`. Announcements accumulate these while travelling so the
/// receiver can reach the announced coordinator again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingVector {
    pub source: NodeName,
    pub destination: NodeName,
    /// Intermediate nodes between source and destination.
    #[serde(default)]
    pub hops: Vec<NodeName>,
}

impl RoutingVector {
    /// A segment over a single physical link.
    pub fn link(source: NodeName, destination: NodeName) -> Self {
        Self {
            source,
            destination,
            hops: Vec::new(),
        }
    }

    /// Concatenate segments into the node sequence they describe.
    pub fn flatten(vectors: &[RoutingVector]) -> Vec<NodeName> {
        let mut path: Vec<NodeName> = Vec::new();
        for vector in vectors {
            let segment = std::iter::once(&vector.source)
                .chain(vector.hops.iter())
                .chain(std::iter::once(&vector.destination));
            for node in segment {
                if path.last() != Some(node) {
                    path.push(node.clone());
                }
            }
        }
        path
    }

    /// Route from `local` back to the start of the described path. The
    /// returned hops exclude `local` and end at the path's first node.
    pub fn route_back(vectors: &[RoutingVector], local: &NodeName) -> Vec<NodeName> {
        let mut path = Self::flatten(vectors);
        if let Some(position) = path.iter().rposition(|node| node == local) {
            path.truncate(position);
        }
        path.reverse();
        path
    }
}

/// Description of a cluster handed out by discovery: who coordinates it, how
/// far away it is and through which cluster it is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub token: i32,
    pub coordinator_name: NodeName,
    pub cluster_id: i64,
    pub coordinator_address: L2Address,
    pub priority: BullyPriority,
    pub level: HierarchyLevel,
    /// Distance in clusters from the requester.
    pub cluster_hops: u32,
    /// First cluster on the path back to the requester.
    pub predecessor: Option<ClusterName>,
    #[serde(default)]
    pub routing_vectors: Vec<RoutingVector>,
    #[serde(default)]
    pub foreign: bool,
}

impl DiscoveryEntry {
    pub fn cluster_name(&self) -> ClusterName {
        ClusterName::new(self.token, self.cluster_id, self.level)
    }
}

/// A forwarding entry produced by a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FibEntry {
    pub destination: Hrmid,
    pub next_hop: L2Address,
    pub next_cluster: ClusterName,
    /// Farthest cluster on the shortest path that is still inside the
    /// visibility radius of the source.
    pub farthest_cluster: Option<ClusterName>,
    pub signature: HrmSignature,
    #[serde(default)]
    pub routing_vectors: Vec<RoutingVector>,
}

impl FibEntry {
    /// Level of the coordinator that produced this entry.
    pub fn level(&self) -> HierarchyLevel {
        self.signature.level
    }
}

/// Forwarding data pushed from a coordinator down to one member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyData {
    /// Address assigned to the receiving member (or cluster prefix).
    pub hrmid: Hrmid,
    /// Cluster the receiver belongs to and that the address is valid in.
    pub cluster: ClusterName,
    pub signature: HrmSignature,
    entries: Vec<FibEntry>,
    #[serde(default)]
    pub approved_signatures: Vec<HrmSignature>,
}

impl TopologyData {
    pub fn new(hrmid: Hrmid, cluster: ClusterName, signature: HrmSignature) -> Self {
        Self {
            hrmid,
            cluster,
            signature,
            entries: Vec::new(),
            approved_signatures: Vec::new(),
        }
    }

    /// Add an entry unless one for the same destination is already present.
    pub fn add_entry(&mut self, entry: FibEntry) -> bool {
        if self
            .entries
            .iter()
            .any(|existing| existing.destination == entry.destination)
        {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn add_approved_signature(&mut self, signature: HrmSignature) {
        if !self.approved_signatures.contains(&signature) {
            self.approved_signatures.push(signature);
        }
    }

    pub fn entries(&self) -> &[FibEntry] {
        &self.entries
    }

    pub fn level(&self) -> HierarchyLevel {
        self.signature.level
    }

    /// Canonical bytes covered by the push signature: address, cluster,
    /// every entry without its signature, and the approved chain.
    pub fn signed_content(&self) -> Vec<u8> {
        let entries: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "destination": entry.destination,
                    "next_hop": entry.next_hop,
                    "next_cluster": entry.next_cluster,
                    "farthest_cluster": entry.farthest_cluster,
                    "routing_vectors": entry.routing_vectors,
                })
            })
            .collect();
        let canonical = serde_json::json!({
            "hrmid": self.hrmid,
            "cluster": self.cluster,
            "entries": entries,
            "approved_signatures": self.approved_signatures,
        });
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    /// Sign the finished push and stamp the signature on every entry.
    pub fn seal(&mut self, identity: &NodeIdentity) {
        let signature = identity.sign_content(self.signature.level, &self.signed_content());
        for entry in &mut self.entries {
            entry.signature = signature.clone();
        }
        self.signature = signature;
    }

    /// Check that the push was sealed by its signer and not altered since.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        self.signature.verify_content(&self.signed_content())?;
        if let Some(entry) = self.entries.iter().find(|entry| entry.signature != self.signature) {
            return Err(ProtocolError::InvalidSignature(format!(
                "entry {} is not signed by the push",
                entry.destination
            )));
        }
        Ok(())
    }
}

/// Outcome of a route request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteResult {
    Success,
    Unfeasible,
    Alternative,
}

impl std::fmt::Display for RouteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteResult::Success => write!(f, "SUCCESS"),
            RouteResult::Unfeasible => write!(f, "UNFEASIBLE"),
            RouteResult::Alternative => write!(f, "ALTERNATIVE"),
        }
    }
}
