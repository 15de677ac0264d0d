//! Single registry of every cluster a node knows about.
//!
//! Local clusters and remote proxies live in separate arenas keyed by
//! (cluster id, level). Cross references elsewhere hold [`ClusterName`]
//! values and are resolved here into a [`ClusterRef`].

use std::cmp::Ordering;
use std::collections::BTreeMap;

use hrm_protocol::{ClusterKey, ClusterName, HierarchyLevel};

use crate::cluster::{claim_order, Cluster, ClusterRef, NeighborCluster};
use crate::HierarchyError;

/// What happened to a remote cluster record on upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// First time this cluster is seen.
    Created,
    /// Same incarnation, better or fresher claim.
    Updated,
    /// A new incarnation replaced an old one.
    Replaced { old: ClusterName },
    /// The offered claim is worse than the one already held.
    Rejected { current: NeighborCluster },
    /// Exact duplicate.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ClusterRegistry {
    local: BTreeMap<ClusterKey, Cluster>,
    remote: BTreeMap<ClusterKey, NeighborCluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Local clusters ──

    /// Insert a local cluster unless the key is already taken. A remote
    /// proxy for the same key is dropped and returned, so the caller can
    /// move its graph node.
    pub fn insert_local(&mut self, cluster: Cluster) -> Result<Option<NeighborCluster>, HierarchyError> {
        let key = cluster.key();
        if self.local.contains_key(&key) {
            return Err(HierarchyError::IdentityCollision(key.to_string()));
        }
        let displaced = self.remote.remove(&key);
        self.local.insert(key, cluster);
        Ok(displaced)
    }

    pub fn local(&self, key: &ClusterKey) -> Option<&Cluster> {
        self.local.get(key)
    }

    pub fn local_mut(&mut self, key: &ClusterKey) -> Option<&mut Cluster> {
        self.local.get_mut(key)
    }

    pub fn has_local(&self, key: &ClusterKey) -> bool {
        self.local.contains_key(key)
    }

    pub fn locals(&self) -> impl Iterator<Item = &Cluster> {
        self.local.values()
    }

    pub fn locals_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.local.values_mut()
    }

    pub fn local_keys(&self) -> Vec<ClusterKey> {
        self.local.keys().copied().collect()
    }

    pub fn local_keys_at(&self, level: HierarchyLevel) -> Vec<ClusterKey> {
        self.local
            .keys()
            .filter(|key| key.level == level)
            .copied()
            .collect()
    }

    // ── Remote proxies ──

    pub fn remote(&self, key: &ClusterKey) -> Option<&NeighborCluster> {
        self.remote.get(key)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &NeighborCluster> {
        self.remote.values()
    }

    pub fn remove_remote(&mut self, key: &ClusterKey) -> Option<NeighborCluster> {
        self.remote.remove(key)
    }

    /// Insert or refresh a remote proxy.
    ///
    /// Claims are compared as (candidate, epoch); a worse claim is rejected
    /// and the current record returned so the caller can bounce it back.
    pub fn upsert_remote(
        &mut self,
        incoming: NeighborCluster,
    ) -> Result<UpsertOutcome, HierarchyError> {
        let key = incoming.name.key();
        if self.local.contains_key(&key) {
            return Err(HierarchyError::IdentityCollision(incoming.name.to_string()));
        }
        let Some(existing) = self.remote.get_mut(&key) else {
            self.remote.insert(key, incoming);
            return Ok(UpsertOutcome::Created);
        };

        let order = claim_order(
            &incoming.candidate(),
            incoming.epoch,
            &existing.candidate(),
            existing.epoch,
        );
        match order {
            Ordering::Less => Ok(UpsertOutcome::Rejected {
                current: existing.clone(),
            }),
            Ordering::Equal => {
                if existing.name == incoming.name {
                    // Keep the shorter way to the coordinator.
                    if incoming.route_to_coordinator.len() < existing.route_to_coordinator.len() {
                        existing.route_to_coordinator = incoming.route_to_coordinator;
                        existing.routing_vectors = incoming.routing_vectors;
                    }
                    if existing.signature.is_none() && incoming.signature.is_some() {
                        existing.signature = incoming.signature;
                    }
                    Ok(UpsertOutcome::Unchanged)
                } else {
                    Err(HierarchyError::DuplicateCoordinator(incoming.name.to_string()))
                }
            }
            Ordering::Greater => {
                let old = existing.name;
                *existing = incoming;
                if old == existing.name {
                    Ok(UpsertOutcome::Updated)
                } else {
                    Ok(UpsertOutcome::Replaced { old })
                }
            }
        }
    }

    // ── Resolution ──

    /// Resolve a full cluster identity.
    pub fn resolve(&self, name: &ClusterName) -> ClusterRef {
        let key = name.key();
        if let Some(cluster) = self.local.get(&key) {
            if cluster.name() == *name || !name.has_token() {
                return ClusterRef::Local(key);
            }
        }
        if let Some(remote) = self.remote.get(&key) {
            if remote.name == *name {
                return ClusterRef::Remote(remote.clone());
            }
        }
        ClusterRef::Identity(*name)
    }

    /// Current identity of the cluster with this key, local or remote.
    pub fn current_name(&self, key: &ClusterKey) -> Option<ClusterName> {
        self.local
            .get(key)
            .map(|cluster| cluster.name())
            .or_else(|| self.remote.get(key).map(|remote| remote.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrm_protocol::{BullyPriority, HierarchyLevel, L2Address, NodeIdentity, NodeName};

    fn proxy(token: i32, coordinator: &str, priority: f64, epoch: u64) -> NeighborCluster {
        let identity = NodeIdentity::derived(coordinator.into());
        NeighborCluster {
            name: ClusterName::new(token, 77, HierarchyLevel::BASE),
            coordinator_name: coordinator.into(),
            coordinator_address: L2Address(1),
            priority: BullyPriority::new(priority),
            epoch,
            signature: Some(identity.sign(HierarchyLevel::BASE)),
            announcer: NodeName::from("relay"),
            via: ClusterKey::new(1, HierarchyLevel::BASE),
            cluster_hops: 1,
            routing_vectors: Vec::new(),
            route_to_coordinator: vec![coordinator.into()],
            foreign: false,
        }
    }

    #[test]
    fn duplicate_upsert_is_unchanged() {
        let mut registry = ClusterRegistry::new();
        assert_eq!(registry.upsert_remote(proxy(3, "a", 2.0, 1)).unwrap(), UpsertOutcome::Created);
        assert_eq!(registry.upsert_remote(proxy(3, "a", 2.0, 1)).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(registry.remotes().count(), 1);
    }

    #[test]
    fn better_incarnation_replaces() {
        let mut registry = ClusterRegistry::new();
        registry.upsert_remote(proxy(3, "a", 2.0, 1)).unwrap();
        let outcome = registry.upsert_remote(proxy(4, "b", 5.0, 1)).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Replaced {
                old: ClusterName::new(3, 77, HierarchyLevel::BASE)
            }
        );
        assert!(matches!(
            registry.upsert_remote(proxy(3, "a", 2.0, 1)).unwrap(),
            UpsertOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn remote_claim_on_local_key_collides() {
        let mut registry = ClusterRegistry::new();
        registry
            .insert_local(Cluster::new(ClusterKey::new(77, HierarchyLevel::BASE), BullyPriority::new(1.0)))
            .unwrap();
        assert!(matches!(
            registry.upsert_remote(proxy(3, "a", 2.0, 1)),
            Err(HierarchyError::IdentityCollision(_))
        ));
    }

    #[test]
    fn local_cluster_displaces_its_proxy() {
        let mut registry = ClusterRegistry::new();
        registry.upsert_remote(proxy(3, "a", 2.0, 1)).unwrap();
        let key = ClusterKey::new(77, HierarchyLevel::BASE);

        let displaced = registry.insert_local(Cluster::new(key, BullyPriority::new(1.0))).unwrap();
        assert_eq!(displaced.map(|proxy| proxy.name), Some(ClusterName::new(3, 77, HierarchyLevel::BASE)));
        assert!(registry.remote(&key).is_none());
        assert!(matches!(
            registry.insert_local(Cluster::new(key, BullyPriority::new(1.0))),
            Err(HierarchyError::IdentityCollision(_))
        ));
    }

    #[test]
    fn resolve_distinguishes_variants() {
        let mut registry = ClusterRegistry::new();
        let key = ClusterKey::new(5, HierarchyLevel::BASE);
        registry.insert_local(Cluster::new(key, BullyPriority::new(1.0))).unwrap();
        registry.upsert_remote(proxy(3, "a", 2.0, 1)).unwrap();

        assert_eq!(registry.resolve(&ClusterName::untokened(key)), ClusterRef::Local(key));
        assert!(matches!(
            registry.resolve(&ClusterName::new(3, 77, HierarchyLevel::BASE)),
            ClusterRef::Remote(_)
        ));
        let unknown = ClusterName::new(9, 99, HierarchyLevel::BASE);
        assert_eq!(registry.resolve(&unknown), ClusterRef::Identity(unknown));
    }
}
