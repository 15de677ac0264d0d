//! Name and address resolution.
//!
//! Coordinators are announced by name. Members register the name together
//! with the coordinator's transport address and import the physical path
//! segments carried by announcements, so later traffic can be relayed.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use hrm_protocol::{L2Address, NodeName};

/// Naming and addressing collaborator.
pub trait NameService: Send + Sync {
    fn register_node(&self, name: &NodeName, address: L2Address);

    fn resolve(&self, name: &NodeName) -> Option<L2Address>;

    /// Reverse lookup of a transport address.
    fn name_of(&self, address: L2Address) -> Option<NodeName>;

    /// Record the physical hops `from` uses to reach `to`.
    fn register_route(&self, from: &NodeName, to: &NodeName, hops: Vec<NodeName>);

    fn route(&self, from: &NodeName, to: &NodeName) -> Option<Vec<NodeName>>;
}

#[derive(Debug, Default)]
struct Registry {
    addresses: HashMap<NodeName, L2Address>,
    names: HashMap<L2Address, NodeName>,
    routes: HashMap<(NodeName, NodeName), Vec<NodeName>>,
}

/// In-memory name service, shareable between nodes of one process.
#[derive(Debug, Default)]
pub struct MemoryNameService {
    registry: RwLock<Registry>,
}

impl MemoryNameService {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_count(&self) -> usize {
        self.read().addresses.len()
    }

    pub fn route_count(&self) -> usize {
        self.read().routes.len()
    }
}

impl NameService for MemoryNameService {
    fn register_node(&self, name: &NodeName, address: L2Address) {
        let mut registry = self.write();
        if let Some(previous) = registry.addresses.insert(name.clone(), address) {
            if previous != address {
                registry.names.remove(&previous);
                tracing::debug!(node = %name, old = %previous, new = %address, "Address changed");
            }
        }
        registry.names.insert(address, name.clone());
    }

    fn resolve(&self, name: &NodeName) -> Option<L2Address> {
        self.read().addresses.get(name).copied()
    }

    fn name_of(&self, address: L2Address) -> Option<NodeName> {
        self.read().names.get(&address).cloned()
    }

    fn register_route(&self, from: &NodeName, to: &NodeName, hops: Vec<NodeName>) {
        if hops.is_empty() {
            return;
        }
        let mut registry = self.write();
        let key = (from.clone(), to.clone());
        // Keep the shortest known route.
        let replace = registry
            .routes
            .get(&key)
            .map(|existing| hops.len() < existing.len())
            .unwrap_or(true);
        if replace {
            registry.routes.insert(key, hops);
        }
    }

    fn route(&self, from: &NodeName, to: &NodeName) -> Option<Vec<NodeName>> {
        self.read()
            .routes
            .get(&(from.clone(), to.clone()))
            .cloned()
    }
}
