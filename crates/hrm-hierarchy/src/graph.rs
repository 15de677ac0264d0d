//! Undirected graph of clusters.
//!
//! Nodes are cluster identities, edges are tagged PHYSICAL (the two clusters
//! are held on the same node, i.e. direct transport adjacency) or LOGICAL
//! (adjacency only known through gossip). Edges are stored symmetrically and
//! never duplicated. Shortest paths minimise hop count first and the number
//! of logical links second, so physical links win at equal length.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use hrm_protocol::ClusterName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LinkType {
    PhysicalLink,
    LogicalLink,
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkType::PhysicalLink => write!(f, "PHYSICAL_LINK"),
            LinkType::LogicalLink => write!(f, "LOGICAL_LINK"),
        }
    }
}

/// An edge, oriented along the direction it is traversed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClusterLink<N> {
    pub from: N,
    pub to: N,
    pub link_type: LinkType,
}

#[derive(Debug, Clone)]
pub struct RoutableClusterGraph<N: Ord + Clone> {
    adjacency: BTreeMap<N, BTreeMap<N, LinkType>>,
}

impl<N: Ord + Clone> Default for RoutableClusterGraph<N> {
    fn default() -> Self {
        Self {
            adjacency: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Clone> RoutableClusterGraph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Returns false if it was already present.
    pub fn add_node(&mut self, node: N) -> bool {
        if self.adjacency.contains_key(&node) {
            return false;
        }
        self.adjacency.insert(node, BTreeMap::new());
        true
    }

    pub fn contains(&self, node: &N) -> bool {
        self.adjacency.contains_key(node)
    }

    /// Remove a node together with all its edges.
    pub fn remove_node(&mut self, node: &N) -> bool {
        let Some(neighbors) = self.adjacency.remove(node) else {
            return false;
        };
        for neighbor in neighbors.keys() {
            if let Some(edges) = self.adjacency.get_mut(neighbor) {
                edges.remove(node);
            }
        }
        true
    }

    /// Move every edge of `old` onto `new` and drop `old`.
    pub fn replace_node(&mut self, old: &N, new: N) -> bool {
        if old == &new {
            return false;
        }
        let Some(neighbors) = self.adjacency.get(old).cloned() else {
            return false;
        };
        self.remove_node(old);
        self.add_node(new.clone());
        for (neighbor, link_type) in neighbors {
            if neighbor != new {
                self.store_link(new.clone(), neighbor, link_type);
            }
        }
        true
    }

    /// Insert an undirected edge, adding missing endpoints. Returns true if
    /// a new edge was created. A logical edge is upgraded in place when the
    /// same pair becomes physically adjacent.
    pub fn store_link(&mut self, a: N, b: N, link_type: LinkType) -> bool {
        if a == b {
            return false;
        }
        self.add_node(a.clone());
        self.add_node(b.clone());

        let existing = self.link_type(&a, &b);
        match existing {
            Some(current) => {
                if current == LinkType::LogicalLink && link_type == LinkType::PhysicalLink {
                    self.set_link(&a, &b, LinkType::PhysicalLink);
                }
                false
            }
            None => {
                self.set_link(&a, &b, link_type);
                true
            }
        }
    }

    fn set_link(&mut self, a: &N, b: &N, link_type: LinkType) {
        if let Some(edges) = self.adjacency.get_mut(a) {
            edges.insert(b.clone(), link_type);
        }
        if let Some(edges) = self.adjacency.get_mut(b) {
            edges.insert(a.clone(), link_type);
        }
    }

    pub fn remove_link(&mut self, a: &N, b: &N) -> bool {
        let removed = self
            .adjacency
            .get_mut(a)
            .map(|edges| edges.remove(b).is_some())
            .unwrap_or(false);
        if let Some(edges) = self.adjacency.get_mut(b) {
            edges.remove(a);
        }
        removed
    }

    pub fn get_neighbors(&self, node: &N) -> Vec<N> {
        self.adjacency
            .get(node)
            .map(|edges| edges.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_linked(&self, a: &N, b: &N) -> bool {
        self.link_type(a, b).is_some()
    }

    pub fn link_type(&self, a: &N, b: &N) -> Option<LinkType> {
        self.adjacency.get(a).and_then(|edges| edges.get(b)).copied()
    }

    /// Shortest path as an ordered list of links. `None` if either endpoint
    /// is unknown or unreachable; empty if `from == to`.
    pub fn get_route(&self, from: &N, to: &N) -> Option<Vec<ClusterLink<N>>> {
        self.shortest_path(from, to, &BTreeSet::new())
    }

    /// Shortest path that does not pass through any of `ignored`.
    pub fn get_route_avoiding(
        &self,
        from: &N,
        to: &N,
        ignored: &[N],
    ) -> Option<Vec<ClusterLink<N>>> {
        let ignored: BTreeSet<&N> = ignored.iter().collect();
        self.shortest_path(from, to, &ignored)
    }

    /// Nodes along the shortest path, excluding `from`, including `to`.
    pub fn get_intermediate_nodes(&self, from: &N, to: &N) -> Vec<N> {
        self.get_route(from, to)
            .map(|route| route.into_iter().map(|link| link.to).collect())
            .unwrap_or_default()
    }

    /// Hop distance from `node` to every reachable node.
    pub fn distances_from(&self, node: &N) -> BTreeMap<N, u32> {
        let mut distances = BTreeMap::new();
        if !self.contains(node) {
            return distances;
        }
        let mut queue = VecDeque::new();
        distances.insert(node.clone(), 0);
        queue.push_back(node.clone());
        while let Some(current) = queue.pop_front() {
            let depth = distances.get(&current).copied().unwrap_or(0);
            for neighbor in self.get_neighbors(&current) {
                if !distances.contains_key(&neighbor) {
                    distances.insert(neighbor.clone(), depth + 1);
                    queue.push_back(neighbor);
                }
            }
        }
        distances
    }

    pub fn nodes(&self) -> Vec<N> {
        self.adjacency.keys().cloned().collect()
    }

    /// Every edge once, with `from < to`.
    pub fn links(&self) -> Vec<ClusterLink<N>> {
        let mut links = Vec::new();
        for (a, edges) in &self.adjacency {
            for (b, link_type) in edges {
                if a < b {
                    links.push(ClusterLink {
                        from: a.clone(),
                        to: b.clone(),
                        link_type: *link_type,
                    });
                }
            }
        }
        links
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn link_count(&self) -> usize {
        self.adjacency.values().map(|edges| edges.len()).sum::<usize>() / 2
    }

    fn shortest_path(
        &self,
        from: &N,
        to: &N,
        ignored: &BTreeSet<&N>,
    ) -> Option<Vec<ClusterLink<N>>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        if from == to {
            return Some(Vec::new());
        }

        // Cost is (hops, logical links); lexicographic order prefers physical
        // links among equally short paths.
        let mut best: BTreeMap<N, (u32, u32)> = BTreeMap::new();
        let mut previous: BTreeMap<N, N> = BTreeMap::new();
        let mut heap = BinaryHeap::new();
        best.insert(from.clone(), (0, 0));
        heap.push(Reverse((0u32, 0u32, from.clone())));

        while let Some(Reverse((hops, logical, node))) = heap.pop() {
            if &node == to {
                break;
            }
            if best.get(&node).is_some_and(|cost| *cost < (hops, logical)) {
                continue;
            }
            let Some(edges) = self.adjacency.get(&node) else {
                continue;
            };
            for (neighbor, link_type) in edges {
                if neighbor != to && ignored.contains(neighbor) {
                    continue;
                }
                let cost = (
                    hops + 1,
                    logical + u32::from(*link_type == LinkType::LogicalLink),
                );
                let improves = best.get(neighbor).map(|known| cost < *known).unwrap_or(true);
                if improves {
                    best.insert(neighbor.clone(), cost);
                    previous.insert(neighbor.clone(), node.clone());
                    heap.push(Reverse((cost.0, cost.1, neighbor.clone())));
                }
            }
        }

        if !previous.contains_key(to) {
            return None;
        }
        let mut path = vec![to.clone()];
        let mut cursor = to.clone();
        while let Some(prev) = previous.get(&cursor) {
            path.push(prev.clone());
            if prev == from {
                break;
            }
            cursor = prev.clone();
        }
        path.reverse();

        let mut route = Vec::with_capacity(path.len().saturating_sub(1));
        for pair in path.windows(2) {
            let link_type = self.link_type(&pair[0], &pair[1])?;
            route.push(ClusterLink {
                from: pair[0].clone(),
                to: pair[1].clone(),
                link_type,
            });
        }
        Some(route)
    }
}

/// The cluster graph of one node, shared between its clusters and read by
/// route resolution and external observers.
pub type SharedClusterGraph = Arc<RwLock<RoutableClusterGraph<ClusterName>>>;

pub fn shared_graph() -> SharedClusterGraph {
    Arc::new(RwLock::new(RoutableClusterGraph::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_symmetric_and_unique() {
        let mut graph = RoutableClusterGraph::new();
        assert!(graph.store_link(1, 2, LinkType::LogicalLink));
        assert!(!graph.store_link(2, 1, LinkType::LogicalLink));
        assert!(graph.is_linked(&1, &2));
        assert!(graph.is_linked(&2, &1));
        assert_eq!(graph.link_count(), 1);
        assert!(!graph.store_link(3, 3, LinkType::PhysicalLink));
    }

    #[test]
    fn logical_link_upgrades_to_physical() {
        let mut graph = RoutableClusterGraph::new();
        graph.store_link(1, 2, LinkType::LogicalLink);
        assert!(!graph.store_link(1, 2, LinkType::PhysicalLink));
        assert_eq!(graph.link_type(&2, &1), Some(LinkType::PhysicalLink));
        assert!(!graph.store_link(1, 2, LinkType::LogicalLink));
        assert_eq!(graph.link_type(&1, &2), Some(LinkType::PhysicalLink));
    }

    #[test]
    fn physical_route_preferred_at_equal_length() {
        // 1 - 2 - 4 (logical) and 1 - 3 - 4 (physical)
        let mut graph = RoutableClusterGraph::new();
        graph.store_link(1, 2, LinkType::LogicalLink);
        graph.store_link(2, 4, LinkType::LogicalLink);
        graph.store_link(1, 3, LinkType::PhysicalLink);
        graph.store_link(3, 4, LinkType::PhysicalLink);
        assert_eq!(graph.get_intermediate_nodes(&1, &4), vec![3, 4]);
    }

    #[test]
    fn route_avoiding_detours() {
        let mut graph = RoutableClusterGraph::new();
        graph.store_link(1, 2, LinkType::PhysicalLink);
        graph.store_link(2, 3, LinkType::PhysicalLink);
        graph.store_link(1, 4, LinkType::LogicalLink);
        graph.store_link(4, 5, LinkType::LogicalLink);
        graph.store_link(5, 3, LinkType::LogicalLink);
        let detour = graph.get_route_avoiding(&1, &3, &[2]).unwrap();
        assert_eq!(detour.len(), 3);
        assert!(graph.get_route_avoiding(&1, &3, &[2, 5]).is_none());
    }

    #[test]
    fn replace_node_moves_edges() {
        let mut graph = RoutableClusterGraph::new();
        graph.store_link(1, 2, LinkType::PhysicalLink);
        graph.store_link(1, 3, LinkType::LogicalLink);
        assert!(graph.replace_node(&1, 10));
        assert!(!graph.contains(&1));
        assert_eq!(graph.get_neighbors(&10), vec![2, 3]);
        assert_eq!(graph.link_type(&3, &10), Some(LinkType::LogicalLink));
        assert!(!graph.replace_node(&99, 100));
    }

    #[test]
    fn removed_link_splits_routes() {
        let mut graph = RoutableClusterGraph::new();
        graph.store_link(1, 2, LinkType::LogicalLink);
        graph.store_link(2, 3, LinkType::LogicalLink);
        assert!(graph.remove_link(&3, &2));
        assert!(!graph.remove_link(&2, &3));
        assert!(graph.get_route(&1, &3).is_none());
        assert!(graph.get_neighbors(&3).is_empty());
        assert!(graph.contains(&3));
    }

    #[test]
    fn unreachable_and_trivial_routes() {
        let mut graph = RoutableClusterGraph::new();
        graph.add_node(1);
        graph.add_node(2);
        assert!(graph.get_route(&1, &2).is_none());
        assert_eq!(graph.get_route(&1, &1), Some(Vec::new()));
        assert!(graph.get_route(&1, &7).is_none());
    }
}
