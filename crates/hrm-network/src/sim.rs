//! Deterministic link fabric for simulations.
//!
//! Every directed link is a FIFO queue. Deliveries pick a random non-empty
//! link from a seeded generator: frames of one link keep their order while
//! different links interleave in a reproducible, seed-dependent way.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hrm_protocol::NodeName;

/// A frame taken off a link.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: NodeName,
    pub to: NodeName,
    pub bytes: Vec<u8>,
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct SimulatedLinks {
    queues: BTreeMap<(NodeName, NodeName), VecDeque<Vec<u8>>>,
    /// Failed links, stored with endpoints in ascending order.
    failed: BTreeSet<(NodeName, NodeName)>,
    rng: StdRng,
    stats: LinkStats,
}

impl SimulatedLinks {
    pub fn new(seed: u64) -> Self {
        Self {
            queues: BTreeMap::new(),
            failed: BTreeSet::new(),
            rng: StdRng::seed_from_u64(seed),
            stats: LinkStats::default(),
        }
    }

    fn undirected(a: &NodeName, b: &NodeName) -> (NodeName, NodeName) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    /// Queue a frame. Frames on failed links are dropped.
    pub fn enqueue(&mut self, from: NodeName, to: NodeName, bytes: Vec<u8>) -> bool {
        if self.failed.contains(&Self::undirected(&from, &to)) {
            self.stats.dropped += 1;
            return false;
        }
        self.queues.entry((from, to)).or_default().push_back(bytes);
        self.stats.enqueued += 1;
        true
    }

    /// Take the next frame off a randomly chosen non-empty link.
    pub fn next_delivery(&mut self) -> Option<Delivery> {
        let ready: Vec<(NodeName, NodeName)> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        if ready.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..ready.len());
        let key = ready[pick].clone();
        let bytes = self.queues.get_mut(&key)?.pop_front()?;
        self.stats.delivered += 1;
        Some(Delivery {
            from: key.0,
            to: key.1,
            bytes,
        })
    }

    /// Fail the link between `a` and `b`, dropping frames in flight.
    pub fn fail(&mut self, a: &NodeName, b: &NodeName) {
        self.failed.insert(Self::undirected(a, b));
        for key in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            if let Some(queue) = self.queues.remove(&key) {
                self.stats.dropped += queue.len() as u64;
            }
        }
    }

    pub fn heal(&mut self, a: &NodeName, b: &NodeName) {
        self.failed.remove(&Self::undirected(a, b));
    }

    /// Drop everything queued to or from `node`.
    pub fn purge(&mut self, node: &NodeName) {
        let keys: Vec<(NodeName, NodeName)> = self
            .queues
            .keys()
            .filter(|(from, to)| from == node || to == node)
            .cloned()
            .collect();
        for key in keys {
            if let Some(queue) = self.queues.remove(&key) {
                self.stats.dropped += queue.len() as u64;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(|queue| queue.len()).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}
