//! Local forwarding table.
//!
//! Entries are keyed by destination; a table never holds two entries for the
//! same destination. Merging follows one deterministic precedence rule:
//!
//! 1. the entry's signature must verify and belong to an approved signer
//! 2. locally installed (write-protected) entries are never replaced
//! 3. an entry from a higher coordinator level replaces a lower one
//! 4. at equal level, a strictly newer signature timestamp replaces
//! 5. otherwise the existing entry is kept
//!
//! A push replaces the earlier push of the same coordinator for the same
//! cluster: entries it no longer carries are withdrawn.

use std::collections::BTreeMap;

use serde::Serialize;

use hrm_protocol::{ClusterKey, FibEntry, Hrmid, L2Address, NodeName, TopologyData};

use crate::signatures::ApprovedSignatures;
use crate::StateError;

/// Result of merging a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    KeptExisting,
    Rejected,
}

/// Summary of merging a TopologyData push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub inserted: usize,
    pub replaced: usize,
    pub kept: usize,
    pub rejected: usize,
    /// Entries of an earlier push that this push no longer carries.
    pub withdrawn: usize,
}

impl MergeReport {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Replaced => self.replaced += 1,
            MergeOutcome::KeptExisting => self.kept += 1,
            MergeOutcome::Rejected => self.rejected += 1,
        }
    }

    /// Whether the push changed the table.
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced + self.withdrawn > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingEntry {
    pub entry: FibEntry,
    pub write_protected: bool,
    /// Cluster of the push that installed the entry, if it came in one.
    pub origin: Option<ClusterKey>,
}

/// Whether `candidate` takes precedence over `existing`.
pub fn supersedes(candidate: &FibEntry, existing: &RoutingEntry) -> bool {
    if existing.write_protected {
        return false;
    }
    let current = &existing.entry;
    if candidate.level() != current.level() {
        return candidate.level() > current.level();
    }
    candidate.signature.issued_at > current.signature.issued_at
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: BTreeMap<Hrmid, RoutingEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a write-protected entry produced by this node itself.
    pub fn insert_local(&mut self, entry: FibEntry) -> Result<(), StateError> {
        if entry.destination.is_unassigned() {
            return Err(StateError::InvalidEntry("unassigned destination".into()));
        }
        if let Some(existing) = self.entries.get(&entry.destination) {
            if existing.write_protected {
                return Err(StateError::WriteProtected(entry.destination.to_string()));
            }
        }
        self.entries.insert(
            entry.destination,
            RoutingEntry {
                entry,
                write_protected: true,
                origin: None,
            },
        );
        Ok(())
    }

    /// Merge one received entry.
    pub fn merge_entry(&mut self, entry: FibEntry, approved: &ApprovedSignatures) -> MergeOutcome {
        if entry.destination.is_unassigned() {
            tracing::warn!(next_hop = %entry.next_hop, "Rejecting entry without destination");
            return MergeOutcome::Rejected;
        }
        if let Err(e) = approved.validate(&entry.signature) {
            tracing::warn!(
                destination = %entry.destination,
                signer = %entry.signature.signer,
                error = %e,
                "Rejecting forwarding entry"
            );
            return MergeOutcome::Rejected;
        }

        match self.entries.get_mut(&entry.destination) {
            None => {
                self.entries.insert(
                    entry.destination,
                    RoutingEntry {
                        entry,
                        write_protected: false,
                        origin: None,
                    },
                );
                MergeOutcome::Inserted
            }
            Some(existing) => {
                if supersedes(&entry, existing) {
                    tracing::debug!(
                        destination = %entry.destination,
                        old_signer = %existing.entry.signature.signer,
                        new_signer = %entry.signature.signer,
                        "Forwarding entry replaced"
                    );
                    existing.entry = entry;
                    existing.origin = None;
                    MergeOutcome::Replaced
                } else {
                    MergeOutcome::KeptExisting
                }
            }
        }
    }

    /// Merge every entry of a TopologyData push.
    pub fn merge_topology(
        &mut self,
        data: &TopologyData,
        approved: &ApprovedSignatures,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        if approved.validate(&data.signature).is_ok() {
            report.withdrawn = self.withdraw_superseded(data);
        }
        let origin = data.cluster.key();
        for entry in data.entries() {
            let destination = entry.destination;
            let outcome = self.merge_entry(entry.clone(), approved);
            if matches!(outcome, MergeOutcome::Inserted | MergeOutcome::Replaced) {
                if let Some(installed) = self.entries.get_mut(&destination) {
                    installed.origin = Some(origin);
                }
            }
            report.record(outcome);
        }
        tracing::debug!(
            hrmid = %data.hrmid,
            signer = %data.signature.signer,
            inserted = report.inserted,
            replaced = report.replaced,
            kept = report.kept,
            rejected = report.rejected,
            withdrawn = report.withdrawn,
            "Topology data merged"
        );
        report
    }

    /// Drop entries an earlier push of the same signer for the same cluster
    /// installed that `data` no longer carries. Entries newer than `data`
    /// are left alone.
    fn withdraw_superseded(&mut self, data: &TopologyData) -> usize {
        let origin = data.cluster.key();
        let signer = &data.signature.signer;
        let issued_at = data.signature.issued_at;
        let before = self.entries.len();
        self.entries.retain(|destination, e| {
            e.write_protected
                || e.origin != Some(origin)
                || &e.entry.signature.signer != signer
                || e.entry.signature.issued_at > issued_at
                || data.entries().iter().any(|entry| entry.destination == *destination)
        });
        before - self.entries.len()
    }

    /// Exact lookup.
    pub fn lookup(&self, destination: &Hrmid) -> Option<&FibEntry> {
        self.entries.get(destination).map(|e| &e.entry)
    }

    /// Longest hierarchical prefix match: the exact address first, then the
    /// address with ever more low-order levels cleared.
    pub fn resolve(&self, destination: &Hrmid) -> Option<&FibEntry> {
        if let Some(entry) = self.lookup(destination) {
            return Some(entry);
        }
        let mut previous = *destination;
        for level in 1..(u64::BITS / hrm_protocol::BITS_PER_HIERARCHY_LEVEL) {
            let prefix = destination.prefix(level);
            if prefix.is_unassigned() {
                break;
            }
            if prefix == previous {
                continue;
            }
            previous = prefix;
            if let Some(entry) = self.lookup(&prefix) {
                return Some(entry);
            }
        }
        None
    }

    /// Drop every received entry signed by `signer`.
    pub fn remove_signed_by(&mut self, signer: &NodeName) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.write_protected || &e.entry.signature.signer != signer);
        before - self.entries.len()
    }

    /// Drop every received entry that forwards to `next_hop`.
    pub fn remove_via(&mut self, next_hop: L2Address) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.write_protected || e.entry.next_hop != next_hop);
        before - self.entries.len()
    }

    /// Remove an entry, write-protected ones included.
    pub fn remove(&mut self, destination: &Hrmid) -> Option<RoutingEntry> {
        self.entries.remove(destination)
    }

    pub fn get(&self, destination: &Hrmid) -> Option<&RoutingEntry> {
        self.entries.get(destination)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Hrmid, &RoutingEntry)> {
        self.entries.iter()
    }

    pub fn destinations(&self) -> Vec<Hrmid> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON snapshot for external consumers.
    pub fn to_json(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|(destination, e)| {
                serde_json::json!({
                    "destination": destination.to_string(),
                    "next_hop": e.entry.next_hop.to_string(),
                    "next_cluster": e.entry.next_cluster.to_string(),
                    "signer": e.entry.signature.signer,
                    "level": e.entry.level().value(),
                    "write_protected": e.write_protected,
                })
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hrm_protocol::{ClusterName, HierarchyLevel, L2Address, NodeIdentity};

    fn entry(identity: &NodeIdentity, level: i32, destination: u64, hop: u64) -> FibEntry {
        let cluster = ClusterName::new(1, 1, HierarchyLevel::BASE);
        FibEntry {
            destination: Hrmid(destination),
            next_hop: L2Address(hop),
            next_cluster: cluster,
            farthest_cluster: None,
            signature: identity.sign(HierarchyLevel::new(level)),
            routing_vectors: Vec::new(),
        }
    }

    #[test]
    fn unapproved_entry_is_rejected() {
        let coordinator = NodeIdentity::derived("coord".into());
        let approved = ApprovedSignatures::new();
        let mut table = RoutingTable::new();
        assert_eq!(
            table.merge_entry(entry(&coordinator, 0, 5, 1), &approved),
            MergeOutcome::Rejected
        );
        assert!(table.is_empty());
    }

    #[test]
    fn newer_signature_replaces_at_equal_level() {
        let coordinator = NodeIdentity::derived("coord".into());
        let mut approved = ApprovedSignatures::new();
        approved.approve(&coordinator.sign(HierarchyLevel::BASE)).unwrap();
        let mut table = RoutingTable::new();

        let now = Utc::now();
        let mut older = entry(&coordinator, 0, 5, 1);
        older.signature = coordinator.sign_at(HierarchyLevel::BASE, now);
        let mut newer = entry(&coordinator, 0, 5, 2);
        newer.signature = coordinator.sign_at(HierarchyLevel::BASE, now + Duration::seconds(1));

        assert_eq!(table.merge_entry(older.clone(), &approved), MergeOutcome::Inserted);
        assert_eq!(table.merge_entry(newer, &approved), MergeOutcome::Replaced);
        assert_eq!(table.lookup(&Hrmid(5)).unwrap().next_hop, L2Address(2));
        assert_eq!(table.merge_entry(older, &approved), MergeOutcome::KeptExisting);
    }

    #[test]
    fn resolve_falls_back_to_prefix() {
        let coordinator = NodeIdentity::derived("coord".into());
        let mut approved = ApprovedSignatures::new();
        approved.approve(&coordinator.sign(HierarchyLevel::BASE)).unwrap();
        let mut table = RoutingTable::new();
        let prefix = Hrmid::from_digits(&[0, 2, 0]).unwrap();
        table.merge_entry(entry(&coordinator, 1, prefix.value(), 9), &approved);

        let inside = Hrmid::from_digits(&[0, 2, 7]).unwrap();
        assert_eq!(table.resolve(&inside).unwrap().next_hop, L2Address(9));
        let elsewhere = Hrmid::from_digits(&[0, 3, 7]).unwrap();
        assert!(table.resolve(&elsewhere).is_none());
    }

    #[test]
    fn local_entries_are_write_protected() {
        let coordinator = NodeIdentity::derived("coord".into());
        let mut approved = ApprovedSignatures::new();
        approved.approve(&coordinator.sign(HierarchyLevel::new(2))).unwrap();
        let mut table = RoutingTable::new();
        table.insert_local(entry(&coordinator, 0, 5, 1)).unwrap();
        assert_eq!(
            table.merge_entry(entry(&coordinator, 2, 5, 3), &approved),
            MergeOutcome::KeptExisting
        );
        assert!(table.insert_local(entry(&coordinator, 0, 5, 4)).is_err());
        assert_eq!(table.remove_signed_by(&"coord".into()), 0);
        assert_eq!(table.remove_via(L2Address(1)), 0);
    }

    #[test]
    fn entries_through_a_lost_hop_are_removed() {
        let coordinator = NodeIdentity::derived("coord".into());
        let mut approved = ApprovedSignatures::new();
        approved.approve(&coordinator.sign(HierarchyLevel::BASE)).unwrap();
        let mut table = RoutingTable::new();
        table.merge_entry(entry(&coordinator, 0, 5, 1), &approved);
        table.merge_entry(entry(&coordinator, 0, 6, 1), &approved);
        table.merge_entry(entry(&coordinator, 0, 7, 2), &approved);

        assert_eq!(table.remove_via(L2Address(1)), 2);
        assert_eq!(table.destinations(), vec![Hrmid(7)]);
    }
}
