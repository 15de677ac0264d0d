use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::constants::{BITS_PER_HIERARCHY_LEVEL, DEFAULT_HIERARCHY_HEIGHT};
use crate::error::ProtocolError;

/// Logical name of a routing node. Coordinators are announced by name and
/// resolved to transport addresses through the naming service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Physical transport address of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct L2Address(pub u64);

impl std::fmt::Display for L2Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L2#{:04x}", self.0)
    }
}

/// Hierarchy level of a cluster. Level 0 is the base level; `UNDEFINED`
/// marks a level that has not been assigned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HierarchyLevel(i32);

impl HierarchyLevel {
    pub const UNDEFINED: HierarchyLevel = HierarchyLevel(-1);
    pub const BASE: HierarchyLevel = HierarchyLevel(0);

    /// Negative values collapse to `UNDEFINED`.
    pub fn new(level: i32) -> Self {
        if level < 0 {
            Self::UNDEFINED
        } else {
            Self(level)
        }
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub fn is_undefined(&self) -> bool {
        self.0 < 0
    }

    pub fn is_base_level(&self) -> bool {
        self.0 == 0
    }

    pub fn is_higher_level(&self) -> bool {
        self.0 > 0
    }

    /// The level directly above this one.
    pub fn superior(&self) -> Self {
        if self.is_undefined() {
            Self::UNDEFINED
        } else {
            Self(self.0 + 1)
        }
    }

    /// The level directly below this one, if any.
    pub fn inferior(&self) -> Option<Self> {
        if self.0 > 0 {
            Some(Self(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for HierarchyLevel {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl std::fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_undefined() {
            write!(f, "L?")
        } else {
            write!(f, "L{}", self.0)
        }
    }
}

/// Bully priority of a node for one hierarchy level.
///
/// Priorities only ever grow: every newly discovered neighbor cluster adds
/// the connectivity offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BullyPriority(f64);

impl BullyPriority {
    pub const UNDEFINED: BullyPriority = BullyPriority(-1.0);

    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_undefined(&self) -> bool {
        self.0 < 0.0
    }

    /// Add the connectivity bonus. An undefined priority starts from zero.
    pub fn increase_connectivity(&mut self, offset: f64) {
        if self.is_undefined() {
            self.0 = 0.0;
        }
        self.0 += offset.max(0.0);
    }

    /// IEEE total order, so NaN can never break election determinism.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }

    pub fn is_higher_than(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Greater
    }
}

impl Default for BullyPriority {
    fn default() -> Self {
        Self(crate::constants::DEFAULT_BULLY_PRIORITY)
    }
}

impl std::fmt::Display for BullyPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An election candidate: a node together with its priority.
///
/// Candidates are totally ordered by priority first and node name second, so
/// every observer picks the same winner without further communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub name: NodeName,
    pub priority: BullyPriority,
}

impl Candidate {
    pub fn new(name: NodeName, priority: BullyPriority) -> Self {
        Self { name, priority }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.priority)
    }
}

/// Cluster identity independent of its current incarnation (token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub cluster_id: i64,
    pub level: HierarchyLevel,
}

impl ClusterKey {
    pub fn new(cluster_id: i64, level: HierarchyLevel) -> Self {
        Self { cluster_id, level }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cluster({}, {})", self.cluster_id, self.level)
    }
}

/// The (token, cluster id, level) triple identifying one incarnation of a
/// cluster. Two representations are equal iff all three fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterName {
    pub token: i32,
    pub cluster_id: i64,
    pub level: HierarchyLevel,
}

impl ClusterName {
    pub fn new(token: i32, cluster_id: i64, level: HierarchyLevel) -> Self {
        Self {
            token,
            cluster_id,
            level,
        }
    }

    /// Identity used before a coordinator has assigned a token.
    pub fn untokened(key: ClusterKey) -> Self {
        Self::new(0, key.cluster_id, key.level)
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.cluster_id, self.level)
    }

    pub fn with_token(&self, token: i32) -> Self {
        Self::new(token, self.cluster_id, self.level)
    }

    pub fn has_token(&self) -> bool {
        self.token != 0
    }
}

impl std::fmt::Display for ClusterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cluster({}, {}, token {})",
            self.cluster_id, self.level, self.token
        )
    }
}

/// Hierarchical address. Every level owns `BITS_PER_HIERARCHY_LEVEL` bits,
/// level 0 in the least significant position. Zero means unassigned.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Hrmid(pub u64);

impl Hrmid {
    pub const UNASSIGNED: Hrmid = Hrmid(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Build an address from digits given highest level first.
    pub fn from_digits(digits: &[u64]) -> Result<Self, ProtocolError> {
        let mut hrmid = Hrmid::UNASSIGNED;
        let top = digits.len();
        for (i, digit) in digits.iter().enumerate() {
            hrmid = hrmid.with_level_address((top - 1 - i) as u32, *digit)?;
        }
        Ok(hrmid)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_unassigned(&self) -> bool {
        self.0 == 0
    }

    fn mask() -> u64 {
        (1u64 << BITS_PER_HIERARCHY_LEVEL) - 1
    }

    fn shift(level: u32) -> Option<u32> {
        let shift = level.checked_mul(BITS_PER_HIERARCHY_LEVEL)?;
        if shift < u64::BITS {
            Some(shift)
        } else {
            None
        }
    }

    /// Address digit for the given level.
    pub fn level_address(&self, level: u32) -> u64 {
        match Self::shift(level) {
            Some(shift) => (self.0 >> shift) & Self::mask(),
            None => 0,
        }
    }

    /// Copy of this address with the digit at `level` replaced.
    pub fn with_level_address(&self, level: u32, value: u64) -> Result<Self, ProtocolError> {
        if value > Self::mask() {
            return Err(ProtocolError::AddressOverflow {
                value,
                bits: BITS_PER_HIERARCHY_LEVEL,
            });
        }
        let shift = Self::shift(level).ok_or(ProtocolError::LevelOutOfRange {
            level: level as i32,
            height: (u64::BITS / BITS_PER_HIERARCHY_LEVEL) as u8,
        })?;
        let cleared = self.0 & !(Self::mask() << shift);
        Ok(Self(cleared | (value << shift)))
    }

    /// Address with every digit below `level` cleared.
    pub fn prefix(&self, level: u32) -> Self {
        match Self::shift(level) {
            Some(shift) => Self(self.0 & !((1u64 << shift) - 1)),
            None => Hrmid::UNASSIGNED,
        }
    }

    /// Highest level at which the two addresses differ.
    pub fn differing_level(&self, other: &Hrmid) -> Option<u32> {
        let diff = self.0 ^ other.0;
        if diff == 0 {
            return None;
        }
        let highest_bit = u64::BITS - 1 - diff.leading_zeros();
        Some(highest_bit / BITS_PER_HIERARCHY_LEVEL)
    }
}

impl std::fmt::Display for Hrmid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digits: Vec<String> = (0..DEFAULT_HIERARCHY_HEIGHT as u32)
            .rev()
            .map(|level| self.level_address(level).to_string())
            .collect();
        write!(f, "{}", digits.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_level_semantics() {
        let level = HierarchyLevel::new(-7);
        assert!(level.is_undefined());
        assert!(!level.is_base_level());
        assert_eq!(level.superior(), HierarchyLevel::UNDEFINED);
        assert_eq!(HierarchyLevel::BASE.superior(), HierarchyLevel::new(1));
        assert_eq!(HierarchyLevel::new(2).inferior(), Some(HierarchyLevel::new(1)));
        assert!(HierarchyLevel::BASE.inferior().is_none());
    }

    #[test]
    fn priority_never_decreases() {
        let mut priority = BullyPriority::new(3.0);
        priority.increase_connectivity(-10.0);
        assert_eq!(priority.value(), 3.0);
        priority.increase_connectivity(100.0);
        assert_eq!(priority.value(), 103.0);

        let mut undefined = BullyPriority::UNDEFINED;
        undefined.increase_connectivity(100.0);
        assert_eq!(undefined.value(), 100.0);
    }

    #[test]
    fn candidate_ties_break_on_name() {
        let a = Candidate::new("node-a".into(), BullyPriority::new(5.0));
        let b = Candidate::new("node-b".into(), BullyPriority::new(5.0));
        let c = Candidate::new("node-c".into(), BullyPriority::new(4.0));
        assert!(b > a);
        assert!(a > c);
        assert_eq!([a.clone(), b.clone(), c].iter().max(), Some(&b));
    }

    #[test]
    fn cluster_name_equality_needs_all_fields() {
        let name = ClusterName::new(7, 42, HierarchyLevel::BASE);
        assert_eq!(name, ClusterName::new(7, 42, HierarchyLevel::BASE));
        assert_ne!(name, name.with_token(8));
        assert_ne!(name, ClusterName::new(7, 42, HierarchyLevel::new(1)));
        assert_eq!(name.key(), name.with_token(8).key());
    }

    #[test]
    fn hrmid_level_addressing() {
        let hrmid = Hrmid::from_digits(&[2, 0, 3]).unwrap();
        assert_eq!(hrmid.level_address(2), 2);
        assert_eq!(hrmid.level_address(1), 0);
        assert_eq!(hrmid.level_address(0), 3);
        assert_eq!(hrmid.to_string(), "2.0.3");
        assert_eq!(hrmid.prefix(1).to_string(), "2.0.0");
        assert_eq!(hrmid.differing_level(&hrmid.prefix(1)), Some(0));
        assert_eq!(hrmid.differing_level(&hrmid), None);
        assert!(hrmid.with_level_address(0, 256).is_err());
    }
}
