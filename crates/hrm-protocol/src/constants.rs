/// Default Bully priority of a node at any hierarchy level.
pub const DEFAULT_BULLY_PRIORITY: f64 = 1.0;

/// Priority bonus granted for every newly discovered neighbor cluster.
/// Nodes sitting at link crossings become more likely coordinators.
pub const CONNECTIVITY_PRIORITY_OFFSET: f64 = 100.0;

/// Number of hierarchy levels, base level included.
pub const DEFAULT_HIERARCHY_HEIGHT: u8 = 3;

/// Address bits reserved for every hierarchy level inside an HRMID.
pub const BITS_PER_HIERARCHY_LEVEL: u32 = 8;

/// Maximum cluster distance that discovery and FIB visibility reach.
pub const EXPANSION_MAX_RADIUS: u32 = 4;

/// How long an election round waits for BullyReply messages.
pub const ELECTION_REPLY_TIMEOUT_MS: u64 = 1_000;

/// How long a losing candidate waits for the winner's BullyAnnounce.
pub const ANNOUNCE_TIMEOUT_MS: u64 = 5_000;

/// Interval between BullyAlive heartbeats sent by a coordinator.
pub const COORDINATOR_ALIVE_INTERVAL_MS: u64 = 2_000;

/// Silence after which a coordinator is considered lost.
pub const COORDINATOR_TIMEOUT_MS: u64 = 6_000;

/// How long a RequestCoordinator waits for its first answer.
pub const DISCOVERY_REPLY_TIMEOUT_MS: u64 = 10_000;

/// Delay between winning an election and distributing addresses.
pub const ADDRESS_DISTRIBUTION_DELAY_MS: u64 = 5_000;

/// Maximum encoded size of a single envelope.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Default domain used to derive the identity of superior clusters.
pub const DEFAULT_DOMAIN: &str = "hrm";

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "/hrm/signaling/1.0.0";
