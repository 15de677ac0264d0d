//! Configuration loading from TOML and environment variables.
//!
//! A configuration file describes both the protocol parameters and the
//! topology to run:
//!
//! ```toml
//! [protocol]
//! height = 3
//!
//! [[nodes]]
//! name = "a"
//! priority = 5.0
//!
//! [[links]]
//! a = "a"
//! b = "b"
//! cluster = 1
//! ```
//!
//! Environment variables with the prefix `HRM_` override file values.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use hrm_hierarchy::{DiscoveryConfig, ElectionConfig, HrmConfig, LivenessConfig};
use hrm_protocol::{BullyPriority, NodeName};

use crate::NodeError;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

/// Protocol timing and shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Number of hierarchy levels, base level included.
    #[serde(default = "default_height")]
    pub height: u8,
    /// Seed for superior cluster identities.
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_announce_timeout")]
    pub announce_timeout_ms: u64,
    #[serde(default = "default_alive_interval")]
    pub alive_interval_ms: u64,
    #[serde(default = "default_coordinator_timeout")]
    pub coordinator_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
    /// Maximum cluster distance for discovery and FIB visibility.
    #[serde(default = "default_radius")]
    pub radius: u32,
    #[serde(default = "default_distribution_delay")]
    pub address_distribution_delay_ms: u64,
    #[serde(default = "default_connectivity_offset")]
    pub connectivity_offset: f64,
    #[serde(default)]
    pub discover_on_new_neighbor: bool,
    /// Shared secret for coordinator signing keys. Without it every node
    /// generates its key at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

/// Simulation driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Virtual (or, with `--realtime`, wall clock) run time.
    #[serde(default = "default_duration")]
    pub duration_ms: u64,
    /// Seed for link interleaving and cluster tokens.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "hrm_hierarchy=debug").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output JSON-formatted logs.
    #[serde(default)]
    pub json_format: bool,
}

/// One node of the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Node belongs to another administrative domain.
    #[serde(default)]
    pub foreign: bool,
}

/// One physical link. With a cluster id, both ends join that base-level
/// cluster; without one the link is a bare adjacency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: String,
    pub b: String,
    #[serde(default)]
    pub cluster: Option<i64>,
}

// -- Defaults --

fn default_height() -> u8 {
    hrm_protocol::DEFAULT_HIERARCHY_HEIGHT
}
fn default_domain() -> String {
    hrm_protocol::DEFAULT_DOMAIN.to_string()
}
fn default_reply_timeout() -> u64 {
    hrm_protocol::ELECTION_REPLY_TIMEOUT_MS
}
fn default_announce_timeout() -> u64 {
    hrm_protocol::ANNOUNCE_TIMEOUT_MS
}
fn default_alive_interval() -> u64 {
    hrm_protocol::COORDINATOR_ALIVE_INTERVAL_MS
}
fn default_coordinator_timeout() -> u64 {
    hrm_protocol::COORDINATOR_TIMEOUT_MS
}
fn default_discovery_timeout() -> u64 {
    hrm_protocol::DISCOVERY_REPLY_TIMEOUT_MS
}
fn default_radius() -> u32 {
    hrm_protocol::EXPANSION_MAX_RADIUS
}
fn default_distribution_delay() -> u64 {
    hrm_protocol::ADDRESS_DISTRIBUTION_DELAY_MS
}
fn default_connectivity_offset() -> f64 {
    hrm_protocol::CONNECTIVITY_PRIORITY_OFFSET
}
fn default_duration() -> u64 {
    60_000
}
fn default_seed() -> u64 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_priority() -> f64 {
    hrm_protocol::DEFAULT_BULLY_PRIORITY
}

// -- Trait impls --

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            height: default_height(),
            domain: default_domain(),
            reply_timeout_ms: default_reply_timeout(),
            announce_timeout_ms: default_announce_timeout(),
            alive_interval_ms: default_alive_interval(),
            coordinator_timeout_ms: default_coordinator_timeout(),
            discovery_timeout_ms: default_discovery_timeout(),
            radius: default_radius(),
            address_distribution_delay_ms: default_distribution_delay(),
            connectivity_offset: default_connectivity_offset(),
            discover_on_new_neighbor: false,
            signing_secret: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_duration(),
            seed: default_seed(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, priority: f64) -> Self {
        Self {
            name: name.into(),
            priority,
            foreign: false,
        }
    }

    pub fn node_name(&self) -> NodeName {
        NodeName::new(self.name.clone())
    }

    pub fn bully_priority(&self) -> BullyPriority {
        BullyPriority::new(self.priority)
    }
}

impl LinkSpec {
    pub fn new(a: impl Into<String>, b: impl Into<String>, cluster: Option<i64>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            cluster,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, with environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let mut config = if let Some(path) = path {
            if path.exists() {
                Self::from_file(path)?
            } else {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not found, using defaults"
                );
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HRM_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("HRM_HEIGHT") {
            if let Ok(height) = val.parse() {
                self.protocol.height = height;
            }
        }
        if let Ok(val) = std::env::var("HRM_REPLY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.protocol.reply_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("HRM_ALIVE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.protocol.alive_interval_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("HRM_COORDINATOR_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.protocol.coordinator_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("HRM_DISCOVERY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.protocol.discovery_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("HRM_RADIUS") {
            if let Ok(radius) = val.parse() {
                self.protocol.radius = radius;
            }
        }
        if let Ok(val) = std::env::var("HRM_SEED") {
            if let Ok(seed) = val.parse() {
                self.simulation.seed = seed;
            }
        }
        if let Ok(val) = std::env::var("HRM_SIGNING_SECRET") {
            self.protocol.signing_secret = Some(val);
        }
        if let Ok(val) = std::env::var("HRM_DOMAIN") {
            self.protocol.domain = val;
        }
        if let Ok(val) = std::env::var("HRM_LOG_JSON") {
            self.logging.json_format = val == "true" || val == "1";
        }
    }

    /// Protocol configuration handed to every controller.
    pub fn hrm_config(&self) -> HrmConfig {
        let protocol = &self.protocol;
        HrmConfig {
            height: protocol.height,
            domain: protocol.domain.clone(),
            connectivity_offset: protocol.connectivity_offset,
            address_distribution_delay_ms: protocol.address_distribution_delay_ms,
            seed: self.simulation.seed,
            signing_secret: protocol.signing_secret.clone(),
            election: ElectionConfig::with_timeouts(protocol.reply_timeout_ms, protocol.announce_timeout_ms),
            liveness: LivenessConfig::with_timeouts(protocol.alive_interval_ms, protocol.coordinator_timeout_ms),
            discovery: DiscoveryConfig {
                radius: protocol.radius,
                reply_timeout_ms: protocol.discovery_timeout_ms,
                discover_on_new_neighbor: protocol.discover_on_new_neighbor,
            },
        }
    }

    /// Check that node names are unique and links join known, distinct nodes.
    pub fn validate(&self) -> Result<(), NodeError> {
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(NodeError::InvalidTopology("node without a name".into()));
            }
            if !node.priority.is_finite() {
                return Err(NodeError::InvalidTopology(format!("priority of {}", node.name)));
            }
            if !names.insert(node.name.as_str()) {
                return Err(NodeError::DuplicateNode(node.name.clone()));
            }
        }
        let mut pairs = BTreeSet::new();
        for link in &self.links {
            for end in [&link.a, &link.b] {
                if !names.contains(end.as_str()) {
                    return Err(NodeError::UnknownNode(end.clone()));
                }
            }
            if link.a == link.b {
                return Err(NodeError::InvalidTopology(format!("self link on {}", link.a)));
            }
            let pair = if link.a < link.b {
                (link.a.as_str(), link.b.as_str())
            } else {
                (link.b.as_str(), link.a.as_str())
            };
            if !pairs.insert(pair) {
                return Err(NodeError::InvalidTopology(format!("duplicate link {}-{}", pair.0, pair.1)));
            }
        }
        if self.protocol.height == 0 {
            return Err(NodeError::InvalidTopology("height must be at least 1".into()));
        }
        Ok(())
    }

    /// A line of `n` nodes in one base-level cluster, the last node with
    /// the highest priority.
    pub fn line(n: usize) -> Self {
        let nodes: Vec<NodeSpec> = (0..n)
            .map(|i| NodeSpec::new(format!("node-{}", i), (i + 1) as f64))
            .collect();
        let links = (1..n)
            .map(|i| LinkSpec::new(format!("node-{}", i - 1), format!("node-{}", i), Some(1)))
            .collect();
        Self {
            nodes,
            links,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_parses_from_toml() {
        let raw = r#"
            [protocol]
            height = 2
            radius = 3

            [simulation]
            seed = 42

            [[nodes]]
            name = "a"
            priority = 5.0

            [[nodes]]
            name = "b"
            foreign = true

            [[links]]
            a = "a"
            b = "b"
            cluster = 7
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.protocol.height, 2);
        assert_eq!(config.protocol.reply_timeout_ms, hrm_protocol::ELECTION_REPLY_TIMEOUT_MS);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].priority, hrm_protocol::DEFAULT_BULLY_PRIORITY);
        assert!(config.nodes[1].foreign);
        assert_eq!(config.links[0].cluster, Some(7));
        assert!(config.validate().is_ok());

        let hrm = config.hrm_config();
        assert_eq!(hrm.seed, 42);
        assert_eq!(hrm.discovery.radius, 3);
        assert!(hrm.signing_secret.is_none());
    }

    #[test]
    fn timing_reaches_the_protocol_config() {
        let raw = r#"
            [protocol]
            alive_interval_ms = 700
            coordinator_timeout_ms = 9000
            reply_timeout_ms = 300
            announce_timeout_ms = 1200
            signing_secret = "lab-secret"
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        let hrm = config.hrm_config();
        assert_eq!(hrm.liveness.alive_interval_ms, 700);
        assert_eq!(hrm.liveness.timeout_ms, 9000);
        assert_eq!(hrm.election.reply_timeout_ms, 300);
        assert_eq!(hrm.election.announce_timeout_ms, 1200);
        assert_eq!(hrm.signing_secret.as_deref(), Some("lab-secret"));
    }

    #[test]
    fn links_must_join_known_nodes() {
        let mut config = NodeConfig::line(2);
        config.links.push(LinkSpec::new("node-0", "ghost", None));
        assert!(matches!(config.validate(), Err(NodeError::UnknownNode(name)) if name == "ghost"));
    }

    #[test]
    fn duplicate_links_are_rejected() {
        let mut config = NodeConfig::line(2);
        config.links.push(LinkSpec::new("node-1", "node-0", None));
        assert!(matches!(config.validate(), Err(NodeError::InvalidTopology(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = NodeConfig::load(Some(Path::new("/nonexistent/hrm.toml"))).unwrap();
        assert!(config.nodes.is_empty());
        assert_eq!(config.simulation.duration_ms, 60_000);
    }
}
