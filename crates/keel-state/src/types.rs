//! Domain types for the Keel state store.
//!
//! Every mutable record carries `create_index` / `modify_index`, stamped
//! with the consensus log index of the write that created or last changed
//! it. All types are serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Key/value tags attached to a node.
pub type Meta = BTreeMap<String, String>;

// ── Node ──────────────────────────────────────────────────────────

/// A catalog node. `node` is the unique, case-insensitive name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Optional UUID. Empty means the node did not report one.
    #[serde(default)]
    pub id: String,
    pub node: String,
    pub address: String,
    #[serde(default)]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Node {
    /// True when every filter pair is present in the node's meta.
    pub fn matches_meta(&self, filters: &Meta) -> bool {
        filters
            .iter()
            .all(|(k, v)| self.meta.get(k).is_some_and(|mv| mv == v))
    }
}

// ── Service ───────────────────────────────────────────────────────

/// A service instance as registered against a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeService {
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub enable_tag_override: bool,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl NodeService {
    /// Compare everything except the raft indexes.
    pub fn is_same(&self, other: &NodeService) -> bool {
        self.id == other.id
            && self.service == other.service
            && self.tags == other.tags
            && self.address == other.address
            && self.port == other.port
            && self.enable_tag_override == other.enable_tag_override
    }

    /// Build the stored row. Node-level fields are filled on read.
    pub fn to_service_node(&self, node: &str) -> ServiceNode {
        ServiceNode {
            node: node.to_string(),
            service_id: self.id.clone(),
            service_name: self.service.clone(),
            service_tags: self.tags.clone(),
            service_address: self.address.clone(),
            service_port: self.port,
            service_enable_tag_override: self.enable_tag_override,
            create_index: self.create_index,
            modify_index: self.modify_index,
            ..Default::default()
        }
    }
}

/// A service instance joined with its node, as stored in the `services`
/// table. `address`, `tagged_addresses` and `node_meta` are empty in the
/// table and populated from the node row when read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceNode {
    #[serde(default)]
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub node_meta: Meta,
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub service_tags: Vec<String>,
    #[serde(default)]
    pub service_address: String,
    #[serde(default)]
    pub service_port: u16,
    #[serde(default)]
    pub service_enable_tag_override: bool,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl ServiceNode {
    pub fn to_node_service(&self) -> NodeService {
        NodeService {
            id: self.service_id.clone(),
            service: self.service_name.clone(),
            tags: self.service_tags.clone(),
            address: self.service_address.clone(),
            port: self.service_port,
            enable_tag_override: self.service_enable_tag_override,
            create_index: self.create_index,
            modify_index: self.modify_index,
        }
    }

    /// Case-insensitive exact match against any service tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.to_lowercase();
        self.service_tags.iter().any(|t| t.to_lowercase() == tag)
    }

    pub(crate) fn with_node(mut self, node: &Node) -> Self {
        self.id = node.id.clone();
        self.node = node.node.clone();
        self.address = node.address.clone();
        self.tagged_addresses = node.tagged_addresses.clone();
        self.node_meta = node.meta.clone();
        self
    }
}

/// A node together with all of its services, keyed by service ID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeServices {
    pub node: Node,
    pub services: BTreeMap<String, NodeService>,
}

// ── Health checks ─────────────────────────────────────────────────

/// Health check status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    /// Checks registered without a status start out critical.
    #[default]
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub node: String,
    pub check_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub output: String,
    /// Empty for node-level checks.
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_tags: Vec<String>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// A service instance with its node and every check that applies to it:
/// node-level checks first, then the service's own checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

/// Everything known about a single node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: String,
    pub node: String,
    pub address: String,
    pub tagged_addresses: BTreeMap<String, String>,
    pub meta: Meta,
    pub services: Vec<NodeService>,
    pub checks: Vec<HealthCheck>,
}

// ── Registration ──────────────────────────────────────────────────

/// A composite node + service + checks registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    #[serde(default)]
    pub id: String,
    pub node: String,
    pub address: String,
    #[serde(default)]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub node_meta: Meta,
    #[serde(default)]
    pub service: Option<NodeService>,
    #[serde(default)]
    pub check: Option<HealthCheck>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    /// Leave the node row untouched even if the fields above differ.
    #[serde(default)]
    pub skip_node_update: bool,
}

impl RegisterRequest {
    pub fn to_node(&self) -> Node {
        Node {
            id: self.id.clone(),
            node: self.node.clone(),
            address: self.address.clone(),
            tagged_addresses: self.tagged_addresses.clone(),
            meta: self.node_meta.clone(),
            create_index: 0,
            modify_index: 0,
        }
    }

    /// True if applying this request would modify the given node.
    pub fn changes_node(&self, node: &Node) -> bool {
        if self.skip_node_update {
            return false;
        }
        self.id != node.id
            || self.node != node.node
            || self.address != node.address
            || self.tagged_addresses != node.tagged_addresses
            || self.node_meta != node.meta
    }
}

// ── Sessions ──────────────────────────────────────────────────────

/// What happens to the locks a session holds when it is destroyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Clear the lock holder, keep the key.
    #[default]
    Release,
    /// Delete the key.
    Delete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub node: String,
    /// IDs of node checks the session depends on.
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub lock_delay: Duration,
    #[serde(default)]
    pub behavior: SessionBehavior,
    #[serde(default)]
    pub ttl: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

/// Links a (node, check) pair to a session that depends on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct SessionCheck {
    pub node: String,
    pub check_id: String,
    pub session: String,
}

// ── KV ────────────────────────────────────────────────────────────

/// A key/value entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    /// Number of times a new lock has been acquired on this key.
    #[serde(default)]
    pub lock_index: u64,
    pub key: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub value: Vec<u8>,
    /// Holder of the lock; empty when unlocked.
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl DirEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Marker left behind by a KV delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tombstone {
    pub key: String,
    pub index: u64,
}

// ── Coordinates ───────────────────────────────────────────────────

/// Network coordinate used for latency estimation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinateEntry {
    pub node: String,
    pub coord: Coordinate,
}

// ── ACLs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclType {
    #[default]
    Client,
    Management,
}

/// Legacy ACL token.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Acl {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub acl_type: AclType,
    #[serde(default)]
    pub rules: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

// ── Autopilot ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutopilotConfig {
    /// Remove dead servers when a new server joins.
    pub cleanup_dead_servers: bool,
    pub last_contact_threshold: Duration,
    pub max_trailing_logs: u64,
    /// Minimum time a server must be stable before it is promoted.
    pub server_stabilization_time: Duration,
    #[serde(default)]
    pub redundancy_zone_tag: String,
    #[serde(default)]
    pub disable_upgrade_migration: bool,
    #[serde(default)]
    pub upgrade_version_tag: String,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            cleanup_dead_servers: true,
            last_contact_threshold: Duration::from_millis(200),
            max_trailing_logs: 250,
            server_stabilization_time: Duration::from_secs(10),
            redundancy_zone_tag: String::new(),
            disable_upgrade_migration: false,
            upgrade_version_tag: String::new(),
            create_index: 0,
            modify_index: 0,
        }
    }
}

// ── Prepared queries ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceQuery {
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub only_passing: bool,
    #[serde(default)]
    pub near: String,
}

/// A stored service query, optionally owned by a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreparedQuery {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Owning session; the query is deleted when the session is destroyed.
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub token: String,
    pub service: ServiceQuery,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

// ── Index bookkeeping ─────────────────────────────────────────────

/// Highest write index seen by a table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: String,
    pub value: u64,
}

/// Service name → the union of tags across its instances.
pub type ServiceTags = BTreeMap<String, Vec<String>>;

/// Names group case-insensitively; each group is reported under the first
/// spelling seen.
pub(crate) fn collect_tags<'a>(
    services: impl IntoIterator<Item = &'a ServiceNode>,
) -> ServiceTags {
    let mut unique: BTreeMap<String, (String, BTreeSet<String>)> = BTreeMap::new();
    for svc in services {
        let (_, tags) = unique
            .entry(svc.service_name.to_lowercase())
            .or_insert_with(|| (svc.service_name.clone(), BTreeSet::new()));
        tags.extend(svc.service_tags.iter().cloned());
    }
    unique
        .into_values()
        .map(|(name, tags)| (name, tags.into_iter().collect()))
        .collect()
}
