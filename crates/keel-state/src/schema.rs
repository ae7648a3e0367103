//! Table schema: how each entity maps onto its row table and indexes.
//!
//! A [`Record`] names its table, derives its primary key, and reports the
//! values it contributes to each declared secondary index. An index may
//! receive zero values from a row (e.g. unlocked KV entries are absent from
//! the `session` index) or several (node meta pairs).

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::tables::*;
use crate::types::*;

pub(crate) trait Record: Serialize + DeserializeOwned + Clone {
    const TABLE: &'static str;
    const INDEXES: &'static [Index] = &[];
    /// Whether writes to this table are recorded in the `index` table.
    const TRACKED: bool = true;

    fn id(&self) -> String;

    fn index_values(&self, _index: &str) -> Vec<String> {
        Vec::new()
    }

    fn definition() -> RowTable {
        TableDefinition::new(Self::TABLE)
    }

    fn index(name: &str) -> Option<&'static Index> {
        Self::INDEXES.iter().find(|i| i.name == name)
    }
}

fn non_empty(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}

pub(crate) fn node_key(node: &str) -> String {
    node.to_lowercase()
}

pub(crate) fn service_key(node: &str, service_id: &str) -> String {
    compound(&[node, service_id])
}

pub(crate) fn check_key(node: &str, check_id: &str) -> String {
    compound(&[node, check_id])
}

/// Key of the singleton autopilot row.
pub(crate) const AUTOPILOT_KEY: &str = "config";

impl Record for Node {
    const TABLE: &'static str = NODES;
    const INDEXES: &'static [Index] = &[
        Index::new("uuid", "nodes.uuid"),
        Index::new("meta", "nodes.meta"),
    ];

    fn id(&self) -> String {
        node_key(&self.node)
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "uuid" => non_empty(&self.id.to_lowercase()),
            "meta" => self
                .meta
                .iter()
                .map(|(k, v)| format!("{k}\0{v}"))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Record for ServiceNode {
    const TABLE: &'static str = SERVICES;
    const INDEXES: &'static [Index] = &[
        Index::new("node", "services.node"),
        Index::new("service", "services.service"),
    ];

    fn id(&self) -> String {
        service_key(&self.node, &self.service_id)
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "node" => vec![node_key(&self.node)],
            "service" => vec![self.service_name.to_lowercase()],
            _ => Vec::new(),
        }
    }
}

impl Record for HealthCheck {
    const TABLE: &'static str = CHECKS;
    const INDEXES: &'static [Index] = &[
        Index::new("status", "checks.status"),
        Index::new("service", "checks.service"),
        Index::new("node", "checks.node"),
        Index::new("node_service", "checks.node_service"),
    ];

    fn id(&self) -> String {
        check_key(&self.node, &self.check_id)
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "status" => vec![self.status.as_str().to_string()],
            "service" => non_empty(&self.service_name.to_lowercase()),
            "node" => vec![node_key(&self.node)],
            // Node-level checks index under "{node}\0".
            "node_service" => vec![compound(&[&self.node, &self.service_id])],
            _ => Vec::new(),
        }
    }
}

impl Record for Session {
    const TABLE: &'static str = SESSIONS;
    const INDEXES: &'static [Index] = &[Index::new("node", "sessions.node")];

    fn id(&self) -> String {
        self.id.clone()
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "node" => vec![node_key(&self.node)],
            _ => Vec::new(),
        }
    }
}

impl Record for SessionCheck {
    const TABLE: &'static str = SESSION_CHECKS;
    const INDEXES: &'static [Index] = &[
        Index::new("node_check", "session_checks.node_check"),
        Index::new("session", "session_checks.session"),
    ];
    const TRACKED: bool = false;

    fn id(&self) -> String {
        let mut key = compound(&[&self.node, &self.check_id]);
        key.push('\0');
        key.push_str(&self.session);
        key
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "node_check" => vec![check_key(&self.node, &self.check_id)],
            "session" => vec![self.session.clone()],
            _ => Vec::new(),
        }
    }
}

impl Record for DirEntry {
    const TABLE: &'static str = KVS;
    const INDEXES: &'static [Index] = &[Index::new("session", "kvs.session")];

    fn id(&self) -> String {
        self.key.clone()
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "session" => non_empty(&self.session),
            _ => Vec::new(),
        }
    }
}

impl Record for Tombstone {
    const TABLE: &'static str = TOMBSTONES;

    fn id(&self) -> String {
        self.key.clone()
    }
}

impl Record for CoordinateEntry {
    const TABLE: &'static str = COORDINATES;

    fn id(&self) -> String {
        node_key(&self.node)
    }
}

impl Record for Acl {
    const TABLE: &'static str = ACLS;

    fn id(&self) -> String {
        self.id.clone()
    }
}

impl Record for PreparedQuery {
    const TABLE: &'static str = PREPARED_QUERIES;
    const INDEXES: &'static [Index] = &[
        Index::new("name", "prepared-queries.name"),
        Index::new("session", "prepared-queries.session"),
    ];

    fn id(&self) -> String {
        self.id.clone()
    }

    fn index_values(&self, index: &str) -> Vec<String> {
        match index {
            "name" => non_empty(&self.name.to_lowercase()),
            "session" => non_empty(&self.session),
            _ => Vec::new(),
        }
    }
}

impl Record for AutopilotConfig {
    const TABLE: &'static str = AUTOPILOT;

    fn id(&self) -> String {
        AUTOPILOT_KEY.to_string()
    }
}
