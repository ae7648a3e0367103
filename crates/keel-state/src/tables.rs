//! redb table definitions for the Keel state store.
//!
//! Row tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Compound keys join their lower-cased parts with `\0`, so a scan
//! over `"{node}\0"` yields every row owned by a node.
//!
//! Each secondary index is its own table mapping `"{value}\0{primary}"` to
//! the primary key.

use redb::TableDefinition;

pub(crate) type RowTable = TableDefinition<'static, &'static str, &'static [u8]>;
pub(crate) type IndexTable = TableDefinition<'static, &'static str, &'static str>;

/// Highest write index per table, keyed by table name.
pub const INDEX: TableDefinition<&str, u64> = TableDefinition::new("index");

pub const NODES: &str = "nodes";
pub const SERVICES: &str = "services";
pub const CHECKS: &str = "checks";
pub const SESSIONS: &str = "sessions";
pub const SESSION_CHECKS: &str = "session_checks";
pub const KVS: &str = "kvs";
pub const TOMBSTONES: &str = "tombstones";
pub const COORDINATES: &str = "coordinates";
pub const ACLS: &str = "acls";
pub const PREPARED_QUERIES: &str = "prepared-queries";
pub const AUTOPILOT: &str = "autopilot-config";

/// Every table whose writes are tracked in [`INDEX`].
pub const TRACKED_TABLES: &[&str] = &[
    NODES,
    SERVICES,
    CHECKS,
    SESSIONS,
    KVS,
    TOMBSTONES,
    COORDINATES,
    ACLS,
    PREPARED_QUERIES,
    AUTOPILOT,
];

/// A declared secondary index: its name and the table backing it.
#[derive(Debug)]
pub(crate) struct Index {
    pub name: &'static str,
    pub table: &'static str,
}

impl Index {
    pub const fn new(name: &'static str, table: &'static str) -> Self {
        Self { name, table }
    }

    pub fn definition(&self) -> IndexTable {
        TableDefinition::new(self.table)
    }
}

/// Join key parts with `\0`, lower-casing each one.
pub(crate) fn compound(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push('\0');
        }
        key.push_str(&part.to_lowercase());
    }
    key
}

/// Backing-table key for one secondary index entry.
pub(crate) fn index_key(value: &str, primary: &str) -> String {
    format!("{value}\0{primary}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_lowercases_and_joins() {
        assert_eq!(compound(&["Node-1", "Web"]), "node-1\0web");
        assert_eq!(compound(&["n1", ""]), "n1\0");
    }
}
