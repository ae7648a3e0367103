//! Point-in-time snapshots and bulk restore.
//!
//! A [`StoreSnapshot`] pins one read transaction, so every table it returns
//! comes from the same cut. [`Restore`] writes rows verbatim, keeping their
//! indexes, and raises each table's index entry to cover what it restored.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StateResult;
use crate::graveyard::Graveyard;
use crate::memdb::{ReadTxn, Reader, WriteTxn};
use crate::schema::AUTOPILOT_KEY;
use crate::store::StateStore;
use crate::tables::{COORDINATES, TRACKED_TABLES};
use crate::types::*;

/// Serializable dump of every table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotData {
    pub last_index: u64,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Stored service rows; node fields are joined on read, not stored.
    #[serde(default)]
    pub services: Vec<ServiceNode>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub kvs: Vec<DirEntry>,
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
    #[serde(default)]
    pub coordinates: Vec<CoordinateEntry>,
    #[serde(default)]
    pub acls: Vec<Acl>,
    #[serde(default)]
    pub prepared_queries: Vec<PreparedQuery>,
    #[serde(default)]
    pub autopilot: Option<AutopilotConfig>,
    #[serde(default)]
    pub indexes: Vec<IndexEntry>,
}

/// A consistent read-only view of the whole store.
pub struct StoreSnapshot {
    tx: ReadTxn,
    last_index: u64,
}

impl StoreSnapshot {
    /// Highest index across every table at the time of the snapshot.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn nodes(&self) -> StateResult<Vec<Node>> {
        self.tx.all()
    }

    pub fn services(&self) -> StateResult<Vec<ServiceNode>> {
        self.tx.all()
    }

    pub fn checks(&self) -> StateResult<Vec<HealthCheck>> {
        self.tx.all()
    }

    pub fn sessions(&self) -> StateResult<Vec<Session>> {
        self.tx.all()
    }

    pub fn kvs(&self) -> StateResult<Vec<DirEntry>> {
        self.tx.all()
    }

    pub fn tombstones(&self) -> StateResult<Vec<Tombstone>> {
        Graveyard::dump(&self.tx)
    }

    pub fn coordinates(&self) -> StateResult<Vec<CoordinateEntry>> {
        self.tx.all()
    }

    pub fn acls(&self) -> StateResult<Vec<Acl>> {
        self.tx.all()
    }

    pub fn prepared_queries(&self) -> StateResult<Vec<PreparedQuery>> {
        self.tx.all()
    }

    pub fn autopilot(&self) -> StateResult<Option<AutopilotConfig>> {
        self.tx.first(AUTOPILOT_KEY)
    }

    pub fn indexes(&self) -> StateResult<Vec<IndexEntry>> {
        self.tx.index_entries()
    }

    pub fn dump(&self) -> StateResult<SnapshotData> {
        Ok(SnapshotData {
            last_index: self.last_index,
            nodes: self.nodes()?,
            services: self.services()?,
            checks: self.checks()?,
            sessions: self.sessions()?,
            kvs: self.kvs()?,
            tombstones: self.tombstones()?,
            coordinates: self.coordinates()?,
            acls: self.acls()?,
            prepared_queries: self.prepared_queries()?,
            autopilot: self.autopilot()?,
            indexes: self.indexes()?,
        })
    }
}

/// Bulk loader over one write transaction. Nothing is visible until
/// [`Restore::commit`]; dropping the restore discards it.
pub struct Restore {
    tx: WriteTxn,
}

impl Restore {
    pub fn node(&mut self, node: &Node) -> StateResult<()> {
        self.tx.restore(node, node.modify_index)
    }

    pub fn service(&mut self, svc: &ServiceNode) -> StateResult<()> {
        self.tx.restore(svc, svc.modify_index)
    }

    pub fn check(&mut self, check: &HealthCheck) -> StateResult<()> {
        self.tx.restore(check, check.modify_index)
    }

    /// Restore a session along with its check mappings.
    pub fn session(&mut self, session: &Session) -> StateResult<()> {
        self.tx.restore(session, session.modify_index)?;
        for check_id in &session.checks {
            self.tx.restore(
                &SessionCheck {
                    node: session.node.clone(),
                    check_id: check_id.clone(),
                    session: session.id.clone(),
                },
                0,
            )?;
        }
        Ok(())
    }

    pub fn kvs(&mut self, entry: &DirEntry) -> StateResult<()> {
        self.tx.restore(entry, entry.modify_index)
    }

    pub fn tombstone(&mut self, stone: &Tombstone) -> StateResult<()> {
        Graveyard::restore(&mut self.tx, stone)
    }

    /// Coordinates carry no index of their own; the batch is stamped `idx`.
    pub fn coordinates(&mut self, idx: u64, entries: &[CoordinateEntry]) -> StateResult<()> {
        for entry in entries {
            self.tx.restore(entry, idx)?;
        }
        self.tx.bump(COORDINATES, idx)
    }

    pub fn acl(&mut self, acl: &Acl) -> StateResult<()> {
        self.tx.restore(acl, acl.modify_index)
    }

    pub fn prepared_query(&mut self, query: &PreparedQuery) -> StateResult<()> {
        self.tx.restore(query, query.modify_index)
    }

    pub fn autopilot(&mut self, config: &AutopilotConfig) -> StateResult<()> {
        self.tx.restore(config, config.modify_index)
    }

    /// Raise a table's index entry to at least the recorded value.
    pub fn index_entry(&mut self, entry: &IndexEntry) -> StateResult<()> {
        self.tx.bump(&entry.key, entry.value)
    }

    /// Load a complete dump.
    pub fn load(&mut self, data: &SnapshotData) -> StateResult<()> {
        for node in &data.nodes {
            self.node(node)?;
        }
        for svc in &data.services {
            self.service(svc)?;
        }
        for check in &data.checks {
            self.check(check)?;
        }
        for session in &data.sessions {
            self.session(session)?;
        }
        for entry in &data.kvs {
            self.kvs(entry)?;
        }
        for stone in &data.tombstones {
            self.tombstone(stone)?;
        }
        if !data.coordinates.is_empty() {
            let idx = index_of(&data.indexes, COORDINATES).unwrap_or(data.last_index);
            self.coordinates(idx, &data.coordinates)?;
        }
        for acl in &data.acls {
            self.acl(acl)?;
        }
        for query in &data.prepared_queries {
            self.prepared_query(query)?;
        }
        if let Some(config) = &data.autopilot {
            self.autopilot(config)?;
        }
        for entry in &data.indexes {
            self.index_entry(entry)?;
        }
        Ok(())
    }

    pub fn commit(self) -> StateResult<()> {
        self.tx.commit()
    }
}

fn index_of(indexes: &[IndexEntry], table: &str) -> Option<u64> {
    indexes.iter().find(|e| e.key == table).map(|e| e.value)
}

impl StateStore {
    /// Open a snapshot of the current state.
    pub fn snapshot(&self) -> StateResult<StoreSnapshot> {
        let tx = self.read()?;
        let last_index = tx.max_index(TRACKED_TABLES)?;
        Ok(StoreSnapshot { tx, last_index })
    }

    /// Begin a restore. Only one restore (or write) runs at a time.
    pub fn restore(&self) -> StateResult<Restore> {
        Ok(Restore { tx: self.write()? })
    }

    /// Load `data` in a single transaction.
    pub fn restore_snapshot(&self, data: &SnapshotData) -> StateResult<()> {
        let mut restore = self.restore()?;
        restore.load(data)?;
        restore.commit()?;
        info!(last_index = data.last_index, "snapshot restored");
        Ok(())
    }
}
