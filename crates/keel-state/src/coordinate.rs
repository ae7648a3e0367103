//! Network coordinates, one per node.

use tracing::debug;

use crate::error::StateResult;
use crate::memdb::Reader;
use crate::schema::node_key;
use crate::store::StateStore;
use crate::tables::COORDINATES;
use crate::types::{Coordinate, CoordinateEntry, Node};
use crate::watch::{WatchKey, WatchSet};

impl StateStore {
    /// The raw coordinate for a node, without index bookkeeping.
    pub fn coordinate_get_raw(&self, node: &str) -> StateResult<Option<Coordinate>> {
        let tx = self.read()?;
        let entry: Option<CoordinateEntry> = tx.first(&node_key(node))?;
        Ok(entry.map(|e| e.coord))
    }

    pub fn coordinates(
        &self,
        ws: Option<&mut WatchSet>,
    ) -> StateResult<(u64, Vec<CoordinateEntry>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(COORDINATES)?;
        tx.watch(&mut ws, WatchKey::table(COORDINATES));
        Ok((idx, tx.all()?))
    }

    /// Apply a batch of updates in one transaction. Updates for nodes that
    /// are not registered (yet) are dropped.
    pub fn coordinate_batch_update(&self, idx: u64, updates: &[CoordinateEntry]) -> StateResult<()> {
        let mut tx = self.write()?;
        let mut applied = 0;
        for update in updates {
            if tx.first::<Node>(&node_key(&update.node))?.is_none() {
                continue;
            }
            tx.insert(idx, update)?;
            applied += 1;
        }
        tx.commit()?;
        debug!(idx, applied, skipped = updates.len() - applied, "coordinates updated");
        Ok(())
    }
}
