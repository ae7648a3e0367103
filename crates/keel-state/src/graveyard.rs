//! Tombstones for deleted KV entries.
//!
//! A tombstone records the index at which a key was deleted, so a prefix
//! query over a now-empty range still reports that index instead of sliding
//! back to an older one. Tombstones are reaped once the GC watermark passes
//! them.

use crate::error::StateResult;
use crate::memdb::{Reader, WriteTxn};
use crate::tombstone_gc::TombstoneGc;
use crate::types::Tombstone;

pub(crate) struct Graveyard {
    gc: Option<TombstoneGc>,
}

impl Graveyard {
    pub fn new(gc: Option<TombstoneGc>) -> Self {
        Self { gc }
    }

    /// Record that `key` was deleted at `idx`.
    pub fn insert(&self, tx: &mut WriteTxn, key: &str, idx: u64) -> StateResult<()> {
        let stone = Tombstone {
            key: key.to_string(),
            index: idx,
        };
        tx.insert(idx, &stone)?;
        if let Some(gc) = &self.gc {
            let gc = gc.clone();
            tx.defer(move || gc.hint(idx));
        }
        Ok(())
    }

    /// Highest tombstone index under `prefix`, or 0.
    pub fn max_index_in_prefix(tx: &impl Reader, prefix: &str) -> StateResult<u64> {
        let stones: Vec<Tombstone> = tx.prefix(prefix)?;
        Ok(stones.iter().map(|s| s.index).max().unwrap_or(0))
    }

    /// Remove every tombstone at or below `idx`. Returns how many were reaped.
    pub fn reap(tx: &mut WriteTxn, idx: u64) -> StateResult<usize> {
        let stones: Vec<Tombstone> = tx.all()?;
        let mut reaped = 0;
        for stone in stones.iter().filter(|s| s.index <= idx) {
            tx.purge::<Tombstone>(&stone.key)?;
            reaped += 1;
        }
        Ok(reaped)
    }

    pub fn dump(tx: &impl Reader) -> StateResult<Vec<Tombstone>> {
        tx.all()
    }

    pub fn restore(tx: &mut WriteTxn, stone: &Tombstone) -> StateResult<()> {
        tx.restore(stone, stone.index)
    }
}
