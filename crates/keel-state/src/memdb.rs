//! Typed transactions over redb.
//!
//! redb supplies the MVCC part: one writer at a time, any number of readers
//! on stable snapshots, and write transactions that roll back when dropped
//! without `commit()`. This module adds what the store needs on top:
//!
//! - typed row access through [`Record`] with secondary index maintenance,
//! - the `index` table bump performed by every tracked insert and remove,
//! - change tracking, published to the [`WatchRegistry`] after commit,
//! - deferred side effects that run only once the commit succeeded.

use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;

use crate::error::{StateError, StateResult};
use crate::schema::Record;
use crate::tables::*;
use crate::types::IndexEntry;
use crate::watch::{Change, WatchKey, WatchRegistry, WatchSet};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_row<T: Record>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> StateResult<Option<T>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn scan_rows<T: Record>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut rows = Vec::new();
    for item in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = item.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        rows.push(decode(value.value())?);
    }
    Ok(rows)
}

fn scan_index(
    table: &impl ReadableTable<&'static str, &'static str>,
    value: &str,
) -> StateResult<Vec<String>> {
    let prefix = index_key(value, "");
    let mut ids = Vec::new();
    for item in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
        let (key, id) = item.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix.as_str()) {
            break;
        }
        ids.push(id.value().to_string());
    }
    Ok(ids)
}

fn resolve_ids<T: Record>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    ids: &[String],
) -> StateResult<Vec<T>> {
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        match get_row(table, id)? {
            Some(row) => rows.push(row),
            None => {
                return Err(StateError::Corrupt {
                    table: T::TABLE,
                    detail: format!("index entry points at missing row {id:?}"),
                })
            }
        }
    }
    Ok(rows)
}

fn unknown_index<T: Record>(index: &str) -> StateError {
    StateError::Corrupt {
        table: T::TABLE,
        detail: format!("no index named {index:?}"),
    }
}

/// Read operations shared by read-only and read-write transactions.
pub(crate) trait Reader {
    /// Row by primary key.
    fn first<T: Record>(&self, id: &str) -> StateResult<Option<T>>;

    /// Rows whose primary key starts with `prefix`, in key order.
    fn prefix<T: Record>(&self, prefix: &str) -> StateResult<Vec<T>>;

    fn all<T: Record>(&self) -> StateResult<Vec<T>> {
        self.prefix("")
    }

    /// Rows carrying `value` in the named secondary index, in primary key order.
    fn lookup<T: Record>(&self, index: &'static str, value: &str) -> StateResult<Vec<T>>;

    /// Highest write index recorded for `table`.
    fn table_index(&self, table: &str) -> StateResult<u64>;

    fn max_index(&self, tables: &[&str]) -> StateResult<u64> {
        let mut max = 0;
        for table in tables {
            max = max.max(self.table_index(table)?);
        }
        Ok(max)
    }

    fn index_entries(&self) -> StateResult<Vec<IndexEntry>>;

    /// Register `key` in `ws`, if a watch set was supplied.
    fn watch(&self, ws: &mut Option<&mut WatchSet>, key: WatchKey);

    /// Register `key`, or `fallback` once `ws` already holds `limit` watches.
    fn watch_limited(
        &self,
        ws: &mut Option<&mut WatchSet>,
        limit: usize,
        key: WatchKey,
        fallback: WatchKey,
    ) {
        let full = ws.as_deref().is_some_and(|set| set.len() >= limit);
        self.watch(ws, if full { fallback } else { key });
    }
}

/// Shared handle to the database and its watch registry.
#[derive(Clone)]
pub(crate) struct Db {
    db: Arc<Database>,
    watches: Arc<WatchRegistry>,
}

impl Db {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            watches: Arc::new(WatchRegistry::default()),
        }
    }

    pub fn read(&self) -> StateResult<ReadTxn> {
        // Capture the sequence before the snapshot; see `watch` module docs.
        let seq = self.watches.seq();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(ReadTxn {
            txn,
            seq,
            watches: Arc::clone(&self.watches),
        })
    }

    pub fn write(&self) -> StateResult<WriteTxn> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(WriteTxn {
            txn,
            watches: Arc::clone(&self.watches),
            changes: Vec::new(),
            deferred: Vec::new(),
        })
    }
}

/// A consistent read-only snapshot.
pub(crate) struct ReadTxn {
    txn: ReadTransaction,
    seq: u64,
    watches: Arc<WatchRegistry>,
}

impl Reader for ReadTxn {
    fn first<T: Record>(&self, id: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        get_row(&table, id)
    }

    fn prefix<T: Record>(&self, prefix: &str) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        scan_rows(&table, prefix)
    }

    fn lookup<T: Record>(&self, index: &'static str, value: &str) -> StateResult<Vec<T>> {
        let def = T::index(index).ok_or_else(|| unknown_index::<T>(index))?;
        let ids = {
            let table = self.txn.open_table(def.definition()).map_err(map_err!(Table))?;
            scan_index(&table, value)?
        };
        let table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        resolve_ids(&table, &ids)
    }

    fn table_index(&self, name: &str) -> StateResult<u64> {
        let table = self.txn.open_table(INDEX).map_err(map_err!(Table))?;
        let value = table.get(name).map_err(map_err!(Read))?;
        Ok(value.map(|v| v.value()).unwrap_or(0))
    }

    fn index_entries(&self) -> StateResult<Vec<IndexEntry>> {
        let table = self.txn.open_table(INDEX).map_err(map_err!(Table))?;
        let mut entries = Vec::new();
        for item in table.iter().map_err(map_err!(Read))? {
            let (key, value) = item.map_err(map_err!(Read))?;
            entries.push(IndexEntry {
                key: key.value().to_string(),
                value: value.value(),
            });
        }
        Ok(entries)
    }

    fn watch(&self, ws: &mut Option<&mut WatchSet>, key: WatchKey) {
        if let Some(set) = ws.as_deref_mut() {
            if set.contains(&key) {
                return;
            }
            let rx = self.watches.subscribe(key.clone());
            set.add(key, rx, self.seq);
        }
    }
}

type Deferred = Box<dyn FnOnce() + Send>;

/// A read-write transaction. Dropping it without [`WriteTxn::commit`]
/// discards every change and skips all deferred work.
pub(crate) struct WriteTxn {
    txn: WriteTransaction,
    watches: Arc<WatchRegistry>,
    changes: Vec<Change>,
    deferred: Vec<Deferred>,
}

impl WriteTxn {
    /// Insert or replace a row, stamping the table index with `idx`.
    pub fn insert<T: Record>(&mut self, idx: u64, row: &T) -> StateResult<()> {
        self.put(row, T::TRACKED.then_some(idx))
    }

    /// Insert a row carrying its own indexes (snapshot restore). The table
    /// index is raised to `bump` but never lowered.
    pub fn restore<T: Record>(&mut self, row: &T, bump: u64) -> StateResult<()> {
        self.put(row, T::TRACKED.then_some(bump))
    }

    /// Remove a row by primary key, stamping the table index with `idx`.
    /// Removing a missing row is a no-op and leaves the index alone.
    pub fn remove<T: Record>(&mut self, idx: u64, id: &str) -> StateResult<Option<T>> {
        self.take(id, T::TRACKED.then_some(idx))
    }

    /// Remove a row without touching the table index.
    pub fn purge<T: Record>(&mut self, id: &str) -> StateResult<Option<T>> {
        self.take(id, None)
    }

    /// Raise a table's index entry to at least `idx`.
    pub fn bump(&mut self, name: &str, idx: u64) -> StateResult<()> {
        let mut table = self.txn.open_table(INDEX).map_err(map_err!(Table))?;
        let current = table
            .get(name)
            .map_err(map_err!(Read))?
            .map(|v| v.value())
            .unwrap_or(0);
        if idx > current {
            table.insert(name, idx).map_err(map_err!(Write))?;
        }
        Ok(())
    }

    /// Run `f` after a successful commit.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(f));
    }

    pub fn commit(self) -> StateResult<()> {
        let WriteTxn {
            txn,
            watches,
            changes,
            deferred,
        } = self;
        txn.commit().map_err(map_err!(Commit))?;
        watches.notify(&changes);
        for f in deferred {
            f();
        }
        Ok(())
    }

    fn put<T: Record>(&mut self, row: &T, bump: Option<u64>) -> StateResult<()> {
        let id = row.id();
        let bytes = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
        let old: Option<T> = {
            let mut table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
            let previous = table
                .insert(id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            match previous {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };
        self.reindex(&id, old.as_ref(), Some(row))?;
        if let Some(idx) = bump {
            self.bump(T::TABLE, idx)?;
        }
        Ok(())
    }

    fn take<T: Record>(&mut self, id: &str, bump: Option<u64>) -> StateResult<Option<T>> {
        let old: Option<T> = {
            let mut table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
            let previous = table.remove(id).map_err(map_err!(Write))?;
            match previous {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };
        let Some(old) = old else {
            return Ok(None);
        };
        self.reindex(id, Some(&old), None)?;
        if let Some(idx) = bump {
            self.bump(T::TABLE, idx)?;
        }
        Ok(Some(old))
    }

    /// Swap a row's secondary index entries and record the change.
    fn reindex<T: Record>(&mut self, id: &str, old: Option<&T>, new: Option<&T>) -> StateResult<()> {
        let mut entries: Vec<(&'static str, String)> = vec![("id", id.to_string())];
        for index in T::INDEXES {
            let old_values = old.map(|r| r.index_values(index.name)).unwrap_or_default();
            let new_values = new.map(|r| r.index_values(index.name)).unwrap_or_default();
            if old_values == new_values && old.is_some() && new.is_some() {
                entries.extend(new_values.into_iter().map(|v| (index.name, v)));
                continue;
            }
            let mut table = self.txn.open_table(index.definition()).map_err(map_err!(Table))?;
            for value in &old_values {
                table
                    .remove(index_key(value, id).as_str())
                    .map_err(map_err!(Write))?;
            }
            for value in &new_values {
                table
                    .insert(index_key(value, id).as_str(), id)
                    .map_err(map_err!(Write))?;
            }
            entries.extend(old_values.into_iter().map(|v| (index.name, v)));
            entries.extend(new_values.into_iter().map(|v| (index.name, v)));
        }
        self.changes.push(Change {
            table: T::TABLE,
            entries,
        });
        Ok(())
    }

    /// Create a record's row and index tables if they do not exist yet.
    pub fn create<T: Record>(&mut self) -> StateResult<()> {
        self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        for index in T::INDEXES {
            self.txn
                .open_table(index.definition())
                .map_err(map_err!(Table))?;
        }
        Ok(())
    }

    pub fn create_index_table(&mut self) -> StateResult<()> {
        self.txn.open_table(INDEX).map_err(map_err!(Table))?;
        Ok(())
    }
}

impl Reader for WriteTxn {
    fn first<T: Record>(&self, id: &str) -> StateResult<Option<T>> {
        let table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        get_row(&table, id)
    }

    fn prefix<T: Record>(&self, prefix: &str) -> StateResult<Vec<T>> {
        let table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        scan_rows(&table, prefix)
    }

    fn lookup<T: Record>(&self, index: &'static str, value: &str) -> StateResult<Vec<T>> {
        let def = T::index(index).ok_or_else(|| unknown_index::<T>(index))?;
        let ids = {
            let table = self.txn.open_table(def.definition()).map_err(map_err!(Table))?;
            scan_index(&table, value)?
        };
        let table = self.txn.open_table(T::definition()).map_err(map_err!(Table))?;
        resolve_ids(&table, &ids)
    }

    fn table_index(&self, name: &str) -> StateResult<u64> {
        let table = self.txn.open_table(INDEX).map_err(map_err!(Table))?;
        let value = table.get(name).map_err(map_err!(Read))?;
        Ok(value.map(|v| v.value()).unwrap_or(0))
    }

    fn index_entries(&self) -> StateResult<Vec<IndexEntry>> {
        let table = self.txn.open_table(INDEX).map_err(map_err!(Table))?;
        let mut entries = Vec::new();
        for item in table.iter().map_err(map_err!(Read))? {
            let (key, value) = item.map_err(map_err!(Read))?;
            entries.push(IndexEntry {
                key: key.value().to_string(),
                value: value.value(),
            });
        }
        Ok(entries)
    }

    // Writers never block, so there is nothing to register.
    fn watch(&self, _ws: &mut Option<&mut WatchSet>, _key: WatchKey) {}
}
