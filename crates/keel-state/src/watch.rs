//! Watches for blocking queries.
//!
//! Readers register [`WatchKey`]s while they run a query; writers report the
//! `(table, index, value)` tuples they touched when they commit. The
//! registry keeps a commit sequence number and, per watched key, a
//! `tokio::sync::watch` channel carrying the sequence of the last commit
//! that touched it.
//!
//! A read transaction captures the sequence *before* it opens its redb
//! snapshot. A key registered later in that read counts as fired if its
//! channel already holds a newer sequence, so a commit landing between the
//! snapshot and the registration is never missed.
//!
//! ```text
//! WatchRegistry
//!   ├── seq (bumped once per commit)
//!   ├── WatchKey → watch::Sender<u64>   (pruned when nobody listens)
//!   └── table → seq of its last change  (floor for new senders)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::future::select_all;
use parking_lot::Mutex;
use tokio::sync::watch;

/// What part of a table a watch covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchScope {
    /// Any change to the table.
    All,
    /// Rows whose index value equals this.
    Exact(String),
    /// Rows whose index value starts with this.
    Prefix(String),
}

/// Identifies a watchable slice of a table index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub table: &'static str,
    pub index: &'static str,
    pub scope: WatchScope,
}

impl WatchKey {
    pub fn table(table: &'static str) -> Self {
        Self {
            table,
            index: "id",
            scope: WatchScope::All,
        }
    }

    pub fn exact(table: &'static str, index: &'static str, value: impl Into<String>) -> Self {
        Self {
            table,
            index,
            scope: WatchScope::Exact(value.into()),
        }
    }

    pub fn prefix(table: &'static str, index: &'static str, prefix: impl Into<String>) -> Self {
        Self {
            table,
            index,
            scope: WatchScope::Prefix(prefix.into()),
        }
    }

    fn matches(&self, change: &Change) -> bool {
        if self.table != change.table {
            return false;
        }
        match &self.scope {
            WatchScope::All => true,
            WatchScope::Exact(value) => change
                .entries
                .iter()
                .any(|(index, v)| *index == self.index && v == value),
            WatchScope::Prefix(prefix) => change
                .entries
                .iter()
                .any(|(index, v)| *index == self.index && v.starts_with(prefix.as_str())),
        }
    }
}

/// One row touched by a write: its table and every `(index, value)` pair
/// it had before or after the write. The primary key appears as `"id"`.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    pub table: &'static str,
    pub entries: Vec<(&'static str, String)>,
}

#[derive(Default)]
struct RegistryInner {
    seq: u64,
    watches: HashMap<WatchKey, watch::Sender<u64>>,
    table_seq: HashMap<&'static str, u64>,
}

/// Shared by every transaction of one store.
#[derive(Default)]
pub(crate) struct WatchRegistry {
    inner: Mutex<RegistryInner>,
}

impl WatchRegistry {
    pub fn seq(&self) -> u64 {
        self.inner.lock().seq
    }

    pub fn subscribe(&self, key: WatchKey) -> watch::Receiver<u64> {
        let mut inner = self.inner.lock();
        let floor = inner.table_seq.get(key.table).copied().unwrap_or(0);
        inner
            .watches
            .entry(key)
            .or_insert_with(|| watch::channel(floor).0)
            .subscribe()
    }

    /// Publish a committed write. Returns the new commit sequence.
    pub fn notify(&self, changes: &[Change]) -> u64 {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        if changes.is_empty() {
            return seq;
        }
        for change in changes {
            inner.table_seq.insert(change.table, seq);
        }
        inner.watches.retain(|key, tx| {
            if changes.iter().any(|c| key.matches(c)) {
                tx.send_replace(seq);
            }
            tx.receiver_count() > 0
        });
        seq
    }

    #[cfg(test)]
    pub fn watch_count(&self) -> usize {
        self.inner.lock().watches.len()
    }
}

struct Entry {
    rx: watch::Receiver<u64>,
    /// Commit sequence the registering read was based on.
    seq: u64,
}

impl Entry {
    fn fired(&self) -> bool {
        match self.rx.has_changed() {
            Err(_) => true,
            Ok(_) => *self.rx.borrow() > self.seq,
        }
    }

    async fn wait(&mut self) {
        loop {
            if self.rx.changed().await.is_err() {
                return;
            }
            if *self.rx.borrow_and_update() > self.seq {
                return;
            }
        }
    }
}

async fn wait_abandon(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The set of watches one blocking query registered.
#[derive(Default)]
pub struct WatchSet {
    entries: HashMap<WatchKey, Entry>,
    abandon: Option<watch::Receiver<bool>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys being watched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.abandon.is_none()
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn add(&mut self, key: WatchKey, rx: watch::Receiver<u64>, seq: u64) {
        match self.entries.get_mut(&key) {
            // Keep the older base so the watch stays conservative.
            Some(existing) if existing.seq <= seq => {}
            Some(existing) => *existing = Entry { rx, seq },
            None => {
                self.entries.insert(key, Entry { rx, seq });
            }
        }
    }

    /// Also wake when the store is abandoned.
    pub fn add_abandon(&mut self, rx: watch::Receiver<bool>) {
        self.abandon = Some(rx);
    }

    /// True if any watched key changed (or the store was abandoned).
    pub fn fired(&self) -> bool {
        if self.entries.values().any(Entry::fired) {
            return true;
        }
        match &self.abandon {
            Some(rx) => rx.has_changed().is_err() || *rx.borrow(),
            None => false,
        }
    }

    /// Block until a watched key fires or `timeout` elapses. Returns `true`
    /// if the timeout elapsed first.
    pub async fn watch(&mut self, timeout: Duration) -> bool {
        if self.fired() {
            return false;
        }

        let mut waiters: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> =
            Vec::with_capacity(self.entries.len() + 1);
        for entry in self.entries.values_mut() {
            waiters.push(Box::pin(entry.wait()));
        }
        if let Some(rx) = self.abandon.as_mut() {
            waiters.push(Box::pin(wait_abandon(rx)));
        }

        if waiters.is_empty() {
            tokio::time::sleep(timeout).await;
            return true;
        }
        tokio::time::timeout(timeout, select_all(waiters))
            .await
            .is_err()
    }
}
