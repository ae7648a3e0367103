//! StateStore: the versioned catalog/KV store.
//!
//! Every write method takes the consensus log index to stamp on the rows it
//! touches as its first argument. Reads return the index the caller should
//! report alongside the result, and accept an optional [`WatchSet`] that is
//! filled with the watches a blocking query needs.
//!
//! The store spawns nothing; callers serialize writes (normally by applying
//! a replicated log in order) and may read from any number of threads.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use redb::Database;
use tokio::sync::watch;
use tracing::{debug, info};

use keel_core::StoreConfig;

use crate::delay::Delay;
use crate::error::StateResult;
use crate::graveyard::Graveyard;
use crate::memdb::{map_err, Db, ReadTxn, Reader, WriteTxn};
use crate::tables::TRACKED_TABLES;
use crate::tombstone_gc::TombstoneGc;
use crate::types::*;
use crate::watch::WatchSet;

/// Thread-safe state store backed by redb. Clones share the same data.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    pub(crate) graveyard: Arc<Graveyard>,
    pub(crate) lock_delay: Arc<Delay>,
    abandon_tx: Arc<watch::Sender<bool>>,
    pub(crate) config: StoreConfig,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        info!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Open the store described by `config`: on disk if a path is set,
    /// in memory otherwise.
    pub fn from_config(config: &StoreConfig) -> StateResult<Self> {
        let store = match &config.path {
            Some(path) => Self::open(path)?,
            None => Self::open_in_memory()?,
        };
        Ok(store.with_config(config.clone()))
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (abandon_tx, _) = watch::channel(false);
        let store = Self {
            db: Db::new(db),
            graveyard: Arc::new(Graveyard::new(None)),
            lock_delay: Arc::new(Delay::default()),
            abandon_tx: Arc::new(abandon_tx),
            config: StoreConfig::default(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Hint `gc` every time a committed write leaves tombstones behind.
    pub fn with_tombstone_gc(mut self, gc: TombstoneGc) -> Self {
        self.graveyard = Arc::new(Graveyard::new(Some(gc)));
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let mut tx = self.db.write()?;
        tx.create_index_table()?;
        tx.create::<Node>()?;
        tx.create::<ServiceNode>()?;
        tx.create::<HealthCheck>()?;
        tx.create::<Session>()?;
        tx.create::<SessionCheck>()?;
        tx.create::<DirEntry>()?;
        tx.create::<Tombstone>()?;
        tx.create::<CoordinateEntry>()?;
        tx.create::<Acl>()?;
        tx.create::<PreparedQuery>()?;
        tx.create::<AutopilotConfig>()?;
        tx.commit()
    }

    pub(crate) fn read(&self) -> StateResult<ReadTxn> {
        self.db.read()
    }

    pub(crate) fn write(&self) -> StateResult<WriteTxn> {
        self.db.write()
    }

    // ── Index bookkeeping ──────────────────────────────────────────

    /// Highest index across the named tables.
    pub fn max_index(&self, tables: &[&str]) -> StateResult<u64> {
        self.read()?.max_index(tables)
    }

    /// Highest index across every table; the store's last applied write.
    pub fn last_index(&self) -> StateResult<u64> {
        self.read()?.max_index(TRACKED_TABLES)
    }

    /// Every table's index entry.
    pub fn indexes(&self) -> StateResult<Vec<IndexEntry>> {
        self.read()?.index_entries()
    }

    // ── Abandonment ────────────────────────────────────────────────

    /// A receiver that flips to `true` once the store is abandoned.
    pub fn abandon_ch(&self) -> watch::Receiver<bool> {
        self.abandon_tx.subscribe()
    }

    /// Add the abandon signal to a watch set.
    pub fn watch_abandon(&self, ws: &mut WatchSet) {
        ws.add_abandon(self.abandon_ch());
    }

    /// Signal every watcher that this store is being replaced.
    ///
    /// # Panics
    ///
    /// Panics if the store was already abandoned.
    pub fn abandon(&self) {
        let already = self.abandon_tx.send_replace(true);
        assert!(!already, "state store abandoned twice");
        info!("state store abandoned");
    }

    pub fn is_abandoned(&self) -> bool {
        *self.abandon_tx.borrow()
    }

    // ── Lock delay ─────────────────────────────────────────────────

    /// The instant before which a new lock on `key` must be refused.
    pub fn kvs_lock_delay(&self, key: &str) -> Option<Instant> {
        self.lock_delay.get_expiration(key)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("config", &self.config)
            .field("abandoned", &self.is_abandoned())
            .finish_non_exhaustive()
    }
}
