//! keel-state: versioned catalog and KV state store.
//!
//! Backed by [redb](https://docs.rs/redb), provides the node/service/check
//! catalog, a KV store with session locks, sessions, coordinates, ACLs,
//! prepared queries, and autopilot configuration, all stamped with the
//! consensus index of the write that last touched them.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Compound keys (`{node}\0{service}`) enable prefix scans for the rows a
//! node owns, and every secondary index is its own table.
//!
//! Reads accept an optional [`WatchSet`]; after a read returns, awaiting
//! [`WatchSet::watch`] blocks until something the read depended on changes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

mod acl;
mod autopilot;
mod catalog;
mod coordinate;
mod delay;
mod graveyard;
mod kvs;
mod memdb;
mod prepared_query;
mod schema;
mod session;

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod tombstone_gc;
pub mod txn;
pub mod types;
pub mod watch;

pub use error::{StateError, StateResult};
pub use snapshot::{Restore, SnapshotData, StoreSnapshot};
pub use store::StateStore;
pub use tombstone_gc::TombstoneGc;
pub use txn::{KvVerb, TxnError, TxnKvOp, TxnOp, TxnResponse, TxnResult};
pub use types::*;
pub use watch::{WatchKey, WatchScope, WatchSet};
