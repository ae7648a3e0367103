//! keel-core: configuration shared by the Keel state store and its tooling.

pub mod config;

pub use config::{GcConfig, KeelConfig, StoreConfig};

/// Default soft limit on per-item watches a single blocking query registers
/// before it falls back to watching the whole table.
pub const DEFAULT_WATCH_LIMIT: usize = 2048;

/// Upper bound on a session's lock delay, in seconds.
pub const DEFAULT_MAX_LOCK_DELAY_SECS: u64 = 60;

/// Default time a tombstone is kept before it becomes eligible for reaping.
pub const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 15 * 60;

/// Default bucket width used to batch tombstone expirations.
pub const DEFAULT_TOMBSTONE_GRANULARITY_SECS: u64 = 30;
