//! keel.toml configuration parser.
//!
//! Every section is optional; missing fields fall back to the defaults in
//! the crate root. Durations are expressed in whole seconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{
    DEFAULT_MAX_LOCK_DELAY_SECS, DEFAULT_TOMBSTONE_GRANULARITY_SECS, DEFAULT_TOMBSTONE_TTL_SECS,
    DEFAULT_WATCH_LIMIT,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeelConfig {
    pub store: StoreConfig,
    pub gc: GcConfig,
}

/// State store tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Data file for a persistent store. `None` keeps everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Per-query watch soft limit.
    pub watch_limit: usize,
    /// Cap applied to session lock delays (seconds).
    pub max_lock_delay: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            watch_limit: DEFAULT_WATCH_LIMIT,
            max_lock_delay: DEFAULT_MAX_LOCK_DELAY_SECS,
        }
    }
}

impl StoreConfig {
    pub fn max_lock_delay(&self) -> Duration {
        Duration::from_secs(self.max_lock_delay)
    }
}

/// Tombstone garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    /// How long a tombstone lives before it may be reaped (seconds).
    pub ttl: u64,
    /// Expirations are batched into buckets of this width (seconds).
    pub granularity: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_TOMBSTONE_TTL_SECS,
            granularity: DEFAULT_TOMBSTONE_GRANULARITY_SECS,
        }
    }
}

impl GcConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_secs(self.granularity)
    }
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the store cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.watch_limit == 0 {
            anyhow::bail!("store.watch_limit must be at least 1");
        }
        if self.gc.enabled && (self.gc.ttl == 0 || self.gc.granularity == 0) {
            anyhow::bail!("gc.ttl and gc.granularity must be non-zero when gc is enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KeelConfig::default();
        assert_eq!(config.store.watch_limit, 2048);
        assert_eq!(config.store.max_lock_delay(), Duration::from_secs(60));
        assert!(config.store.path.is_none());
        assert!(config.gc.enabled);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[store]
path = "/var/lib/keel/state.redb"
watch_limit = 16

[gc]
ttl = 120
"#;
        let config: KeelConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.watch_limit, 16);
        assert_eq!(config.store.max_lock_delay, 60);
        assert_eq!(
            config.store.path.as_deref(),
            Some(Path::new("/var/lib/keel/state.redb"))
        );
        assert_eq!(config.gc.ttl(), Duration::from_secs(120));
        assert_eq!(config.gc.granularity, 30);
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: KeelConfig = toml::from_str("").unwrap();
        assert_eq!(config, KeelConfig::default());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        let mut config = KeelConfig::default();
        config.gc.granularity = 5;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = KeelConfig::from_file(&path).unwrap();
        assert_eq!(loaded.gc.granularity, 5);
    }

    #[test]
    fn test_validate_rejects_zero_watch_limit() {
        let mut config = KeelConfig::default();
        config.store.watch_limit = 0;
        assert!(config.validate().is_err());
    }
}
