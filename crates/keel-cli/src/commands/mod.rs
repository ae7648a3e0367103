pub mod kv;
pub mod maintenance;
pub mod snapshot;

use std::path::{Path, PathBuf};

use anyhow::Context;
use keel_core::{KeelConfig, StoreConfig};
use keel_state::StateStore;

/// Read keel.toml if given and apply the `--data` override.
pub fn load_config(path: Option<&Path>, data: Option<PathBuf>) -> anyhow::Result<KeelConfig> {
    let mut config = match path {
        Some(path) => KeelConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => KeelConfig::default(),
    };
    if data.is_some() {
        config.store.path = data;
    }
    Ok(config)
}

/// Open the configured data file. The CLI never runs against an in-memory
/// store since nothing it wrote would survive the process.
pub fn open_store(config: &KeelConfig) -> anyhow::Result<StateStore> {
    let path = store_path(&config.store)?;
    StateStore::from_config(&config.store)
        .with_context(|| format!("failed to open data file {}", path.display()))
}

fn store_path(config: &StoreConfig) -> anyhow::Result<&Path> {
    config
        .path
        .as_deref()
        .context("no data file: pass --data or set [store].path in keel.toml")
}

/// Index for the next write. Without a consensus layer the CLI is the only
/// writer, so one past the highest recorded index is always fresh.
pub fn next_index(store: &StateStore) -> anyhow::Result<u64> {
    Ok(store.last_index()? + 1)
}

#[cfg(test)]
pub(crate) fn test_config(dir: &tempfile::TempDir) -> KeelConfig {
    let mut config = KeelConfig::default();
    config.store.path = Some(dir.path().join("state.redb"));
    config
}
