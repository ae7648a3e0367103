//! Autopilot configuration, a singleton row.

use tracing::debug;

use crate::error::StateResult;
use crate::memdb::{Reader, WriteTxn};
use crate::schema::AUTOPILOT_KEY;
use crate::store::StateStore;
use crate::tables::AUTOPILOT;
use crate::types::AutopilotConfig;

impl StateStore {
    /// The stored configuration, if one was ever set.
    pub fn autopilot_config(&self) -> StateResult<(u64, Option<AutopilotConfig>)> {
        let tx = self.read()?;
        let idx = tx.table_index(AUTOPILOT)?;
        Ok((idx, tx.first(AUTOPILOT_KEY)?))
    }

    pub fn autopilot_set_config(&self, idx: u64, config: &AutopilotConfig) -> StateResult<()> {
        let mut tx = self.write()?;
        set_config_txn(&mut tx, idx, config)?;
        tx.commit()?;
        debug!(idx, "autopilot config stored");
        Ok(())
    }

    /// Store `config` only if the current modify index equals `cidx`.
    /// A `cidx` of 0 succeeds only when nothing has been stored yet.
    pub fn autopilot_cas_config(
        &self,
        idx: u64,
        cidx: u64,
        config: &AutopilotConfig,
    ) -> StateResult<bool> {
        let mut tx = self.write()?;
        let existing: Option<AutopilotConfig> = tx.first(AUTOPILOT_KEY)?;
        let current = existing.map(|c| c.modify_index).unwrap_or(0);
        if current != cidx {
            return Ok(false);
        }
        set_config_txn(&mut tx, idx, config)?;
        tx.commit()?;
        debug!(idx, cidx, "autopilot config stored (cas)");
        Ok(true)
    }
}

fn set_config_txn(tx: &mut WriteTxn, idx: u64, config: &AutopilotConfig) -> StateResult<()> {
    let mut config = config.clone();
    match tx.first::<AutopilotConfig>(AUTOPILOT_KEY)? {
        Some(existing) => config.create_index = existing.create_index,
        None => config.create_index = idx,
    }
    config.modify_index = idx;
    tx.insert(idx, &config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_config_is_none() {
        let store = StateStore::open_in_memory().unwrap();
        let (idx, config) = store.autopilot_config().unwrap();
        assert_eq!(idx, 0);
        assert!(config.is_none());
    }

    #[test]
    fn set_preserves_create_index() {
        let store = StateStore::open_in_memory().unwrap();
        store.autopilot_set_config(1, &AutopilotConfig::default()).unwrap();
        let config = AutopilotConfig {
            max_trailing_logs: 500,
            ..Default::default()
        };
        store.autopilot_set_config(2, &config).unwrap();

        let (idx, stored) = store.autopilot_config().unwrap();
        let stored = stored.unwrap();
        assert_eq!(idx, 2);
        assert_eq!(stored.max_trailing_logs, 500);
        assert_eq!((stored.create_index, stored.modify_index), (1, 2));
    }

    #[test]
    fn cas_checks_modify_index() {
        let store = StateStore::open_in_memory().unwrap();
        let config = AutopilotConfig::default();
        assert!(!store.autopilot_cas_config(1, 7, &config).unwrap());
        assert!(store.autopilot_cas_config(2, 0, &config).unwrap());
        assert!(!store.autopilot_cas_config(3, 0, &config).unwrap());
        assert!(store.autopilot_cas_config(4, 2, &config).unwrap());

        let (idx, stored) = store.autopilot_config().unwrap();
        assert_eq!(idx, 4);
        assert_eq!(stored.unwrap().create_index, 2);
    }
}
