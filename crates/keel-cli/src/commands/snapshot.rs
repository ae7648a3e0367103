use std::path::Path;

use anyhow::Context;
use keel_core::KeelConfig;
use keel_state::SnapshotData;

use super::open_store;

pub fn save(config: &KeelConfig, out: &Path) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let snap = store.snapshot()?;
    let data = snap.dump()?;
    let json = serde_json::to_string_pretty(&data)?;
    std::fs::write(out, json).with_context(|| format!("failed to write {}", out.display()))?;

    println!(
        "Saved snapshot at index {} to {} ({} nodes, {} kv entries, {} tombstones)",
        snap.last_index(),
        out.display(),
        data.nodes.len(),
        data.kvs.len(),
        data.tombstones.len(),
    );
    Ok(())
}

pub fn load(config: &KeelConfig, from: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(from)
        .with_context(|| format!("failed to read {}", from.display()))?;
    let data: SnapshotData = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a keel snapshot", from.display()))?;

    let store = open_store(config)?;
    let existing = store.last_index()?;
    if existing > 0 {
        anyhow::bail!("refusing to restore into a data file that already holds data (index {existing})");
    }
    store.restore_snapshot(&data)?;

    println!("Restored snapshot from {} at index {}", from.display(), store.last_index()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_config;
    use keel_state::{DirEntry, StateStore};

    #[test]
    fn test_save_then_load_into_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = test_config(&dir);
        {
            let store = open_store(&source).unwrap();
            store.kvs_set(3, &DirEntry::new("app/a", "1")).unwrap();
            store.kvs_set(4, &DirEntry::new("app/b", "2")).unwrap();
            store.kvs_delete(5, "app/b").unwrap();
        }
        let out = dir.path().join("backup.json");
        save(&source, &out).unwrap();

        let mut target = KeelConfig::default();
        target.store.path = Some(dir.path().join("restored.redb"));
        load(&target, &out).unwrap();

        let restored = StateStore::open(dir.path().join("restored.redb").as_path()).unwrap();
        assert_eq!(restored.last_index().unwrap(), 5);
        let (_, entry) = restored.kvs_get(None, "app/a").unwrap();
        assert_eq!(entry.unwrap().value, b"1");
        assert_eq!(restored.snapshot().unwrap().tombstones().unwrap().len(), 1);
    }

    #[test]
    fn test_load_refuses_populated_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        open_store(&config)
            .unwrap()
            .kvs_set(1, &DirEntry::new("k", "v"))
            .unwrap();
        let out = dir.path().join("backup.json");
        save(&config, &out).unwrap();

        let err = load(&config, &out).unwrap_err();
        assert!(err.to_string().contains("already holds data"));
    }
}
