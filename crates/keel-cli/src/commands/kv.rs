use keel_core::KeelConfig;
use keel_state::DirEntry;

use super::{next_index, open_store};

pub fn get(config: &KeelConfig, key: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match store.kvs_get(None, key)? {
        (_, Some(entry)) => println!("{}", String::from_utf8_lossy(&entry.value)),
        (idx, None) => anyhow::bail!("key {key:?} not found (index {idx})"),
    }
    Ok(())
}

pub fn put(config: &KeelConfig, key: &str, value: &str, flags: u64) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let idx = next_index(&store)?;
    let entry = DirEntry {
        flags,
        ..DirEntry::new(key, value)
    };
    store.kvs_set(idx, &entry)?;
    tracing::debug!(key, idx, "kv entry written");
    println!("Wrote {key} at index {idx}");
    Ok(())
}

/// Print entries under `prefix` as JSON, or just their keys when a
/// separator is given.
pub fn list(config: &KeelConfig, prefix: &str, separator: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match separator {
        Some(sep) => {
            let (_, keys) = store.kvs_list_keys(None, prefix, sep)?;
            for key in keys {
                println!("{key}");
            }
        }
        None => {
            let (idx, entries) = store.kvs_list(None, prefix)?;
            let rows: Vec<serde_json::Value> = entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "key": e.key,
                        "value": String::from_utf8_lossy(&e.value),
                        "flags": e.flags,
                        "session": e.session,
                        "create_index": e.create_index,
                        "modify_index": e.modify_index,
                        "lock_index": e.lock_index,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "index": idx, "entries": rows }))?
            );
        }
    }
    Ok(())
}

pub fn delete(config: &KeelConfig, key: &str, recurse: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let idx = next_index(&store)?;
    if recurse {
        store.kvs_delete_tree(idx, key)?;
        println!("Deleted tree {key} at index {idx}");
    } else {
        store.kvs_delete(idx, key)?;
        println!("Deleted {key} at index {idx}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_config;

    #[test]
    fn test_put_uses_next_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        put(&config, "app/a", "1", 0).unwrap();
        put(&config, "app/a", "2", 42).unwrap();

        let store = open_store(&config).unwrap();
        let (idx, entry) = store.kvs_get(None, "app/a").unwrap();
        let entry = entry.unwrap();
        assert_eq!(idx, 2);
        assert_eq!(entry.create_index, 1);
        assert_eq!(entry.modify_index, 2);
        assert_eq!(entry.flags, 42);
        assert_eq!(entry.value, b"2");
    }

    #[test]
    fn test_get_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = get(&test_config(&dir), "nope").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_recursive_delete() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        for key in ["app/a", "app/b", "other"] {
            put(&config, key, "", 0).unwrap();
        }
        delete(&config, "app/", true).unwrap();
        delete(&config, "other", false).unwrap();

        let store = open_store(&config).unwrap();
        assert!(store.kvs_list(None, "").unwrap().1.is_empty());
        assert_eq!(store.snapshot().unwrap().tombstones().unwrap().len(), 3);
        assert_eq!(store.last_index().unwrap(), 5);
    }
}
