//! Key/value store with CAS, session locks, and tombstoned deletes.

use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::graveyard::Graveyard;
use crate::memdb::{Reader, WriteTxn};
use crate::store::StateStore;
use crate::tables::{KVS, TOMBSTONES};
use crate::types::{DirEntry, Session};
use crate::watch::{WatchKey, WatchSet};

impl StateStore {
    /// Store an entry. The session is always taken from the existing row,
    /// so a plain set never acquires or steals a lock.
    pub fn kvs_set(&self, idx: u64, entry: &DirEntry) -> StateResult<()> {
        let mut tx = self.write()?;
        kvs_set_txn(&mut tx, idx, entry, false)?;
        tx.commit()?;
        debug!(key = %entry.key, idx, "kv set");
        Ok(())
    }

    pub fn kvs_get(
        &self,
        ws: Option<&mut WatchSet>,
        key: &str,
    ) -> StateResult<(u64, Option<DirEntry>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[KVS, TOMBSTONES])?;
        tx.watch(&mut ws, WatchKey::exact(KVS, "id", key));
        Ok((idx, tx.first(key)?))
    }

    /// Every entry under `prefix`. The returned index also covers keys that
    /// were deleted from the prefix and are still tombstoned.
    pub fn kvs_list(
        &self,
        ws: Option<&mut WatchSet>,
        prefix: &str,
    ) -> StateResult<(u64, Vec<DirEntry>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let entries = kvs_list_txn(&tx, &mut ws, prefix)?;
        let lindex = entries.iter().map(|e| e.modify_index).max().unwrap_or(0);
        let idx = prefix_index(&tx, prefix, lindex)?;
        Ok((idx, entries))
    }

    /// Keys under `prefix`, rolled up at the first `separator` after the
    /// prefix. An empty separator lists every key.
    pub fn kvs_list_keys(
        &self,
        ws: Option<&mut WatchSet>,
        prefix: &str,
        separator: &str,
    ) -> StateResult<(u64, Vec<String>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let entries = kvs_list_txn(&tx, &mut ws, prefix)?;

        let mut lindex = 0;
        let mut keys: Vec<String> = Vec::new();
        for entry in entries {
            lindex = lindex.max(entry.modify_index);
            if separator.is_empty() {
                keys.push(entry.key);
                continue;
            }
            let after = &entry.key[prefix.len()..];
            match after.find(separator) {
                Some(at) => {
                    let rolled = &entry.key[..prefix.len() + at + separator.len()];
                    if keys.last().is_none_or(|last| last != rolled) {
                        keys.push(rolled.to_string());
                    }
                }
                None => keys.push(entry.key),
            }
        }

        let idx = prefix_index(&tx, prefix, lindex)?;
        Ok((idx, keys))
    }

    /// Delete a key, leaving a tombstone. Deleting a missing key is a no-op.
    pub fn kvs_delete(&self, idx: u64, key: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        self.kvs_delete_txn(&mut tx, idx, key)?;
        tx.commit()?;
        debug!(%key, idx, "kv deleted");
        Ok(())
    }

    pub(crate) fn kvs_delete_txn(&self, tx: &mut WriteTxn, idx: u64, key: &str) -> StateResult<()> {
        if tx.remove::<DirEntry>(idx, key)?.is_none() {
            return Ok(());
        }
        self.graveyard.insert(tx, key, idx)
    }

    /// Delete `key` only if its modify index equals `cidx`. A missing key
    /// counts as a match.
    pub fn kvs_delete_cas(&self, idx: u64, cidx: u64, key: &str) -> StateResult<bool> {
        let mut tx = self.write()?;
        let ok = self.kvs_delete_cas_txn(&mut tx, idx, cidx, key)?;
        if ok {
            tx.commit()?;
            debug!(%key, idx, cidx, "kv deleted (cas)");
        }
        Ok(ok)
    }

    pub(crate) fn kvs_delete_cas_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        cidx: u64,
        key: &str,
    ) -> StateResult<bool> {
        let existing: Option<DirEntry> = tx.first(key)?;
        if existing.is_some_and(|e| e.modify_index != cidx) {
            return Ok(false);
        }
        self.kvs_delete_txn(tx, idx, key)?;
        Ok(true)
    }

    /// Delete every key under `prefix`, one tombstone per key.
    pub fn kvs_delete_tree(&self, idx: u64, prefix: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        let deleted = self.kvs_delete_tree_txn(&mut tx, idx, prefix)?;
        tx.commit()?;
        debug!(%prefix, idx, deleted, "kv tree deleted");
        Ok(())
    }

    pub(crate) fn kvs_delete_tree_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        prefix: &str,
    ) -> StateResult<usize> {
        let entries: Vec<DirEntry> = tx.prefix(prefix)?;
        for entry in &entries {
            self.kvs_delete_txn(tx, idx, &entry.key)?;
        }
        Ok(entries.len())
    }

    /// Check-and-set on the entry's modify index; `0` means create-only.
    pub fn kvs_set_cas(&self, idx: u64, entry: &DirEntry) -> StateResult<bool> {
        let mut tx = self.write()?;
        let ok = kvs_set_cas_txn(&mut tx, idx, entry)?;
        if ok {
            tx.commit()?;
            debug!(key = %entry.key, idx, "kv set (cas)");
        }
        Ok(ok)
    }

    /// Acquire (or refresh) the lock on `entry.key` for `entry.session`.
    /// Returns `false` if another session holds it.
    pub fn kvs_lock(&self, idx: u64, entry: &DirEntry) -> StateResult<bool> {
        let mut tx = self.write()?;
        let ok = kvs_lock_txn(&mut tx, idx, entry)?;
        if ok {
            tx.commit()?;
            debug!(key = %entry.key, session = %entry.session, idx, "kv locked");
        }
        Ok(ok)
    }

    /// Release the lock `entry.session` holds on `entry.key`. Returns
    /// `false` if the key is missing or not held by that session.
    pub fn kvs_unlock(&self, idx: u64, entry: &DirEntry) -> StateResult<bool> {
        let mut tx = self.write()?;
        let ok = kvs_unlock_txn(&mut tx, idx, entry)?;
        if ok {
            tx.commit()?;
            debug!(key = %entry.key, session = %entry.session, idx, "kv unlocked");
        }
        Ok(ok)
    }

    /// Physically remove tombstones at or below `idx`.
    pub fn reap_tombstones(&self, idx: u64) -> StateResult<usize> {
        let mut tx = self.write()?;
        let reaped = Graveyard::reap(&mut tx, idx)?;
        tx.commit()?;
        info!(idx, reaped, "tombstones reaped");
        Ok(reaped)
    }
}

/// The index a prefix read reports: the newest surviving entry or covering
/// tombstone, falling back to the tables' own indexes when neither exists.
/// An empty prefix covers everything, so it always reports the table indexes.
fn prefix_index(tx: &impl Reader, prefix: &str, lindex: u64) -> StateResult<u64> {
    if prefix.is_empty() {
        return tx.max_index(&[KVS, TOMBSTONES]);
    }
    let gindex = Graveyard::max_index_in_prefix(tx, prefix)?;
    let idx = lindex.max(gindex);
    if idx == 0 {
        return tx.max_index(&[KVS, TOMBSTONES]);
    }
    Ok(idx)
}

pub(crate) fn kvs_get_txn(tx: &impl Reader, key: &str) -> StateResult<Option<DirEntry>> {
    tx.first(key)
}

pub(crate) fn kvs_list_txn(
    tx: &impl Reader,
    ws: &mut Option<&mut WatchSet>,
    prefix: &str,
) -> StateResult<Vec<DirEntry>> {
    tx.watch(ws, WatchKey::prefix(KVS, "id", prefix));
    tx.prefix(prefix)
}

pub(crate) fn kvs_set_txn(
    tx: &mut WriteTxn,
    idx: u64,
    entry: &DirEntry,
    update_session: bool,
) -> StateResult<()> {
    let existing: Option<DirEntry> = tx.first(&entry.key)?;
    let mut entry = entry.clone();
    match &existing {
        Some(e) => entry.create_index = e.create_index,
        None => entry.create_index = idx,
    }
    entry.modify_index = idx;
    if !update_session {
        entry.session = existing.map(|e| e.session).unwrap_or_default();
    }
    tx.insert(idx, &entry)
}

pub(crate) fn kvs_set_cas_txn(tx: &mut WriteTxn, idx: u64, entry: &DirEntry) -> StateResult<bool> {
    let existing: Option<DirEntry> = tx.first(&entry.key)?;
    let matches = match (entry.modify_index, &existing) {
        (0, existing) => existing.is_none(),
        (cidx, Some(e)) => e.modify_index == cidx,
        (_, None) => false,
    };
    if !matches {
        return Ok(false);
    }
    kvs_set_txn(tx, idx, entry, false)?;
    Ok(true)
}

pub(crate) fn kvs_lock_txn(tx: &mut WriteTxn, idx: u64, entry: &DirEntry) -> StateResult<bool> {
    if entry.session.is_empty() {
        return Err(StateError::MissingSession);
    }
    if tx.first::<Session>(&entry.session)?.is_none() {
        return Err(StateError::InvalidSession(entry.session.clone()));
    }

    let mut entry = entry.clone();
    match tx.first::<DirEntry>(&entry.key)? {
        Some(existing) if existing.session == entry.session => {
            entry.lock_index = existing.lock_index;
        }
        Some(existing) if !existing.session.is_empty() => return Ok(false),
        Some(existing) => entry.lock_index = existing.lock_index + 1,
        None => entry.lock_index = 1,
    }
    kvs_set_txn(tx, idx, &entry, true)?;
    Ok(true)
}

pub(crate) fn kvs_unlock_txn(tx: &mut WriteTxn, idx: u64, entry: &DirEntry) -> StateResult<bool> {
    if entry.session.is_empty() {
        return Err(StateError::MissingSession);
    }

    let Some(existing) = tx.first::<DirEntry>(&entry.key)? else {
        return Ok(false);
    };
    if existing.session != entry.session {
        return Ok(false);
    }

    let mut entry = entry.clone();
    entry.session.clear();
    entry.lock_index = existing.lock_index;
    kvs_set_txn(tx, idx, &entry, true)?;
    Ok(true)
}

/// Fails unless `key` exists and is locked by `session`.
pub(crate) fn kvs_check_session_txn(
    tx: &impl Reader,
    key: &str,
    session: &str,
) -> StateResult<DirEntry> {
    let entry: DirEntry = tx.first(key)?.ok_or_else(|| StateError::KeyMissing {
        what: "session",
        key: key.to_string(),
    })?;
    if entry.session != session {
        return Err(StateError::SessionMismatch {
            key: key.to_string(),
            current: entry.session,
            expected: session.to_string(),
        });
    }
    Ok(entry)
}

/// Fails unless `key` exists with modify index `cidx`.
pub(crate) fn kvs_check_index_txn(tx: &impl Reader, key: &str, cidx: u64) -> StateResult<DirEntry> {
    let entry: DirEntry = tx.first(key)?.ok_or_else(|| StateError::KeyMissing {
        what: "index",
        key: key.to_string(),
    })?;
    if entry.modify_index != cidx {
        return Err(StateError::IndexMismatch {
            key: key.to_string(),
            current: entry.modify_index,
            expected: cidx,
        });
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Node;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    /// A store with node `n1` and sessions `s1`, `s2` at indexes 1..=3.
    fn store_with_sessions() -> StateStore {
        let store = test_store();
        store
            .ensure_node(1, &Node {
                node: "n1".into(),
                address: "10.0.0.1".into(),
                ..Default::default()
            })
            .unwrap();
        for (i, id) in ["s1", "s2"].into_iter().enumerate() {
            store
                .session_create(2 + i as u64, &Session {
                    id: id.into(),
                    node: "n1".into(),
                    ..Default::default()
                })
                .unwrap();
        }
        store
    }

    fn locked(key: &str, value: &str, session: &str) -> DirEntry {
        DirEntry {
            session: session.into(),
            ..DirEntry::new(key, value)
        }
    }

    #[test]
    fn set_and_get() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("foo", "bar")).unwrap();
        store.kvs_set(2, &DirEntry::new("foo", "baz")).unwrap();

        let (idx, entry) = store.kvs_get(None, "foo").unwrap();
        let entry = entry.unwrap();
        assert_eq!(idx, 2);
        assert_eq!(entry.value, b"baz");
        assert_eq!((entry.create_index, entry.modify_index), (1, 2));

        let (_, missing) = store.kvs_get(None, "Foo").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn set_never_changes_lock_holder() {
        let store = store_with_sessions();
        // Set cannot take a lock.
        store.kvs_set(4, &locked("k", "v", "s1")).unwrap();
        assert_eq!(store.kvs_get(None, "k").unwrap().1.unwrap().session, "");

        assert!(store.kvs_lock(5, &locked("k", "v", "s1")).unwrap());
        // Nor clear or steal one.
        store.kvs_set(6, &DirEntry::new("k", "v2")).unwrap();
        store.kvs_set(7, &locked("k", "v3", "s2")).unwrap();
        let entry = store.kvs_get(None, "k").unwrap().1.unwrap();
        assert_eq!(entry.session, "s1");
        assert_eq!(entry.value, b"v3");
    }

    #[test]
    fn list_reports_tombstone_index() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("foo/a", "1")).unwrap();
        store.kvs_set(2, &DirEntry::new("foo/b", "2")).unwrap();
        store.kvs_set(3, &DirEntry::new("other", "3")).unwrap();
        store.kvs_delete(4, "foo/b").unwrap();

        let (idx, entries) = store.kvs_list(None, "foo/").unwrap();
        assert_eq!(idx, 4);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "foo/a");
    }

    #[test]
    fn delete_then_reap_scenario() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("a", "")).unwrap();
        store.kvs_delete(2, "a").unwrap();

        let (idx, entries) = store.kvs_list(None, "a").unwrap();
        assert_eq!(idx, 2);
        assert!(entries.is_empty());

        // A reap below the delete keeps the tombstone.
        assert_eq!(store.reap_tombstones(1).unwrap(), 0);
        assert_eq!(store.kvs_list(None, "a").unwrap().0, 2);

        assert_eq!(store.reap_tombstones(2).unwrap(), 1);
        let (idx, entries) = store.kvs_list(None, "a").unwrap();
        // Nothing covers the prefix anymore; the tables' indexes remain.
        assert_eq!(idx, 2);
        assert!(entries.is_empty());
    }

    #[test]
    fn list_on_empty_store_is_zero() {
        let store = test_store();
        let (idx, entries) = store.kvs_list(None, "").unwrap();
        assert_eq!(idx, 0);
        assert!(entries.is_empty());
    }

    #[test]
    fn full_list_index_survives_reap() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("k1", "")).unwrap();
        store.kvs_set(2, &DirEntry::new("k2", "")).unwrap();
        store.kvs_delete(3, "k2").unwrap();
        assert_eq!(store.kvs_list(None, "").unwrap().0, 3);

        store.reap_tombstones(3).unwrap();
        let (idx, entries) = store.kvs_list(None, "").unwrap();
        assert_eq!(idx, 3);
        assert_eq!(entries.len(), 1);
        let (idx, keys) = store.kvs_list_keys(None, "", "/").unwrap();
        assert_eq!(idx, 3);
        assert_eq!(keys, vec!["k1"]);
    }

    #[test]
    fn list_keys_rolls_up_at_separator() {
        let store = test_store();
        for (i, key) in ["foo/a", "foo/b/1", "foo/b/2", "foo/c/x", "foo/d"].iter().enumerate() {
            store.kvs_set(i as u64 + 1, &DirEntry::new(*key, "")).unwrap();
        }

        let (idx, keys) = store.kvs_list_keys(None, "foo/", "/").unwrap();
        assert_eq!(idx, 5);
        assert_eq!(keys, vec!["foo/a", "foo/b/", "foo/c/", "foo/d"]);

        let (_, keys) = store.kvs_list_keys(None, "foo/b", "").unwrap();
        assert_eq!(keys, vec!["foo/b/1", "foo/b/2"]);

        store.kvs_delete(9, "foo/d").unwrap();
        let (idx, _) = store.kvs_list_keys(None, "foo/", "/").unwrap();
        assert_eq!(idx, 9);
    }

    #[test]
    fn delete_missing_key_does_not_move_index() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("a", "")).unwrap();
        store.kvs_delete(5, "nope").unwrap();
        assert_eq!(store.max_index(&[KVS, TOMBSTONES]).unwrap(), 1);
    }

    #[test]
    fn delete_tree_tombstones_every_key() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("foo/a", "")).unwrap();
        store.kvs_set(2, &DirEntry::new("foo/b", "")).unwrap();
        store.kvs_set(3, &DirEntry::new("food", "")).unwrap();

        store.kvs_delete_tree(4, "foo/").unwrap();
        let (_, all) = store.kvs_list(None, "").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "food");
        assert_eq!(store.kvs_list(None, "foo/").unwrap().0, 4);
        assert_eq!(store.snapshot().unwrap().tombstones().unwrap().len(), 2);

        // No matches, no index movement.
        store.kvs_delete_tree(10, "bar/").unwrap();
        assert_eq!(store.max_index(&[KVS, TOMBSTONES]).unwrap(), 4);
    }

    #[test]
    fn set_cas_create_only_and_exact_match() {
        let store = test_store();
        let mut entry = DirEntry::new("k", "1");
        assert!(store.kvs_set_cas(1, &entry).unwrap());
        // Create-only on an existing key fails without touching the row.
        entry.value = b"2".to_vec();
        assert!(!store.kvs_set_cas(2, &entry).unwrap());
        let (idx, stored) = store.kvs_get(None, "k").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(stored.unwrap().value, b"1");

        entry.modify_index = 7;
        assert!(!store.kvs_set_cas(3, &entry).unwrap());
        entry.modify_index = 1;
        assert!(store.kvs_set_cas(4, &entry).unwrap());
        assert_eq!(store.kvs_get(None, "k").unwrap().1.unwrap().modify_index, 4);

        let mut ghost = DirEntry::new("ghost", "");
        ghost.modify_index = 4;
        assert!(!store.kvs_set_cas(5, &ghost).unwrap());
    }

    #[test]
    fn delete_cas() {
        let store = test_store();
        store.kvs_set(1, &DirEntry::new("k", "")).unwrap();
        assert!(!store.kvs_delete_cas(2, 9, "k").unwrap());
        assert!(store.kvs_get(None, "k").unwrap().1.is_some());
        assert!(store.kvs_delete_cas(3, 1, "k").unwrap());
        assert!(store.kvs_get(None, "k").unwrap().1.is_none());
        assert!(store.kvs_delete_cas(4, 1, "k").unwrap());
        assert_eq!(store.max_index(&[KVS, TOMBSTONES]).unwrap(), 3);
    }

    #[test]
    fn lock_requires_valid_session() {
        let store = store_with_sessions();
        let err = store.kvs_lock(4, &DirEntry::new("k", "")).unwrap_err();
        assert!(matches!(err, StateError::MissingSession));
        let err = store.kvs_lock(4, &locked("k", "", "nope")).unwrap_err();
        assert!(matches!(err, StateError::InvalidSession(ref s) if s == "nope"));
        let err = store.kvs_unlock(4, &DirEntry::new("k", "")).unwrap_err();
        assert!(matches!(err, StateError::MissingSession));
    }

    #[test]
    fn lock_index_counts_new_acquisitions() {
        let store = store_with_sessions();

        assert!(store.kvs_lock(4, &locked("k", "a", "s1")).unwrap());
        let entry = store.kvs_get(None, "k").unwrap().1.unwrap();
        assert_eq!((entry.lock_index, entry.create_index, entry.modify_index), (1, 4, 4));

        // Re-lock by the holder updates the value only.
        assert!(store.kvs_lock(5, &locked("k", "b", "s1")).unwrap());
        let entry = store.kvs_get(None, "k").unwrap().1.unwrap();
        assert_eq!(entry.lock_index, 1);
        assert_eq!(entry.value, b"b");

        // Another session is turned away.
        assert!(!store.kvs_lock(6, &locked("k", "c", "s2")).unwrap());
        assert!(!store.kvs_unlock(6, &locked("k", "c", "s2")).unwrap());
        assert_eq!(store.kvs_get(None, "k").unwrap().0, 5);

        assert!(store.kvs_unlock(7, &locked("k", "d", "s1")).unwrap());
        let entry = store.kvs_get(None, "k").unwrap().1.unwrap();
        assert_eq!(entry.session, "");
        assert_eq!(entry.lock_index, 1);
        assert_eq!(entry.value, b"d");

        // Unlocking an unlocked key is a no-op.
        assert!(!store.kvs_unlock(8, &locked("k", "e", "s1")).unwrap());

        assert!(store.kvs_lock(9, &locked("k", "f", "s2")).unwrap());
        let entry = store.kvs_get(None, "k").unwrap().1.unwrap();
        assert_eq!(entry.lock_index, 2);
        assert_eq!(entry.session, "s2");
        assert_eq!(entry.create_index, 4);
    }

    #[test]
    fn unlock_missing_key_is_noop() {
        let store = store_with_sessions();
        assert!(!store.kvs_unlock(4, &locked("nope", "", "s1")).unwrap());
    }

    #[test]
    fn get_watch_fires_on_set_and_delete() {
        let store = test_store();
        let mut ws = WatchSet::new();
        store.kvs_get(Some(&mut ws), "k").unwrap();
        store.kvs_set(1, &DirEntry::new("other", "")).unwrap();
        assert!(!ws.fired());
        store.kvs_set(2, &DirEntry::new("k", "")).unwrap();
        assert!(ws.fired());

        let mut ws = WatchSet::new();
        store.kvs_list(Some(&mut ws), "k").unwrap();
        store.kvs_delete(3, "k").unwrap();
        assert!(ws.fired());
    }

    #[test]
    fn check_helpers_report_mismatches() {
        let store = store_with_sessions();
        assert!(store.kvs_lock(4, &locked("k", "", "s1")).unwrap());
        let tx = store.read().unwrap();

        assert!(kvs_check_session_txn(&tx, "k", "s1").is_ok());
        let err = kvs_check_session_txn(&tx, "k", "s2").unwrap_err();
        assert!(matches!(err, StateError::SessionMismatch { .. }));
        let err = kvs_check_session_txn(&tx, "nope", "s1").unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to check session, key \"nope\" doesn't exist"
        );

        assert!(kvs_check_index_txn(&tx, "k", 4).is_ok());
        let err = kvs_check_index_txn(&tx, "k", 3).unwrap_err();
        assert!(matches!(
            err,
            StateError::IndexMismatch {
                current: 4,
                expected: 3,
                ..
            }
        ));
    }
}
