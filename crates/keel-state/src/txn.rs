//! Batched KV transactions.
//!
//! A batch runs against one write transaction. Every operation is attempted
//! so the caller gets one error per failing operation, but a single failure
//! discards the whole batch.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateResult;
use crate::kvs::{
    kvs_check_index_txn, kvs_check_session_txn, kvs_get_txn, kvs_list_txn, kvs_lock_txn,
    kvs_set_cas_txn, kvs_set_txn, kvs_unlock_txn,
};
use crate::memdb::{Reader, WriteTxn};
use crate::store::StateStore;
use crate::types::DirEntry;

/// A KV operation inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KvVerb {
    Set,
    Delete,
    DeleteCas,
    DeleteTree,
    Cas,
    Lock,
    Unlock,
    Get,
    GetTree,
    CheckSession,
    CheckIndex,
}

impl KvVerb {
    /// True for verbs that never write.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            KvVerb::Get | KvVerb::GetTree | KvVerb::CheckSession | KvVerb::CheckIndex
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnKvOp {
    pub verb: KvVerb,
    /// Key, value, session, and modify index as the verb requires.
    pub dir_ent: DirEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnOp {
    Kv(TxnKvOp),
}

impl TxnOp {
    pub fn kv(verb: KvVerb, dir_ent: DirEntry) -> Self {
        TxnOp::Kv(TxnKvOp { verb, dir_ent })
    }

    fn is_read(&self) -> bool {
        match self {
            TxnOp::Kv(op) => op.verb.is_read(),
        }
    }
}

/// One result of a successful batch. Only `Get` and `GetTree` results
/// carry values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnResult {
    Kv(DirEntry),
}

/// Failure of the operation at `op_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnError {
    pub op_index: usize,
    pub what: String,
}

impl std::fmt::Display for TxnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op {}: {}", self.op_index, self.what)
    }
}

impl std::error::Error for TxnError {}

/// Per-operation outcome of a batch: every result, or every error.
pub type TxnResponse = Result<Vec<TxnResult>, Vec<TxnError>>;

impl StateStore {
    /// Run a mixed batch at `idx`. Commits only if every operation succeeded.
    pub fn txn_rw(&self, idx: u64, ops: &[TxnOp]) -> StateResult<TxnResponse> {
        let mut tx = self.write()?;
        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (op_index, op) in ops.iter().enumerate() {
            let outcome = match op {
                TxnOp::Kv(kv) => self.txn_kvs(&mut tx, idx, kv),
            };
            match outcome {
                Ok(ret) => results.extend(ret),
                Err(what) => errors.push(TxnError { op_index, what }),
            }
        }

        if !errors.is_empty() {
            debug!(idx, ops = ops.len(), failed = errors.len(), "txn aborted");
            return Ok(Err(errors));
        }
        tx.commit()?;
        debug!(idx, ops = ops.len(), "txn committed");
        Ok(Ok(results))
    }

    /// Run a read-only batch against one snapshot. Any writing verb fails
    /// the batch before anything is read.
    pub fn txn_ro(&self, ops: &[TxnOp]) -> StateResult<TxnResponse> {
        let errors: Vec<TxnError> = ops
            .iter()
            .enumerate()
            .filter(|(_, op)| !op.is_read())
            .map(|(op_index, _)| TxnError {
                op_index,
                what: "cannot insert in read-only transaction".to_string(),
            })
            .collect();
        if !errors.is_empty() {
            return Ok(Err(errors));
        }

        let tx = self.read()?;
        let mut results = Vec::new();
        let mut errors = Vec::new();
        for (op_index, op) in ops.iter().enumerate() {
            let TxnOp::Kv(kv) = op;
            match txn_kvs_read(&tx, kv) {
                Ok(ret) => results.extend(ret),
                Err(what) => errors.push(TxnError { op_index, what }),
            }
        }
        if errors.is_empty() {
            Ok(Ok(results))
        } else {
            Ok(Err(errors))
        }
    }

    fn txn_kvs(&self, tx: &mut WriteTxn, idx: u64, op: &TxnKvOp) -> Result<Vec<TxnResult>, String> {
        let entry = &op.dir_ent;
        let key = entry.key.as_str();
        let written = match op.verb {
            KvVerb::Set => {
                kvs_set_txn(tx, idx, entry, false).map_err(|e| e.to_string())?;
                true
            }
            KvVerb::Cas => {
                if !kvs_set_cas_txn(tx, idx, entry).map_err(|e| e.to_string())? {
                    return Err(format!("failed to set key {key:?}, index is stale"));
                }
                true
            }
            KvVerb::Lock => {
                if !kvs_lock_txn(tx, idx, entry).map_err(|e| e.to_string())? {
                    return Err(format!("failed to lock key {key:?}, lock is already held"));
                }
                true
            }
            KvVerb::Unlock => {
                if !kvs_unlock_txn(tx, idx, entry).map_err(|e| e.to_string())? {
                    return Err(format!(
                        "failed to unlock key {key:?}, lock isn't held, or is held by another session"
                    ));
                }
                true
            }
            KvVerb::Delete => {
                self.kvs_delete_txn(tx, idx, key).map_err(|e| e.to_string())?;
                false
            }
            KvVerb::DeleteCas => {
                let ok = self
                    .kvs_delete_cas_txn(tx, idx, entry.modify_index, key)
                    .map_err(|e| e.to_string())?;
                if !ok {
                    return Err(format!("failed to delete key {key:?}, index is stale"));
                }
                false
            }
            KvVerb::DeleteTree => {
                self.kvs_delete_tree_txn(tx, idx, key)
                    .map_err(|e| e.to_string())?;
                false
            }
            KvVerb::Get | KvVerb::GetTree | KvVerb::CheckSession | KvVerb::CheckIndex => {
                return txn_kvs_read(&*tx, op);
            }
        };

        if !written {
            return Ok(Vec::new());
        }
        let stored = kvs_get_txn(&*tx, key).map_err(|e| e.to_string())?;
        Ok(stored.map(blank).into_iter().collect())
    }
}

fn txn_kvs_read(tx: &impl Reader, op: &TxnKvOp) -> Result<Vec<TxnResult>, String> {
    let entry = &op.dir_ent;
    let key = entry.key.as_str();
    let found = match op.verb {
        KvVerb::Get => {
            let found = kvs_get_txn(tx, key).map_err(|e| e.to_string())?;
            let found = found.ok_or_else(|| format!("key {key:?} doesn't exist"))?;
            return Ok(vec![TxnResult::Kv(found)]);
        }
        KvVerb::GetTree => {
            let entries = kvs_list_txn(tx, &mut None, key).map_err(|e| e.to_string())?;
            return Ok(entries.into_iter().map(TxnResult::Kv).collect());
        }
        KvVerb::CheckSession => kvs_check_session_txn(tx, key, &entry.session),
        KvVerb::CheckIndex => kvs_check_index_txn(tx, key, entry.modify_index),
        verb => return Err(format!("cannot run {verb:?} as a read")),
    };
    let found = found.map_err(|e| e.to_string())?;
    Ok(vec![blank(found)])
}

/// Drop the value from a non-read result.
fn blank(mut entry: DirEntry) -> TxnResult {
    entry.value.clear();
    TxnResult::Kv(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Node, Session};

    fn test_store() -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store
            .ensure_node(1, &Node {
                node: "n1".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .session_create(2, &Session {
                id: "s1".into(),
                node: "n1".into(),
                ..Default::default()
            })
            .unwrap();
        store
    }

    fn entry(key: &str, value: &str) -> DirEntry {
        DirEntry::new(key, value)
    }

    fn kv_of(result: &TxnResult) -> &DirEntry {
        let TxnResult::Kv(entry) = result;
        entry
    }

    #[test]
    fn mixed_batch_commits_atomically() {
        let store = test_store();
        store.kvs_set(3, &entry("foo/old", "x")).unwrap();

        let ops = vec![
            TxnOp::kv(KvVerb::Set, entry("foo/a", "1")),
            TxnOp::kv(KvVerb::Set, entry("foo/b", "2")),
            TxnOp::kv(KvVerb::Delete, entry("foo/old", "")),
            TxnOp::kv(KvVerb::Get, entry("foo/a", "")),
            TxnOp::kv(KvVerb::GetTree, entry("foo/", "")),
        ];
        let results = store.txn_rw(4, &ops).unwrap().unwrap();

        // Two sets, one get, and a two-entry tree.
        assert_eq!(results.len(), 5);
        assert!(kv_of(&results[0]).value.is_empty());
        assert_eq!(kv_of(&results[0]).modify_index, 4);
        assert_eq!(kv_of(&results[2]).value, b"1");
        let tree: Vec<&str> = results[3..].iter().map(|r| kv_of(r).key.as_str()).collect();
        assert_eq!(tree, vec!["foo/a", "foo/b"]);

        assert!(store.kvs_get(None, "foo/old").unwrap().1.is_none());
        assert_eq!(store.kvs_list(None, "foo/").unwrap().0, 4);
    }

    #[test]
    fn one_failure_aborts_the_batch() {
        let store = test_store();
        store.kvs_set(3, &entry("k", "v")).unwrap();

        let mut stale = entry("k", "new");
        stale.modify_index = 1;
        let ops = vec![
            TxnOp::kv(KvVerb::Set, entry("fresh", "1")),
            TxnOp::kv(KvVerb::Cas, stale),
            TxnOp::kv(KvVerb::Get, entry("missing", "")),
        ];
        let errors = store.txn_rw(4, &ops).unwrap().unwrap_err();

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].op_index, 1);
        assert_eq!(errors[0].what, "failed to set key \"k\", index is stale");
        assert_eq!(errors[1].op_index, 2);
        assert_eq!(errors[1].what, "key \"missing\" doesn't exist");

        assert!(store.kvs_get(None, "fresh").unwrap().1.is_none());
        assert_eq!(store.last_index().unwrap(), 3);
    }

    #[test]
    fn lock_and_check_verbs() {
        let store = test_store();
        let held = DirEntry {
            session: "s1".into(),
            ..entry("lock", "me")
        };
        let results = store
            .txn_rw(3, &[TxnOp::kv(KvVerb::Lock, held.clone())])
            .unwrap()
            .unwrap();
        assert_eq!(kv_of(&results[0]).lock_index, 1);
        assert_eq!(kv_of(&results[0]).session, "s1");

        let mut check_index = entry("lock", "");
        check_index.modify_index = 3;
        let ops = vec![
            TxnOp::kv(KvVerb::CheckSession, held.clone()),
            TxnOp::kv(KvVerb::CheckIndex, check_index),
            TxnOp::kv(KvVerb::Unlock, held.clone()),
        ];
        let results = store.txn_rw(4, &ops).unwrap().unwrap();
        assert_eq!(results.len(), 3);
        assert!(kv_of(&results[0]).value.is_empty());
        assert_eq!(kv_of(&results[2]).session, "");

        // A second unlock finds nothing to release.
        let errors = store
            .txn_rw(5, &[TxnOp::kv(KvVerb::Unlock, held)])
            .unwrap()
            .unwrap_err();
        assert!(errors[0].what.starts_with("failed to unlock key \"lock\""));
    }

    #[test]
    fn delete_cas_and_tree() {
        let store = test_store();
        store.kvs_set(3, &entry("t/a", "")).unwrap();
        store.kvs_set(4, &entry("t/b", "")).unwrap();

        let mut stale = entry("t/a", "");
        stale.modify_index = 99;
        let errors = store
            .txn_rw(5, &[TxnOp::kv(KvVerb::DeleteCas, stale)])
            .unwrap()
            .unwrap_err();
        assert_eq!(errors[0].what, "failed to delete key \"t/a\", index is stale");

        let results = store
            .txn_rw(6, &[TxnOp::kv(KvVerb::DeleteTree, entry("t/", ""))])
            .unwrap()
            .unwrap();
        assert!(results.is_empty());
        assert!(store.kvs_list(None, "t/").unwrap().1.is_empty());
    }

    #[test]
    fn read_only_rejects_writes_up_front() {
        let store = test_store();
        store.kvs_set(3, &entry("k", "v")).unwrap();

        let ops = vec![
            TxnOp::kv(KvVerb::Get, entry("k", "")),
            TxnOp::kv(KvVerb::Set, entry("k", "x")),
            TxnOp::kv(KvVerb::DeleteTree, entry("", "")),
        ];
        let errors = store.txn_ro(&ops).unwrap().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].op_index, 1);
        assert_eq!(errors[1].op_index, 2);
        for error in &errors {
            assert_eq!(error.what, "cannot insert in read-only transaction");
        }

        let results = store
            .txn_ro(&[TxnOp::kv(KvVerb::Get, entry("k", ""))])
            .unwrap()
            .unwrap();
        assert_eq!(kv_of(&results[0]).value, b"v");
    }

    #[test]
    fn ops_round_trip_through_json() {
        let op = TxnOp::kv(KvVerb::DeleteCas, entry("k", "v"));
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"delete-cas\""));
        let back: TxnOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
