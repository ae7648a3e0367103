//! Sessions: lock ownership tied to a node and, optionally, node checks.
//!
//! A session is valid only while its node exists and none of its checks
//! is critical. The catalog enforces that eagerly by calling
//! [`StateStore::delete_session_txn`] whenever one of those conditions breaks.

use std::time::Instant;

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::memdb::{Reader, WriteTxn};
use crate::schema::{check_key, node_key, Record};
use crate::store::StateStore;
use crate::tables::SESSIONS;
use crate::types::*;
use crate::watch::{WatchKey, WatchSet};

impl StateStore {
    /// Create a session. Its lock delay is capped at the configured maximum.
    pub fn session_create(&self, idx: u64, session: &Session) -> StateResult<()> {
        if session.id.is_empty() {
            return Err(StateError::MissingSessionId);
        }

        let mut session = session.clone();
        session.lock_delay = session.lock_delay.min(self.config.max_lock_delay());
        session.create_index = idx;
        session.modify_index = idx;

        let mut tx = self.write()?;
        let node: Node = tx
            .first(&node_key(&session.node))?
            .ok_or(StateError::MissingNode)?;
        session.node = node.node;

        for check_id in &session.checks {
            let check: HealthCheck = tx
                .first(&check_key(&session.node, check_id))?
                .ok_or_else(|| StateError::InvalidCheck(check_id.clone()))?;
            if check.status == HealthStatus::Critical {
                return Err(StateError::CriticalCheck(check_id.clone()));
            }
        }

        tx.insert(idx, &session)?;
        for check_id in &session.checks {
            tx.insert(idx, &SessionCheck {
                node: session.node.clone(),
                check_id: check_id.clone(),
                session: session.id.clone(),
            })?;
        }
        tx.commit()?;
        debug!(session = %session.id, node = %session.node, idx, "session created");
        Ok(())
    }

    pub fn session_get(
        &self,
        ws: Option<&mut WatchSet>,
        id: &str,
    ) -> StateResult<(u64, Option<Session>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(SESSIONS)?;
        tx.watch(&mut ws, WatchKey::exact(SESSIONS, "id", id));
        Ok((idx, tx.first(id)?))
    }

    pub fn session_list(&self, ws: Option<&mut WatchSet>) -> StateResult<(u64, Vec<Session>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(SESSIONS)?;
        tx.watch(&mut ws, WatchKey::table(SESSIONS));
        Ok((idx, tx.all()?))
    }

    /// Sessions registered against one node.
    pub fn node_sessions(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> StateResult<(u64, Vec<Session>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(SESSIONS)?;
        let key = node_key(node);
        tx.watch(&mut ws, WatchKey::exact(SESSIONS, "node", key.clone()));
        Ok((idx, tx.lookup("node", &key)?))
    }

    /// Destroy a session, releasing or deleting the keys it holds.
    /// Destroying an unknown session is a no-op.
    pub fn session_destroy(&self, idx: u64, id: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        self.delete_session_txn(&mut tx, idx, id)?;
        tx.commit()?;
        debug!(session = %id, idx, "session destroyed");
        Ok(())
    }

    pub(crate) fn delete_session_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        id: &str,
    ) -> StateResult<()> {
        let Some(session) = tx.remove::<Session>(idx, id)? else {
            return Ok(());
        };

        let held: Vec<DirEntry> = tx.lookup("session", id)?;
        match session.behavior {
            SessionBehavior::Release => {
                for entry in &held {
                    let mut released = entry.clone();
                    released.session.clear();
                    released.modify_index = idx;
                    tx.insert(idx, &released)?;
                }
            }
            SessionBehavior::Delete => {
                for entry in &held {
                    self.kvs_delete_txn(tx, idx, &entry.key)?;
                }
            }
        }

        if !session.lock_delay.is_zero() && !held.is_empty() {
            let delay = self.lock_delay.clone();
            let keys: Vec<String> = held.into_iter().map(|e| e.key).collect();
            let lock_delay = session.lock_delay;
            tx.defer(move || {
                let now = Instant::now();
                for key in &keys {
                    delay.set_expiration(key, now, lock_delay);
                }
            });
        }

        let mappings: Vec<SessionCheck> = tx.lookup("session", id)?;
        for mapping in &mappings {
            tx.purge::<SessionCheck>(&mapping.id())?;
        }

        let queries: Vec<PreparedQuery> = tx.lookup("session", id)?;
        for query in &queries {
            tx.remove::<PreparedQuery>(idx, &query.id)?;
        }

        debug!(session = %id, released = mappings.len(), queries = queries.len(), "session invalidated");
        Ok(())
    }
}
