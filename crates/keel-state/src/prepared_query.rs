//! Prepared queries.
//!
//! A query is addressable by its ID or, if it has one, by its unique name.
//! IDs and names share one namespace: a name may not collide with another
//! query's ID and vice versa. A query owned by a session is deleted when that
//! session is destroyed.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::memdb::{Reader, WriteTxn};
use crate::store::StateStore;
use crate::tables::PREPARED_QUERIES;
use crate::types::{PreparedQuery, Session};
use crate::watch::{WatchKey, WatchSet};

impl StateStore {
    pub fn prepared_query_set(&self, idx: u64, query: &PreparedQuery) -> StateResult<()> {
        let mut tx = self.write()?;
        prepared_query_set_txn(&mut tx, idx, query)?;
        tx.commit()?;
        debug!(query = %query.id, idx, "prepared query stored");
        Ok(())
    }

    pub fn prepared_query_get(
        &self,
        ws: Option<&mut WatchSet>,
        id: &str,
    ) -> StateResult<(u64, Option<PreparedQuery>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(PREPARED_QUERIES)?;
        tx.watch(&mut ws, WatchKey::exact(PREPARED_QUERIES, "id", id));
        Ok((idx, tx.first(id)?))
    }

    /// Look a query up by ID, then by name.
    pub fn prepared_query_resolve(
        &self,
        id_or_name: &str,
    ) -> StateResult<(u64, Option<PreparedQuery>)> {
        let tx = self.read()?;
        let idx = tx.table_index(PREPARED_QUERIES)?;
        if id_or_name.is_empty() {
            return Ok((idx, None));
        }
        if let Some(query) = tx.first(id_or_name)? {
            return Ok((idx, Some(query)));
        }
        Ok((idx, query_by_name(&tx, id_or_name)?))
    }

    pub fn prepared_query_list(
        &self,
        ws: Option<&mut WatchSet>,
    ) -> StateResult<(u64, Vec<PreparedQuery>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(PREPARED_QUERIES)?;
        tx.watch(&mut ws, WatchKey::table(PREPARED_QUERIES));
        Ok((idx, tx.all()?))
    }

    /// Delete a query. Deleting a missing query is a no-op.
    pub fn prepared_query_delete(&self, idx: u64, id: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        if tx.remove::<PreparedQuery>(idx, id)?.is_none() {
            return Ok(());
        }
        tx.commit()?;
        debug!(query = %id, idx, "prepared query deleted");
        Ok(())
    }
}

fn query_by_name(tx: &impl Reader, name: &str) -> StateResult<Option<PreparedQuery>> {
    let mut found: Vec<PreparedQuery> = tx.lookup("name", &name.to_lowercase())?;
    Ok(found.pop())
}

fn prepared_query_set_txn(tx: &mut WriteTxn, idx: u64, query: &PreparedQuery) -> StateResult<()> {
    if query.id.is_empty() {
        return Err(StateError::MissingQueryId);
    }

    let mut query = query.clone();
    match tx.first::<PreparedQuery>(&query.id)? {
        Some(existing) => query.create_index = existing.create_index,
        None => query.create_index = idx,
    }
    query.modify_index = idx;

    // The ID must not shadow another query's name.
    if query_by_name(&*tx, &query.id)?.is_some_and(|q| q.id != query.id) {
        return Err(StateError::DuplicateQueryName(query.id));
    }

    if !query.name.is_empty() {
        let taken_name = query_by_name(&*tx, &query.name)?.is_some_and(|q| q.id != query.id);
        let taken_id = tx
            .first::<PreparedQuery>(&query.name)?
            .is_some_and(|q| q.id != query.id);
        if taken_name || taken_id {
            return Err(StateError::DuplicateQueryName(query.name));
        }
    }

    if !query.session.is_empty() && tx.first::<Session>(&query.session)?.is_none() {
        return Err(StateError::InvalidSession(query.session));
    }

    if query.service.service.is_empty() {
        return Err(StateError::MissingService);
    }

    tx.insert(idx, &query)
}
