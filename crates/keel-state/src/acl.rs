//! Legacy ACL tokens. Plain rows; nothing cascades into or out of them.

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::memdb::Reader;
use crate::store::StateStore;
use crate::tables::ACLS;
use crate::types::Acl;
use crate::watch::{WatchKey, WatchSet};

impl StateStore {
    pub fn acl_set(&self, idx: u64, acl: &Acl) -> StateResult<()> {
        if acl.id.is_empty() {
            return Err(StateError::MissingAclId);
        }

        let mut tx = self.write()?;
        let mut acl = acl.clone();
        match tx.first::<Acl>(&acl.id)? {
            Some(existing) => acl.create_index = existing.create_index,
            None => acl.create_index = idx,
        }
        acl.modify_index = idx;
        tx.insert(idx, &acl)?;
        tx.commit()?;
        debug!(acl = %acl.id, idx, "acl stored");
        Ok(())
    }

    pub fn acl_get(&self, ws: Option<&mut WatchSet>, id: &str) -> StateResult<(u64, Option<Acl>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(ACLS)?;
        tx.watch(&mut ws, WatchKey::exact(ACLS, "id", id));
        Ok((idx, tx.first(id)?))
    }

    pub fn acl_list(&self, ws: Option<&mut WatchSet>) -> StateResult<(u64, Vec<Acl>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(ACLS)?;
        tx.watch(&mut ws, WatchKey::table(ACLS));
        Ok((idx, tx.all()?))
    }

    /// Delete an ACL. Deleting a missing ACL is a no-op.
    pub fn acl_delete(&self, idx: u64, id: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        if tx.remove::<Acl>(idx, id)?.is_none() {
            return Ok(());
        }
        tx.commit()?;
        debug!(acl = %id, idx, "acl deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AclType;

    fn test_acl(id: &str) -> Acl {
        Acl {
            id: id.into(),
            name: "operator".into(),
            acl_type: AclType::Management,
            rules: r#"key "" { policy = "write" }"#.into(),
            ..Default::default()
        }
    }

    #[test]
    fn set_requires_id() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.acl_set(1, &test_acl("")).unwrap_err();
        assert!(matches!(err, StateError::MissingAclId));
    }

    #[test]
    fn set_get_update_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.acl_set(1, &test_acl("a1")).unwrap();
        let mut updated = test_acl("a1");
        updated.name = "renamed".into();
        store.acl_set(2, &updated).unwrap();

        let (idx, acl) = store.acl_get(None, "a1").unwrap();
        let acl = acl.unwrap();
        assert_eq!(idx, 2);
        assert_eq!(acl.name, "renamed");
        assert_eq!((acl.create_index, acl.modify_index), (1, 2));

        store.acl_set(3, &test_acl("a2")).unwrap();
        let (_, all) = store.acl_list(None).unwrap();
        assert_eq!(all.len(), 2);

        store.acl_delete(4, "a1").unwrap();
        store.acl_delete(5, "missing").unwrap();
        let (idx, all) = store.acl_list(None).unwrap();
        assert_eq!(idx, 4);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "a2");
    }

    #[test]
    fn acl_type_serializes_as_type() {
        let json = serde_json::to_value(test_acl("a1")).unwrap();
        assert_eq!(json["type"], "management");
    }
}
