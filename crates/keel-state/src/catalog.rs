//! Catalog: nodes, services, and health checks.
//!
//! Referential integrity is enforced here rather than by the table engine:
//! services and checks require their node, service-bound checks require
//! their service, and deletes cascade downwards (node → services → checks →
//! dependent sessions).

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::memdb::{Reader, WriteTxn};
use crate::schema::{check_key, node_key, service_key, Record};
use crate::store::StateStore;
use crate::tables::*;
use crate::types::*;
use crate::watch::{WatchKey, WatchSet};

impl StateStore {
    // ── Registration ───────────────────────────────────────────────

    /// Register a node and, optionally, one service and its checks, in a
    /// single transaction. Unchanged node and service rows are left alone
    /// so their indexes (and watchers) are not disturbed.
    pub fn ensure_registration(&self, idx: u64, req: &RegisterRequest) -> StateResult<()> {
        let mut tx = self.write()?;
        self.ensure_registration_txn(&mut tx, idx, req)?;
        tx.commit()?;
        debug!(node = %req.node, idx, "registration applied");
        Ok(())
    }

    pub(crate) fn ensure_registration_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        req: &RegisterRequest,
    ) -> StateResult<()> {
        let existing: Option<Node> = tx.first(&node_key(&req.node))?;
        let update_node = match &existing {
            Some(node) => req.changes_node(node),
            None => true,
        };
        if update_node {
            self.ensure_node_txn(tx, idx, &req.to_node())?;
        }

        if let Some(svc) = &req.service {
            let existing: Option<ServiceNode> = tx.first(&service_key(&req.node, &svc.id))?;
            let changed = existing.is_none_or(|e| !e.to_node_service().is_same(svc));
            if changed {
                self.ensure_service_txn(tx, idx, &req.node, svc)?;
            }
        }

        for check in req.check.iter().chain(req.checks.iter()) {
            let mut check = check.clone();
            if check.node.is_empty() {
                check.node = req.node.clone();
            } else if !check.node.eq_ignore_ascii_case(&req.node) {
                return Err(StateError::NodeMismatch {
                    check: check.check_id,
                    check_node: check.node,
                    node: req.node.clone(),
                });
            }
            self.ensure_check_txn(tx, idx, &check)?;
        }
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn ensure_node(&self, idx: u64, node: &Node) -> StateResult<()> {
        let mut tx = self.write()?;
        self.ensure_node_txn(&mut tx, idx, node)?;
        tx.commit()?;
        debug!(node = %node.node, idx, "node stored");
        Ok(())
    }

    fn ensure_node_txn(&self, tx: &mut WriteTxn, idx: u64, node: &Node) -> StateResult<()> {
        if !node.id.is_empty() {
            let owners: Vec<Node> = tx.lookup("uuid", &node.id.to_lowercase())?;
            if let Some(owner) = owners
                .iter()
                .find(|n| !n.node.eq_ignore_ascii_case(&node.node))
            {
                return Err(StateError::NodeIdConflict {
                    id: node.id.clone(),
                    node: node.node.clone(),
                    existing: owner.node.clone(),
                });
            }
        }

        let mut node = node.clone();
        match tx.first::<Node>(&node.id())? {
            Some(existing) => node.create_index = existing.create_index,
            None => node.create_index = idx,
        }
        node.modify_index = idx;
        tx.insert(idx, &node)
    }

    /// Look up a node by name.
    pub fn get_node(&self, name: &str) -> StateResult<(u64, Option<Node>)> {
        let tx = self.read()?;
        let idx = tx.table_index(NODES)?;
        Ok((idx, tx.first(&node_key(name))?))
    }

    /// Look up a node by its UUID.
    pub fn get_node_id(&self, id: &str) -> StateResult<(u64, Option<Node>)> {
        let tx = self.read()?;
        let idx = tx.table_index(NODES)?;
        let mut nodes: Vec<Node> = tx.lookup("uuid", &id.to_lowercase())?;
        Ok((idx, nodes.pop()))
    }

    pub fn nodes(&self, ws: Option<&mut WatchSet>) -> StateResult<(u64, Vec<Node>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(NODES)?;
        tx.watch(&mut ws, WatchKey::table(NODES));
        Ok((idx, tx.all()?))
    }

    /// Nodes whose meta contains every filter pair.
    pub fn nodes_by_meta(
        &self,
        ws: Option<&mut WatchSet>,
        filters: &Meta,
    ) -> StateResult<(u64, Vec<Node>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(NODES)?;
        let nodes = nodes_by_meta_txn(&tx, &mut ws, filters)?;
        Ok((idx, nodes))
    }

    /// Delete a node and everything registered against it.
    pub fn delete_node(&self, idx: u64, name: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        self.delete_node_txn(&mut tx, idx, name)?;
        tx.commit()?;
        debug!(node = %name, idx, "node deleted");
        Ok(())
    }

    pub(crate) fn delete_node_txn(&self, tx: &mut WriteTxn, idx: u64, name: &str) -> StateResult<()> {
        let key = node_key(name);
        if tx.first::<Node>(&key)?.is_none() {
            return Ok(());
        }

        // Collect first; each delete runs its own cascade.
        let services: Vec<ServiceNode> = tx.lookup("node", &key)?;
        for svc in &services {
            self.delete_service_txn(tx, idx, name, &svc.service_id)?;
        }

        let checks: Vec<HealthCheck> = tx.lookup("node", &key)?;
        for check in &checks {
            self.delete_check_txn(tx, idx, name, &check.check_id)?;
        }

        tx.remove::<CoordinateEntry>(idx, &key)?;
        tx.remove::<Node>(idx, &key)?;

        let sessions: Vec<Session> = tx.lookup("node", &key)?;
        for session in &sessions {
            self.delete_session_txn(tx, idx, &session.id)?;
        }
        Ok(())
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service on an existing node.
    pub fn ensure_service(&self, idx: u64, node: &str, svc: &NodeService) -> StateResult<()> {
        let mut tx = self.write()?;
        self.ensure_service_txn(&mut tx, idx, node, svc)?;
        tx.commit()?;
        debug!(%node, service = %svc.id, idx, "service stored");
        Ok(())
    }

    fn ensure_service_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        node: &str,
        svc: &NodeService,
    ) -> StateResult<()> {
        // An empty ID would share the node-level check key.
        if svc.id.is_empty() {
            return Err(StateError::MissingServiceId);
        }
        let owner: Node = tx.first(&node_key(node))?.ok_or(StateError::MissingNode)?;

        let mut entry = svc.to_service_node(&owner.node);
        match tx.first::<ServiceNode>(&entry.id())? {
            Some(existing) => entry.create_index = existing.create_index,
            None => entry.create_index = idx,
        }
        entry.modify_index = idx;
        tx.insert(idx, &entry)
    }

    /// Every service name with the union of its instances' tags.
    pub fn services(&self, ws: Option<&mut WatchSet>) -> StateResult<(u64, ServiceTags)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(SERVICES)?;
        tx.watch(&mut ws, WatchKey::table(SERVICES));
        let services: Vec<ServiceNode> = tx.all()?;
        Ok((idx, collect_tags(&services)))
    }

    /// Like [`StateStore::services`], restricted to nodes matching `filters`.
    pub fn services_by_node_meta(
        &self,
        ws: Option<&mut WatchSet>,
        filters: &Meta,
    ) -> StateResult<(u64, ServiceTags)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES])?;
        let nodes = nodes_by_meta_txn(&tx, &mut ws, filters)?;

        let mut services = Vec::new();
        for node in &nodes {
            let key = node_key(&node.node);
            tx.watch_limited(
                &mut ws,
                self.config.watch_limit,
                WatchKey::exact(SERVICES, "node", key.clone()),
                WatchKey::table(SERVICES),
            );
            services.extend(tx.lookup::<ServiceNode>("node", &key)?);
        }
        Ok((idx, collect_tags(&services)))
    }

    /// Every instance of a service, joined with its node.
    pub fn service_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
    ) -> StateResult<(u64, Vec<ServiceNode>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES])?;
        let services = service_lookup(&tx, &mut ws, service)?;
        let joined = self.join_service_nodes(&tx, &mut ws, services)?;
        Ok((idx, joined))
    }

    /// Instances of a service carrying `tag` (case-insensitive).
    pub fn service_tag_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
        tag: &str,
    ) -> StateResult<(u64, Vec<ServiceNode>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES])?;
        let services: Vec<ServiceNode> = service_lookup(&tx, &mut ws, service)?
            .into_iter()
            .filter(|s| s.has_tag(tag))
            .collect();
        let joined = self.join_service_nodes(&tx, &mut ws, services)?;
        Ok((idx, joined))
    }

    fn join_service_nodes(
        &self,
        tx: &impl Reader,
        ws: &mut Option<&mut WatchSet>,
        services: Vec<ServiceNode>,
    ) -> StateResult<Vec<ServiceNode>> {
        let mut joined = Vec::with_capacity(services.len());
        for svc in services {
            let node = self.watched_node(tx, ws, &svc.node)?;
            joined.push(svc.with_node(&node));
        }
        Ok(joined)
    }

    /// Fetch a service's owning node, watching it under the soft limit.
    fn watched_node(
        &self,
        tx: &impl Reader,
        ws: &mut Option<&mut WatchSet>,
        name: &str,
    ) -> StateResult<Node> {
        let key = node_key(name);
        tx.watch_limited(
            ws,
            self.config.watch_limit,
            WatchKey::exact(NODES, "id", key.clone()),
            WatchKey::table(NODES),
        );
        tx.first(&key)?.ok_or_else(|| StateError::Corrupt {
            table: SERVICES,
            detail: format!("service registered on unknown node {name:?}"),
        })
    }

    /// A single service on a node.
    pub fn node_service(
        &self,
        node: &str,
        service_id: &str,
    ) -> StateResult<(u64, Option<NodeService>)> {
        let tx = self.read()?;
        let idx = tx.table_index(SERVICES)?;
        let svc: Option<ServiceNode> = tx.first(&service_key(node, service_id))?;
        Ok((idx, svc.map(|s| s.to_node_service())))
    }

    /// A node and all of its services, or `None` if the node is unknown.
    pub fn node_services(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> StateResult<(u64, Option<NodeServices>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES])?;
        let key = node_key(node);

        tx.watch(&mut ws, WatchKey::exact(NODES, "id", key.clone()));
        let Some(owner) = tx.first::<Node>(&key)? else {
            return Ok((idx, None));
        };

        tx.watch(&mut ws, WatchKey::exact(SERVICES, "node", key.clone()));
        let services: Vec<ServiceNode> = tx.lookup("node", &key)?;
        let services = services
            .iter()
            .map(|s| (s.service_id.clone(), s.to_node_service()))
            .collect();
        Ok((
            idx,
            Some(NodeServices {
                node: owner,
                services,
            }),
        ))
    }

    /// Delete a service and the checks bound to it.
    pub fn delete_service(&self, idx: u64, node: &str, service_id: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        self.delete_service_txn(&mut tx, idx, node, service_id)?;
        tx.commit()?;
        debug!(%node, service = %service_id, idx, "service deleted");
        Ok(())
    }

    fn delete_service_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        node: &str,
        service_id: &str,
    ) -> StateResult<()> {
        let key = service_key(node, service_id);
        if tx.first::<ServiceNode>(&key)?.is_none() {
            return Ok(());
        }

        let checks: Vec<HealthCheck> = tx.lookup("node_service", &key)?;
        for check in &checks {
            self.delete_check_txn(tx, idx, node, &check.check_id)?;
        }

        tx.remove::<ServiceNode>(idx, &key)?;
        Ok(())
    }

    // ── Checks ─────────────────────────────────────────────────────

    /// Insert or update a health check. A check that is (or becomes)
    /// critical invalidates every session depending on it.
    pub fn ensure_check(&self, idx: u64, check: &HealthCheck) -> StateResult<()> {
        let mut tx = self.write()?;
        self.ensure_check_txn(&mut tx, idx, check)?;
        tx.commit()?;
        debug!(node = %check.node, check = %check.check_id, status = %check.status, idx, "check stored");
        Ok(())
    }

    fn ensure_check_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        check: &HealthCheck,
    ) -> StateResult<()> {
        let mut check = check.clone();
        match tx.first::<HealthCheck>(&check.id())? {
            Some(existing) => check.create_index = existing.create_index,
            None => check.create_index = idx,
        }
        check.modify_index = idx;

        let owner: Node = tx
            .first(&node_key(&check.node))?
            .ok_or(StateError::MissingNode)?;
        check.node = owner.node;

        if !check.service_id.is_empty() {
            let svc: ServiceNode = tx
                .first(&service_key(&check.node, &check.service_id))?
                .ok_or(StateError::MissingService)?;
            check.service_name = svc.service_name;
            check.service_tags = svc.service_tags;
        }

        if check.status == HealthStatus::Critical {
            self.invalidate_check_sessions(tx, idx, &check.node, &check.check_id)?;
        }

        tx.insert(idx, &check)
    }

    /// Destroy every session that lists `(node, check_id)` as a dependency.
    fn invalidate_check_sessions(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        node: &str,
        check_id: &str,
    ) -> StateResult<()> {
        let mappings: Vec<SessionCheck> = tx.lookup("node_check", &check_key(node, check_id))?;
        for mapping in &mappings {
            self.delete_session_txn(tx, idx, &mapping.session)?;
        }
        Ok(())
    }

    pub fn node_check(
        &self,
        node: &str,
        check_id: &str,
    ) -> StateResult<(u64, Option<HealthCheck>)> {
        let tx = self.read()?;
        let idx = tx.table_index(CHECKS)?;
        Ok((idx, tx.first(&check_key(node, check_id))?))
    }

    pub fn node_checks(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> StateResult<(u64, Vec<HealthCheck>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(CHECKS)?;
        let key = node_key(node);
        tx.watch(&mut ws, WatchKey::exact(CHECKS, "node", key.clone()));
        Ok((idx, tx.lookup("node", &key)?))
    }

    /// Checks bound to any instance of a service.
    pub fn service_checks(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
    ) -> StateResult<(u64, Vec<HealthCheck>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(CHECKS)?;
        let name = service.to_lowercase();
        tx.watch(&mut ws, WatchKey::exact(CHECKS, "service", name.clone()));
        Ok((idx, tx.lookup("service", &name)?))
    }

    pub fn service_checks_by_node_meta(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
        filters: &Meta,
    ) -> StateResult<(u64, Vec<HealthCheck>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, CHECKS])?;
        let name = service.to_lowercase();
        tx.watch(&mut ws, WatchKey::exact(CHECKS, "service", name.clone()));
        let checks: Vec<HealthCheck> = tx.lookup("service", &name)?;
        let checks = self.filter_checks_by_node_meta(&tx, &mut ws, checks, filters)?;
        Ok((idx, checks))
    }

    /// Checks in the given state; `None` matches every state.
    pub fn checks_in_state(
        &self,
        ws: Option<&mut WatchSet>,
        state: Option<HealthStatus>,
    ) -> StateResult<(u64, Vec<HealthCheck>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.table_index(CHECKS)?;
        Ok((idx, checks_in_state_txn(&tx, &mut ws, state)?))
    }

    pub fn checks_in_state_by_node_meta(
        &self,
        ws: Option<&mut WatchSet>,
        state: Option<HealthStatus>,
        filters: &Meta,
    ) -> StateResult<(u64, Vec<HealthCheck>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, CHECKS])?;
        let checks = checks_in_state_txn(&tx, &mut ws, state)?;
        let checks = self.filter_checks_by_node_meta(&tx, &mut ws, checks, filters)?;
        Ok((idx, checks))
    }

    fn filter_checks_by_node_meta(
        &self,
        tx: &impl Reader,
        ws: &mut Option<&mut WatchSet>,
        checks: Vec<HealthCheck>,
        filters: &Meta,
    ) -> StateResult<Vec<HealthCheck>> {
        let mut kept = Vec::new();
        for check in checks {
            let key = node_key(&check.node);
            tx.watch_limited(
                ws,
                self.config.watch_limit,
                WatchKey::exact(NODES, "id", key.clone()),
                WatchKey::table(NODES),
            );
            let node: Option<Node> = tx.first(&key)?;
            if node.is_some_and(|n| n.matches_meta(filters)) {
                kept.push(check);
            }
        }
        Ok(kept)
    }

    /// Delete a check, invalidating sessions that depend on it.
    pub fn delete_check(&self, idx: u64, node: &str, check_id: &str) -> StateResult<()> {
        let mut tx = self.write()?;
        self.delete_check_txn(&mut tx, idx, node, check_id)?;
        tx.commit()?;
        debug!(%node, check = %check_id, idx, "check deleted");
        Ok(())
    }

    fn delete_check_txn(
        &self,
        tx: &mut WriteTxn,
        idx: u64,
        node: &str,
        check_id: &str,
    ) -> StateResult<()> {
        if tx.remove::<HealthCheck>(idx, &check_key(node, check_id))?.is_none() {
            return Ok(());
        }
        self.invalidate_check_sessions(tx, idx, node, check_id)
    }

    // ── Joined reads ───────────────────────────────────────────────

    /// Instances of a service with their node and applicable checks.
    /// Returns `None` when nothing matches.
    pub fn check_service_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
    ) -> StateResult<(u64, Option<Vec<CheckServiceNode>>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES, CHECKS])?;
        let services = service_lookup(&tx, &mut ws, service)?;
        let results = self.join_check_service_nodes(&tx, &mut ws, services)?;
        Ok((idx, results))
    }

    /// [`StateStore::check_service_nodes`] filtered to instances with `tag`.
    pub fn check_service_tag_nodes(
        &self,
        ws: Option<&mut WatchSet>,
        service: &str,
        tag: &str,
    ) -> StateResult<(u64, Option<Vec<CheckServiceNode>>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES, CHECKS])?;
        let services: Vec<ServiceNode> = service_lookup(&tx, &mut ws, service)?
            .into_iter()
            .filter(|s| s.has_tag(tag))
            .collect();
        let results = self.join_check_service_nodes(&tx, &mut ws, services)?;
        Ok((idx, results))
    }

    fn join_check_service_nodes(
        &self,
        tx: &impl Reader,
        ws: &mut Option<&mut WatchSet>,
        services: Vec<ServiceNode>,
    ) -> StateResult<Option<Vec<CheckServiceNode>>> {
        if services.is_empty() {
            return Ok(None);
        }

        let limit = self.config.watch_limit;
        let mut results = Vec::with_capacity(services.len());
        for svc in services {
            let node = self.watched_node(tx, ws, &svc.node)?;

            // Node-level checks apply to every service on the node.
            let node_level = service_key(&svc.node, "");
            tx.watch_limited(
                ws,
                limit,
                WatchKey::exact(CHECKS, "node_service", node_level.clone()),
                WatchKey::table(CHECKS),
            );
            let mut checks: Vec<HealthCheck> = tx.lookup("node_service", &node_level)?;

            let own = service_key(&svc.node, &svc.service_id);
            tx.watch_limited(
                ws,
                limit,
                WatchKey::exact(CHECKS, "node_service", own.clone()),
                WatchKey::table(CHECKS),
            );
            checks.extend(tx.lookup::<HealthCheck>("node_service", &own)?);

            results.push(CheckServiceNode {
                node,
                service: svc.to_node_service(),
                checks,
            });
        }
        Ok(Some(results))
    }

    /// Everything registered against one node.
    pub fn node_info(
        &self,
        ws: Option<&mut WatchSet>,
        node: &str,
    ) -> StateResult<(u64, Vec<NodeInfo>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES, CHECKS])?;
        let key = node_key(node);
        tx.watch(&mut ws, WatchKey::exact(NODES, "id", key.clone()));
        let nodes: Vec<Node> = tx.first(&key)?.into_iter().collect();
        Ok((idx, parse_nodes(&tx, &mut ws, nodes)?))
    }

    /// Everything registered against every node.
    pub fn node_dump(&self, ws: Option<&mut WatchSet>) -> StateResult<(u64, Vec<NodeInfo>)> {
        let mut ws = ws;
        let tx = self.read()?;
        let idx = tx.max_index(&[NODES, SERVICES, CHECKS])?;
        tx.watch(&mut ws, WatchKey::table(NODES));
        tx.watch(&mut ws, WatchKey::table(SERVICES));
        tx.watch(&mut ws, WatchKey::table(CHECKS));
        let nodes: Vec<Node> = tx.all()?;
        Ok((idx, parse_nodes(&tx, &mut ws, nodes)?))
    }
}

fn nodes_by_meta_txn(
    tx: &impl Reader,
    ws: &mut Option<&mut WatchSet>,
    filters: &Meta,
) -> StateResult<Vec<Node>> {
    // Narrow with the index using one pair, then check the rest.
    let Some((k, v)) = filters.iter().next() else {
        tx.watch(ws, WatchKey::table(NODES));
        return tx.all();
    };
    let value = format!("{k}\0{v}");
    tx.watch(ws, WatchKey::exact(NODES, "meta", value.clone()));
    let nodes: Vec<Node> = tx.lookup("meta", &value)?;
    Ok(nodes.into_iter().filter(|n| n.matches_meta(filters)).collect())
}

fn service_lookup(
    tx: &impl Reader,
    ws: &mut Option<&mut WatchSet>,
    service: &str,
) -> StateResult<Vec<ServiceNode>> {
    let name = service.to_lowercase();
    tx.watch(ws, WatchKey::exact(SERVICES, "service", name.clone()));
    tx.lookup("service", &name)
}

fn checks_in_state_txn(
    tx: &impl Reader,
    ws: &mut Option<&mut WatchSet>,
    state: Option<HealthStatus>,
) -> StateResult<Vec<HealthCheck>> {
    match state {
        None => {
            tx.watch(ws, WatchKey::table(CHECKS));
            tx.all()
        }
        Some(status) => {
            tx.watch(ws, WatchKey::exact(CHECKS, "status", status.as_str()));
            tx.lookup("status", status.as_str())
        }
    }
}

fn parse_nodes(
    tx: &impl Reader,
    ws: &mut Option<&mut WatchSet>,
    nodes: Vec<Node>,
) -> StateResult<Vec<NodeInfo>> {
    let mut dump = Vec::with_capacity(nodes.len());
    for node in nodes {
        let key = node_key(&node.node);
        tx.watch(ws, WatchKey::exact(SERVICES, "node", key.clone()));
        let services: Vec<ServiceNode> = tx.lookup("node", &key)?;
        tx.watch(ws, WatchKey::exact(CHECKS, "node", key.clone()));
        let checks: Vec<HealthCheck> = tx.lookup("node", &key)?;

        dump.push(NodeInfo {
            id: node.id,
            node: node.node,
            address: node.address,
            tagged_addresses: node.tagged_addresses,
            meta: node.meta,
            services: services.iter().map(ServiceNode::to_node_service).collect(),
            checks,
        });
    }
    Ok(dump)
}
