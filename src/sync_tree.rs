//! `SyncTree`: the central entry point tying `SyncPoint`s, the pending
//! `WriteTree`, and backend listen de-duplication together (§4.4).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::change::{CancelError, Event, EventRegistration};
use crate::node::Node;
use crate::operation::{Operation, OperationSource};
use crate::path::Path;
use crate::query::Query;
use crate::sync_point::{SyncPoint, TrackedKeyObserver};
use crate::write_tree::WriteTree;

/// Durable bookkeeping `SyncTree` calls out to. Implemented by
/// `persistence::PersistenceManager`; kept as a trait so this module never
/// depends on the persistence module's internals.
#[async_trait]
pub trait TreePersistence: Send + Sync {
    async fn get_server_cache(&self, query: &Query) -> (Node, bool);
    fn mark_query_active(&self, query: &Query);
    fn mark_query_inactive(&self, query: &Query);
    fn set_query_complete(&self, query: &Query);
    fn set_tracked_query_keys(&self, query: &Query, keys: Vec<String>);
    fn update_tracked_query_keys(&self, query: &Query, added: Vec<String>, removed: Vec<String>);
    fn save_user_overwrite(&self, path: &Path, node: &Node, write_id: u64);
    fn save_user_merge(&self, path: &Path, children: &BTreeMap<String, Node>, write_id: u64);
    fn remove_user_write(&self, write_id: u64);
    fn apply_user_write(&self, node: &Node, path: &Path);
    fn apply_user_merge(&self, children: &BTreeMap<String, Node>, path: &Path);
    fn apply_server_overwrite(&self, node: &Node, query: &Query);
    fn apply_server_merge(&self, children: &BTreeMap<String, Node>, path: &Path);
}

struct ObserverAdapter<'a>(&'a dyn TreePersistence);

impl<'a> TrackedKeyObserver for ObserverAdapter<'a> {
    fn set_tracked_query_keys(&self, query: &Query, keys: Vec<String>) {
        self.0.set_tracked_query_keys(query, keys);
    }

    fn update_tracked_query_keys(&self, query: &Query, added: Vec<String>, removed: Vec<String>) {
        self.0.update_tracked_query_keys(query, added, removed);
    }
}

/// Backend listen contract `SyncTree` drives to keep exactly one listener
/// open per un-shadowed query (§6, consumed side).
pub trait ListenProvider: Send + Sync {
    fn start_listening(&self, query: Query, tag: Option<u32>);
    fn stop_listening(&self, query: Query, tag: Option<u32>);
}

/// Promotes a non-default, unfiltered query (has an index but no
/// start/end/limit) to the plain default query at its path — for listening
/// purposes only, per the de-duplication invariant.
pub fn query_for_listening(query: &Query) -> Query {
    if !query.is_default() && query.loads_all_data() {
        Query::default_at_path(query.path.clone())
    } else {
        query.clone()
    }
}

pub struct SyncTree {
    sync_points: BTreeMap<Path, SyncPoint>,
    pending_writes: WriteTree,
    query_key_to_tag: BTreeMap<String, u32>,
    tag_to_query: BTreeMap<u32, Query>,
    next_tag: u32,
    next_write_id: u64,
    persistence: Option<Arc<dyn TreePersistence>>,
    listen_provider: Option<Arc<dyn ListenProvider>>,
}

impl SyncTree {
    pub fn new(persistence: Option<Arc<dyn TreePersistence>>, listen_provider: Option<Arc<dyn ListenProvider>>) -> Self {
        SyncTree {
            sync_points: BTreeMap::new(),
            pending_writes: WriteTree::new(),
            query_key_to_tag: BTreeMap::new(),
            tag_to_query: BTreeMap::new(),
            next_tag: 1,
            next_write_id: 1,
            persistence,
            listen_provider,
        }
    }

    /// Restores the write-id counter after replaying persisted user writes
    /// on startup (`max(persisted.id) + 1`).
    pub fn set_next_write_id(&mut self, next: u64) {
        self.next_write_id = next;
    }

    fn alloc_write_id(&mut self) -> u64 {
        let id = self.next_write_id;
        self.next_write_id += 1;
        id
    }

    fn assign_tag(&mut self, query: &Query) -> u32 {
        let key = query.query_key();
        if let Some(tag) = self.query_key_to_tag.get(&key) {
            return *tag;
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        self.query_key_to_tag.insert(key, tag);
        self.tag_to_query.insert(tag, query.clone());
        tag
    }

    fn deepest_complete_ancestor(&self, path: &Path) -> Option<(&Path, &SyncPoint)> {
        self.sync_points
            .iter()
            .filter(|(p, sp)| p.contains(path) && sp.has_complete_view())
            .max_by_key(|(p, _)| p.len())
    }

    /// Fans `op` out to every registered sync point whose path relates to
    /// `op`'s own path (ancestor, descendant, or equal); unrelated sync
    /// points are left untouched. `op`'s `path` field is treated as
    /// absolute, and narrowed one component at a time via
    /// `operation_for_child` to reach each sync point's own coordinate
    /// frame — this is what correctly handles both "a listener above the
    /// write" and "a listener below the write" with the same walk.
    fn apply_to_registered_sync_points(&mut self, op: &Operation) -> Vec<Event> {
        let mut events = Vec::new();
        let adapter = self.persistence.as_deref().map(ObserverAdapter);
        let observer = adapter.as_ref().map(|a| a as &dyn TrackedKeyObserver);
        let pending_writes = &self.pending_writes;
        for (sp_path, sync_point) in self.sync_points.iter_mut() {
            let mut current = Some(op.clone());
            for part in sp_path.parts() {
                current = match current {
                    Some(o) => o.operation_for_child(part),
                    None => break,
                };
            }
            if let Some(local_op) = current {
                let writes_cache = pending_writes.child_writes(sp_path.clone());
                events.extend(sync_point.apply_operation(&local_op, &writes_cache, None, observer));
            }
        }
        events
    }

    // -- user writes --------------------------------------------------

    pub fn apply_user_overwrite(&mut self, path: Path, snap: Node, visible: bool) -> (u64, Vec<Event>) {
        let write_id = self.alloc_write_id();
        self.pending_writes
            .add_overwrite(path.clone(), snap.clone(), write_id, visible)
            .expect("write ids are allocated monotonically by SyncTree");
        if let Some(p) = &self.persistence {
            p.save_user_overwrite(&path, &snap, write_id);
        }
        let events = if visible {
            let op = Operation::Overwrite {
                source: OperationSource::User,
                path,
                snap,
            };
            self.apply_to_registered_sync_points(&op)
        } else {
            Vec::new()
        };
        (write_id, events)
    }

    pub fn apply_user_merge(&mut self, path: Path, children: BTreeMap<String, Node>) -> (u64, Vec<Event>) {
        let write_id = self.alloc_write_id();
        self.pending_writes
            .add_merge(path.clone(), children.clone(), write_id)
            .expect("write ids are allocated monotonically by SyncTree");
        if let Some(p) = &self.persistence {
            p.save_user_merge(&path, &children, write_id);
        }
        let op = Operation::Merge {
            source: OperationSource::User,
            path,
            children,
        };
        (write_id, self.apply_to_registered_sync_points(&op))
    }

    /// Removes a pending write by id and, unless it was invisible, applies
    /// an `AckUserWrite` to re-settle any sync points it had affected.
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool) -> Vec<Event> {
        let Some(record) = self.pending_writes.get_write(write_id).cloned() else {
            return Vec::new();
        };
        let was_visible = self.pending_writes.remove_write(write_id);

        if let Some(p) = &self.persistence {
            if record.visible {
                p.remove_user_write(write_id);
            }
            if !revert {
                match &record.write {
                    crate::write_tree::WritePayload::Overwrite(node) => p.apply_user_write(node, &record.path),
                    crate::write_tree::WritePayload::Merge(children) => p.apply_user_merge(children, &record.path),
                }
            }
        }

        if !was_visible {
            return Vec::new();
        }

        let affected: BTreeMap<Path, bool> = match &record.write {
            crate::write_tree::WritePayload::Overwrite(_) => {
                let mut m = BTreeMap::new();
                m.insert(Path::empty(), true);
                m
            }
            crate::write_tree::WritePayload::Merge(children) => children
                .keys()
                .map(|k| (Path::from_parts(vec![k.clone()]), true))
                .collect(),
        };
        let op = Operation::AckUserWrite {
            source: OperationSource::User,
            path: record.path,
            affected,
            revert,
        };
        self.apply_to_registered_sync_points(&op)
    }

    // -- untagged server updates ---------------------------------------

    pub fn apply_server_overwrite(&mut self, path: Path, snap: Node) -> Vec<Event> {
        if let Some(p) = &self.persistence {
            p.apply_server_overwrite(&snap, &Query::default_at_path(path.clone()));
        }
        let op = Operation::Overwrite {
            source: OperationSource::Server,
            path,
            snap,
        };
        self.apply_to_registered_sync_points(&op)
    }

    pub fn apply_server_merge(&mut self, path: Path, children: BTreeMap<String, Node>) -> Vec<Event> {
        if let Some(p) = &self.persistence {
            p.apply_server_merge(&children, &path);
        }
        let op = Operation::Merge {
            source: OperationSource::Server,
            path,
            children,
        };
        self.apply_to_registered_sync_points(&op)
    }

    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<Event> {
        if let Some(p) = &self.persistence {
            p.set_query_complete(&Query::default_at_path(path.clone()));
        }
        let op = Operation::ListenComplete {
            source: OperationSource::Server,
            path,
        };
        self.apply_to_registered_sync_points(&op)
    }

    // -- tagged server updates ------------------------------------------

    fn resolve_tag(&self, tag: u32) -> Option<Query> {
        match self.tag_to_query.get(&tag) {
            Some(q) => Some(q.clone()),
            None => {
                tracing::debug!(tag, "tagged update for a forgotten query, dropping");
                None
            }
        }
    }

    pub fn apply_tagged_server_overwrite(&mut self, tag: u32, path: Path, snap: Node) -> Vec<Event> {
        let Some(query) = self.resolve_tag(tag) else {
            return Vec::new();
        };
        let relative = path.relative_to(&query.path).unwrap_or_else(Path::empty);
        if let Some(p) = &self.persistence {
            let persisted_query = if relative.is_empty() {
                query.clone()
            } else {
                Query::default_at_path(path.clone())
            };
            p.apply_server_overwrite(&snap, &persisted_query);
        }
        let op = Operation::Overwrite {
            source: OperationSource::ServerTagged(query.query_identifier()),
            path,
            snap,
        };
        self.apply_to_registered_sync_points(&op)
    }

    pub fn apply_tagged_server_merge(&mut self, tag: u32, path: Path, children: BTreeMap<String, Node>) -> Vec<Event> {
        let Some(query) = self.resolve_tag(tag) else {
            return Vec::new();
        };
        if let Some(p) = &self.persistence {
            p.apply_server_merge(&children, &path);
        }
        let op = Operation::Merge {
            source: OperationSource::ServerTagged(query.query_identifier()),
            path,
            children,
        };
        self.apply_to_registered_sync_points(&op)
    }

    pub fn apply_tagged_listen_complete(&mut self, tag: u32, path: Path) -> Vec<Event> {
        let Some(query) = self.resolve_tag(tag) else {
            return Vec::new();
        };
        if let Some(p) = &self.persistence {
            p.set_query_complete(&query);
        }
        let op = Operation::ListenComplete {
            source: OperationSource::ServerTagged(query.query_identifier()),
            path,
        };
        self.apply_to_registered_sync_points(&op)
    }

    // -- listen failure ---------------------------------------------------

    /// Tears down every registration on `query` with a cancel event each,
    /// mirroring a backend listen failure.
    pub fn remove_on_listen_failure(&mut self, query: &Query, reason: impl Into<String>) -> Vec<Event> {
        self.remove_event_registration(query, None, Some(CancelError(reason.into())))
    }

    // -- registrations -----------------------------------------------------

    pub async fn add_event_registration(&mut self, query: Query, registration: EventRegistration) -> Vec<Event> {
        let path = query.path.clone();

        let ancestor_path = self.deepest_complete_ancestor(&path).map(|(p, _)| p.clone());
        let ancestor_cache = ancestor_path.as_ref().and_then(|p| {
            let rel = path.relative_to(p).unwrap_or_default();
            self.sync_points.get(p).and_then(|sp| sp.get_complete_server_cache(&rel))
        });

        self.sync_points.entry(path.clone()).or_insert_with(|| SyncPoint::new(path.clone()));
        let view_existed = self.sync_points[&path].view_exists_for_query(&query);

        if let Some(p) = &self.persistence {
            p.mark_query_active(&query);
        }
        if !view_existed && query.is_filtered() {
            self.assign_tag(&query);
        }

        let (server_node, complete) = if let Some(node) = ancestor_cache {
            (node, true)
        } else if let Some(p) = &self.persistence {
            p.get_server_cache(&query).await
        } else {
            (Node::empty(), false)
        };

        let writes_cache = self.pending_writes.child_writes(path.clone());
        let adapter = self.persistence.as_deref().map(ObserverAdapter);
        let observer = adapter.as_ref().map(|a| a as &dyn TrackedKeyObserver);

        let sync_point = self.sync_points.get_mut(&path).expect("just inserted above");
        let events = sync_point.add_event_registration(&query, registration, &writes_cache, Some(server_node), complete, observer);

        if !view_existed && ancestor_path.is_none() {
            self.setup_listener(&query);
        }

        events
    }

    fn setup_listener(&self, query: &Query) {
        let Some(lp) = &self.listen_provider else { return };
        let tag = if query.is_filtered() {
            self.query_key_to_tag.get(&query.query_key()).copied()
        } else {
            None
        };
        lp.start_listening(query_for_listening(query), tag);

        if query.is_filtered() {
            return;
        }
        // A (possibly promoted-to-)default listener shadows every filtered
        // listener strictly beneath it; stop their backend listens (their
        // views and tags stay intact in case this default goes away again).
        for (p, sp) in &self.sync_points {
            if p == &query.path || !query.path.contains(p) {
                continue;
            }
            for view in sp.query_views() {
                let q = view.query();
                if let Some(t) = self.query_key_to_tag.get(&q.query_key()).copied() {
                    lp.stop_listening(query_for_listening(q), Some(t));
                }
            }
        }
    }

    fn subtree_distinct_queries(&self, path: &Path) -> Vec<Query> {
        let mut out = Vec::new();
        for (p, sp) in &self.sync_points {
            if !path.contains(p) {
                continue;
            }
            match sp.get_complete_view() {
                Some(view) => out.push(view.query().clone()),
                None => out.extend(sp.query_views().into_iter().map(|v| v.query().clone())),
            }
        }
        out
    }

    pub fn remove_event_registration(
        &mut self,
        query: &Query,
        registration: Option<&EventRegistration>,
        cancel_error: Option<CancelError>,
    ) -> Vec<Event> {
        let path = query.path.clone();
        let Some(sync_point) = self.sync_points.get_mut(&path) else {
            return Vec::new();
        };
        if !query.is_default() && !sync_point.view_exists_for_query(query) {
            return Vec::new();
        }

        let result = sync_point.remove_event_registration(query, registration, cancel_error.clone());
        if sync_point.is_empty() {
            self.sync_points.remove(&path);
        }

        for removed_query in &result.removed {
            if let Some(p) = &self.persistence {
                p.mark_query_inactive(removed_query);
            }
            if removed_query.is_filtered() {
                if let Some(tag) = self.query_key_to_tag.remove(&removed_query.query_key()) {
                    self.tag_to_query.remove(&tag);
                    if cancel_error.is_none() {
                        if let Some(lp) = &self.listen_provider {
                            lp.stop_listening(query_for_listening(removed_query), Some(tag));
                        }
                    }
                }
            }
        }

        let removing_default = result.removed.iter().any(|q| q.loads_all_data());
        if removing_default {
            let covered = self.deepest_complete_ancestor(&path).is_some();
            if !covered {
                let subtree_queries = self.subtree_distinct_queries(&path);
                if let Some(lp) = &self.listen_provider {
                    if subtree_queries.is_empty() {
                        if cancel_error.is_none() {
                            lp.stop_listening(query_for_listening(query), None);
                        }
                    } else {
                        for q in &subtree_queries {
                            let tag = self.query_key_to_tag.get(&q.query_key()).copied();
                            lp.start_listening(query_for_listening(q), tag);
                        }
                    }
                }
            }
        }

        result.events
    }

    pub fn calc_complete_event_cache(&self, path: &Path, exclude: &[u64]) -> Option<Node> {
        let base = self.deepest_complete_ancestor(path).and_then(|(p, sp)| {
            let rel = path.relative_to(p).unwrap_or_default();
            sp.get_complete_server_cache(&rel)
        });
        let writes = self.pending_writes.child_writes(path.clone());
        writes.calc_complete_event_cache_excluding(base, exclude)
    }

    pub fn is_empty(&self) -> bool {
        self.sync_points.is_empty() && self.pending_writes.is_empty()
    }
}
