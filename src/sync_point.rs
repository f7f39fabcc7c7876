//! `SyncPoint`: the set of `View`s tracking one path.

use std::collections::HashMap;

use crate::change::{CancelError, Event, EventRegistration};
use crate::node::Node;
use crate::operation::Operation;
use crate::path::Path;
use crate::query::Query;
use crate::view::{CacheNode, View, ViewCache};
use crate::write_tree::WriteTreeRef;

/// Callback surface `SyncPoint` uses to keep the durable tracked-query
/// bookkeeping in sync with filtered-view membership, without owning a
/// `PersistenceManager` itself (see the "no cyclic ownership" design note).
pub trait TrackedKeyObserver: Send + Sync {
    fn set_tracked_query_keys(&self, query: &Query, keys: Vec<String>);
    fn update_tracked_query_keys(&self, query: &Query, added: Vec<String>, removed: Vec<String>);
}

pub struct RemovalResult {
    /// Queries whose last view was just torn down: filtered queries in here
    /// need their backend listen stopped; a trailing default query means the
    /// sync point's last complete view went away and coverage may need
    /// re-establishing at descendants.
    pub removed: Vec<Query>,
    pub events: Vec<Event>,
}

pub struct SyncPoint {
    path: Path,
    views: HashMap<String, View>,
}

impl SyncPoint {
    pub fn new(path: Path) -> Self {
        SyncPoint {
            path,
            views: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Whether any view here has a fully initialized server cache — i.e. can
    /// actually answer for this whole path, regardless of whether its query
    /// shape is filtered. A filtered/tagged view counts once its own root is
    /// known, not only via a separate `ListenComplete`.
    pub fn has_complete_view(&self) -> bool {
        self.views.values().any(|v| v.view_cache().server_cache.fully_initialized)
    }

    pub fn get_complete_view(&self) -> Option<&View> {
        self.views.values().find(|v| v.view_cache().server_cache.fully_initialized)
    }

    pub fn view_for_query(&self, query: &Query) -> Option<&View> {
        self.views.get(&query.query_identifier())
    }

    pub fn view_exists_for_query(&self, query: &Query) -> bool {
        self.views.contains_key(&query.query_identifier())
    }

    /// Filtered (non-default) views only.
    pub fn query_views(&self) -> Vec<&View> {
        self.views.values().filter(|v| v.query().is_filtered()).collect()
    }

    /// The deepest known-complete server cache at `rel_path`, if any view
    /// here has a fully initialized server cache.
    pub fn get_complete_server_cache(&self, rel_path: &Path) -> Option<Node> {
        self.views
            .values()
            .find(|v| v.view_cache().server_cache.fully_initialized)
            .map(|v| v.view_cache().server_cache.node.get_child(rel_path))
    }

    /// Fans `op` out to the view it targets (server-tagged) or to every view
    /// (user/untagged-server). Panics if a tagged operation names a query
    /// with no view here — that is an invariant violation (§7).
    pub fn apply_operation(
        &mut self,
        op: &Operation,
        writes: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Node>,
        observer: Option<&dyn TrackedKeyObserver>,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        match op.source().query_id() {
            Some(query_id) => {
                let view = self.views.get_mut(query_id).unwrap_or_else(|| {
                    panic!(
                        "invariant violated: tagged operation for query {query_id} at {} has no view",
                        self.path
                    )
                });
                let before = tracked_keys(view);
                events.extend(view.apply_operation(op, writes, opt_complete_server_cache));
                notify_observer(view, &before, observer);
            }
            None => {
                for view in self.views.values_mut() {
                    let before = tracked_keys(view);
                    events.extend(view.apply_operation(op, writes, opt_complete_server_cache));
                    notify_observer(view, &before, observer);
                }
            }
        }
        events
    }

    /// Attaches `registration` to the (possibly newly created) view for
    /// `query`, returning the initial event sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn add_event_registration(
        &mut self,
        query: &Query,
        registration: EventRegistration,
        writes: &WriteTreeRef<'_>,
        server_cache: Option<Node>,
        server_cache_complete: bool,
        observer: Option<&dyn TrackedKeyObserver>,
    ) -> Vec<Event> {
        let query_id = query.query_identifier();
        if !self.views.contains_key(&query_id) {
            let server_node = server_cache.clone().unwrap_or_else(Node::empty);
            let base = if server_cache_complete { server_cache } else { None };
            let (event_node, event_complete) = match writes.calc_complete_event_cache(base) {
                Some(n) => (n, true),
                None => (writes.calc_complete_event_children(server_node.clone()), false),
            };
            let filtered_event_node = crate::filter::apply(&event_node, &query.params);
            let server_cache_node = CacheNode::new(server_node, server_cache_complete, false);
            let event_cache_node = CacheNode::new(filtered_event_node, event_complete, query.is_filtered());
            let view = View::new(query.clone(), ViewCache::new(event_cache_node, server_cache_node));

            if query.is_filtered() {
                if let Some(obs) = observer {
                    let keys: Vec<String> = view
                        .view_cache()
                        .event_cache
                        .node
                        .children()
                        .map(|c| c.keys().cloned().collect())
                        .unwrap_or_default();
                    obs.set_tracked_query_keys(query, keys);
                }
            }
            self.views.insert(query_id.clone(), view);
        }

        let view = self.views.get_mut(&query_id).expect("just inserted or already present");
        view.add_event_registration(registration.clone());
        view.get_initial_events(&registration)
    }

    /// For a default `query`, scans every view (a default listener removal
    /// can affect any of them); for a filtered query, only its own view.
    pub fn remove_event_registration(
        &mut self,
        query: &Query,
        registration: Option<&EventRegistration>,
        cancel_error: Option<CancelError>,
    ) -> RemovalResult {
        let had_complete_before = self.has_complete_view();
        let candidate_ids: Vec<String> = if query.is_default() {
            self.views.keys().cloned().collect()
        } else {
            vec![query.query_identifier()]
        };

        let mut events = Vec::new();
        let mut removed = Vec::new();
        for qid in candidate_ids {
            if let Some(view) = self.views.get_mut(&qid) {
                events.extend(view.remove_event_registration(registration, cancel_error.clone()));
                if view.is_empty() {
                    let removed_query = view.query().clone();
                    self.views.remove(&qid);
                    if removed_query.is_filtered() {
                        removed.push(removed_query);
                    }
                }
            }
        }

        if had_complete_before && !self.has_complete_view() {
            removed.push(Query::default_at_path(self.path.clone()));
        }

        RemovalResult { removed, events }
    }
}

fn tracked_keys(view: &View) -> std::collections::BTreeSet<String> {
    if !view.query().is_filtered() {
        return Default::default();
    }
    view.view_cache()
        .event_cache
        .node
        .children()
        .map(|c| c.keys().cloned().collect())
        .unwrap_or_default()
}

fn notify_observer(view: &View, before: &std::collections::BTreeSet<String>, observer: Option<&dyn TrackedKeyObserver>) {
    if !view.query().is_filtered() {
        return;
    }
    let Some(observer) = observer else { return };
    let after = tracked_keys(view);
    let added: Vec<String> = after.difference(before).cloned().collect();
    let removed: Vec<String> = before.difference(&after).cloned().collect();
    if !added.is_empty() || !removed.is_empty() {
        observer.update_tracked_query_keys(view.query(), added, removed);
    }
}
