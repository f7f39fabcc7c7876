//! `View`: the cached, filtered projection of one query, and the diff-based
//! event emission described in §4.1.

use crate::change::{CancelError, Change, Event, EventRegistration};
use crate::filter;
use crate::node::Node;
use crate::operation::{Operation, OperationSource};
use crate::query::Query;
use crate::write_tree::WriteTreeRef;

use super::cache::{CacheNode, ViewCache};

pub struct View {
    query: Query,
    view_cache: ViewCache,
    event_registrations: Vec<EventRegistration>,
}

impl View {
    pub fn new(query: Query, view_cache: ViewCache) -> Self {
        View {
            query,
            view_cache,
            event_registrations: Vec::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn view_cache(&self) -> &ViewCache {
        &self.view_cache
    }

    pub fn is_empty(&self) -> bool {
        self.event_registrations.is_empty()
    }

    pub fn add_event_registration(&mut self, registration: EventRegistration) {
        self.event_registrations.push(registration);
    }

    /// Removes a specific registration, or all of them if `registration` is
    /// `None`. When `cancel_error` is given, emits one `Cancel` event per
    /// removed registration instead of silently dropping it.
    pub fn remove_event_registration(
        &mut self,
        registration: Option<&EventRegistration>,
        cancel_error: Option<CancelError>,
    ) -> Vec<Event> {
        let removed: Vec<EventRegistration> = match registration {
            Some(r) => {
                let mut removed = Vec::new();
                self.event_registrations.retain(|existing| {
                    if existing == r {
                        removed.push(existing.clone());
                        false
                    } else {
                        true
                    }
                });
                removed
            }
            None => std::mem::take(&mut self.event_registrations),
        };

        match cancel_error {
            None => Vec::new(),
            Some(err) => removed
                .into_iter()
                .map(|r| Event::Cancel {
                    registration: r,
                    query: self.query.clone(),
                    error: err.clone(),
                })
                .collect(),
        }
    }

    /// The synthetic initial event sequence for a newly added registration:
    /// one `ChildAdded` per currently-cached child (in query order) followed
    /// by a `Value`.
    pub fn get_initial_events(&self, registration: &EventRegistration) -> Vec<Event> {
        let node = &self.view_cache.event_cache.node;
        let mut events = Vec::new();
        for key in filter::ordered_keys(node, &self.query.params) {
            let child = node.get_immediate_child(&key);
            events.push(Event::Data {
                registration: registration.clone(),
                query: self.query.clone(),
                change: Change::ChildAdded { key, node: child },
            });
        }
        events.push(Event::Data {
            registration: registration.clone(),
            query: self.query.clone(),
            change: Change::Value { node: node.clone() },
        });
        events
    }

    /// Applies `op`, updating both caches, and returns the `Event`s to raise
    /// for every current registration.
    pub fn apply_operation(
        &mut self,
        op: &Operation,
        writes: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Node>,
    ) -> Vec<Event> {
        let new_server_cache = self.apply_to_server_cache(op, opt_complete_server_cache);
        let old_event_node = self.view_cache.event_cache.node.clone();
        let new_event_cache = Self::recompute_event_cache(&self.query, writes, &new_server_cache);

        let changes = Self::diff(
            &self.query,
            &old_event_node,
            &new_event_cache.node,
            new_event_cache.fully_initialized,
        );

        self.view_cache = ViewCache::new(new_event_cache, new_server_cache);

        self.events_for_changes(changes)
    }

    fn apply_to_server_cache(&self, op: &Operation, opt_complete_server_cache: Option<&Node>) -> CacheNode {
        let current = &self.view_cache.server_cache;
        match op {
            Operation::Overwrite { path, snap, .. } => {
                let node = if let Some(complete) = opt_complete_server_cache {
                    complete.clone()
                } else {
                    current.node.update_child(path, snap.clone())
                };
                // A root overwrite fully determines this view's subtree
                // regardless of whether the query is filtered — `filtered`
                // (not `fully_initialized`) is what marks a query-limited
                // result, so a tagged/limited view becomes complete here too.
                let fully_initialized = current.fully_initialized || path.is_empty();
                CacheNode::new(node, fully_initialized, current.filtered)
            }
            Operation::Merge { path, children, .. } => {
                let existing = current.node.get_child(path);
                let mut merged = existing;
                for (k, v) in children {
                    merged = merged.update_immediate_child(k, v.clone());
                }
                let node = current.node.update_child(path, merged);
                CacheNode::new(node, current.fully_initialized, current.filtered)
            }
            Operation::AckUserWrite { .. } => current.clone(),
            Operation::ListenComplete { .. } => CacheNode::new(current.node.clone(), true, current.filtered),
        }
    }

    fn recompute_event_cache(query: &Query, writes: &WriteTreeRef<'_>, server_cache: &CacheNode) -> CacheNode {
        let base = if server_cache.fully_initialized {
            Some(server_cache.node.clone())
        } else {
            None
        };
        let (node, fully_initialized) = match writes.calc_complete_event_cache(base) {
            Some(n) => (n, true),
            None => (
                writes.calc_complete_event_children(server_cache.node.clone()),
                false,
            ),
        };
        let filtered_node = filter::apply(&node, &query.params);
        CacheNode::new(filtered_node, fully_initialized, query.is_filtered())
    }

    fn diff(query: &Query, old: &Node, new: &Node, new_fully_initialized: bool) -> Vec<Change> {
        if old == new {
            return Vec::new();
        }
        let mut changes = Vec::new();
        let empty = std::collections::BTreeMap::new();
        let old_children = old.children().unwrap_or(&empty);
        let new_children = new.children().unwrap_or(&empty);

        for (key, old_child) in old_children {
            match new_children.get(key) {
                None => changes.push(Change::ChildRemoved {
                    key: key.clone(),
                    node: old_child.clone(),
                }),
                Some(new_child) if new_child != old_child => changes.push(Change::ChildChanged {
                    key: key.clone(),
                    node: new_child.clone(),
                    old_node: old_child.clone(),
                }),
                Some(_) => {}
            }
        }
        for (key, new_child) in new_children {
            if !old_children.contains_key(key) {
                changes.push(Change::ChildAdded {
                    key: key.clone(),
                    node: new_child.clone(),
                });
            }
        }

        // Children present (and value-equal) in both but whose relative
        // order changed under the query's index.
        let old_order = filter::ordered_keys(old, &query.params);
        let new_order = filter::ordered_keys(new, &query.params);
        let unchanged: Vec<&String> = new_order
            .iter()
            .filter(|k| old_children.contains_key(*k) && new_children.contains_key(*k) && old_children[*k] == new_children[*k])
            .collect();
        let old_rank: std::collections::HashMap<&str, usize> = old_order
            .iter()
            .enumerate()
            .map(|(i, k)| (k.as_str(), i))
            .collect();
        let mut last_rank: i64 = -1;
        for key in &unchanged {
            let rank = *old_rank.get(key.as_str()).unwrap_or(&0) as i64;
            if rank < last_rank {
                changes.push(Change::ChildMoved {
                    key: (*key).clone(),
                    node: new_children[key.as_str()].clone(),
                });
            } else {
                last_rank = rank;
            }
        }

        let mut sorted = crate::change::sort_changes(changes);

        // `old != new` already holds here (see the early return above), so a
        // Value fires whenever the query is allowed to show one — even for a
        // leaf/children transition at the root that produces no per-child
        // diff entries.
        let show_value = !query.is_filtered() || new_fully_initialized;
        if show_value {
            sorted.push(Change::Value { node: new.clone() });
        }
        sorted
    }

    fn events_for_changes(&self, changes: Vec<Change>) -> Vec<Event> {
        let mut events = Vec::with_capacity(changes.len() * self.event_registrations.len());
        for registration in &self.event_registrations {
            for change in &changes {
                events.push(Event::Data {
                    registration: registration.clone(),
                    query: self.query.clone(),
                    change: change.clone(),
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Path;
    use crate::query::QueryParams;
    use crate::write_tree::WriteTree;
    use serde_json::json;

    fn default_view(path: &str) -> View {
        View::new(Query::default_at_path(Path::from_string(path)), ViewCache::empty())
    }

    #[test]
    fn overwrite_then_registration_emits_child_added_and_value() {
        let mut view = default_view("/a");
        let write_tree = WriteTree::new();
        let writes = write_tree.child_writes(Path::from_string("/a"));
        let op = Operation::Overwrite {
            source: OperationSource::Server,
            path: Path::empty(),
            snap: Node::empty().update_immediate_child("b", Node::leaf(json!("x"))),
        };
        let events = view.apply_operation(&op, &writes, None);
        assert!(events.is_empty(), "no registrations yet, no events to emit");

        let reg = EventRegistration::new(1);
        view.add_event_registration(reg.clone());
        let initial = view.get_initial_events(&reg);
        assert_eq!(initial.len(), 2); // ChildAdded(b) + Value
    }

    #[test]
    fn merge_with_empty_children_emits_no_events() {
        let mut view = default_view("/a");
        view.add_event_registration(EventRegistration::new(1));
        let write_tree = WriteTree::new();
        let writes = write_tree.child_writes(Path::from_string("/a"));
        let op = Operation::Merge {
            source: OperationSource::Server,
            path: Path::empty(),
            children: Default::default(),
        };
        let events = view.apply_operation(&op, &writes, None);
        assert!(events.is_empty());
    }

    #[test]
    fn filtered_query_at_empty_parent_emits_value_with_empty_children_on_registration() {
        let query = Query::new(
            Path::from_string("/list"),
            QueryParams {
                limit: Some(crate::query::Limit::First(2)),
                ..Default::default()
            },
        );
        let view = View::new(query, ViewCache::empty());
        let reg = EventRegistration::new(1);
        let initial = view.get_initial_events(&reg);
        assert_eq!(initial.len(), 1);
        assert!(matches!(&initial[0], Event::Data { change: Change::Value { node }, .. } if node.is_empty()));
    }

    #[test]
    fn removing_with_cancel_error_emits_one_cancel_per_registration() {
        let mut view = default_view("/a");
        view.add_event_registration(EventRegistration::new(1));
        view.add_event_registration(EventRegistration::new(2));
        let events = view.remove_event_registration(None, Some(CancelError("listen failed".into())));
        assert_eq!(events.len(), 2);
        assert!(view.is_empty());
    }
}
