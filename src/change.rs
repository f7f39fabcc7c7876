//! Change records emitted by `View::apply_operation`, and the per-registration
//! `Event`s derived from them.

use crate::node::Node;
use crate::query::Query;

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    ChildAdded {
        key: String,
        node: Node,
    },
    ChildRemoved {
        key: String,
        node: Node,
    },
    ChildChanged {
        key: String,
        node: Node,
        old_node: Node,
    },
    /// A child's position changed relative to the query's ordering (it kept
    /// the same value but moved due to a sibling's insertion/removal).
    ChildMoved {
        key: String,
        node: Node,
    },
    Value {
        node: Node,
    },
}

impl Change {
    /// Emission order within a single diff: removed, then added, then
    /// moved, then changed, with `Value` always last.
    fn order_rank(&self) -> u8 {
        match self {
            Change::ChildRemoved { .. } => 0,
            Change::ChildAdded { .. } => 1,
            Change::ChildMoved { .. } => 2,
            Change::ChildChanged { .. } => 3,
            Change::Value { .. } => 4,
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Change::ChildAdded { key, .. }
            | Change::ChildRemoved { key, .. }
            | Change::ChildChanged { key, .. }
            | Change::ChildMoved { key, .. } => Some(key),
            Change::Value { .. } => None,
        }
    }
}

/// Sorts a batch of changes into the canonical emission order, stable
/// within each rank (insertion order preserved).
pub fn sort_changes(mut changes: Vec<Change>) -> Vec<Change> {
    changes.sort_by_key(|c| c.order_rank());
    changes
}

/// A listener's registration at a view. Opaque beyond an id the caller
/// chooses; `SyncTree`/`View` never interpret it, only compare and forward
/// it as the key of emitted `Event`s.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventRegistration {
    pub id: u64,
}

impl EventRegistration {
    pub fn new(id: u64) -> Self {
        EventRegistration { id }
    }
}

/// A cancellation reason passed to `View::remove_event_registration` /
/// `SyncTree::remove_event_registration` when tearing down registrations
/// because of a listen failure.
#[derive(Debug, Clone)]
pub struct CancelError(pub String);

/// An event delivered to one registration: either a data `Change` for its
/// query, or a `Cancel` when the registration was torn down due to a listen
/// failure.
#[derive(Debug, Clone)]
pub enum Event {
    Data {
        registration: EventRegistration,
        query: Query,
        change: Change,
    },
    Cancel {
        registration: EventRegistration,
        query: Query,
        error: CancelError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sort_changes_orders_removed_added_moved_changed_value() {
        let changes = vec![
            Change::Value { node: Node::empty() },
            Change::ChildChanged {
                key: "a".into(),
                node: Node::leaf(json!(1)),
                old_node: Node::leaf(json!(0)),
            },
            Change::ChildAdded {
                key: "b".into(),
                node: Node::leaf(json!(2)),
            },
            Change::ChildRemoved {
                key: "c".into(),
                node: Node::leaf(json!(3)),
            },
            Change::ChildMoved {
                key: "a".into(),
                node: Node::leaf(json!(1)),
            },
        ];
        let sorted = sort_changes(changes);
        let ranks: Vec<u8> = sorted.iter().map(|c| c.order_rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    }
}
