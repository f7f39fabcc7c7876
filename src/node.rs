//! Persistent JSON tree: the engine's in-memory representation of both
//! server snapshots and user-write overlays.
//!
//! A `Node` is either a `Leaf` (a JSON scalar with an optional priority) or
//! `Children` (a sorted map from child key to `Node`). All mutating
//! operations return a new `Node`; nothing is mutated in place, so a `Node`
//! can be cheaply shared across `CacheNode`s via `Arc`-backed `BTreeMap`
//! cloning.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// Priority attached to a leaf or to the root of a children node, used by
/// priority-ordered queries. `None` sorts before any priority.
#[derive(Debug, Clone, PartialEq)]
pub enum Priority {
    Number(f64),
    Str(String),
}

#[derive(Clone, PartialEq)]
pub enum Node {
    Leaf {
        value: Value,
        priority: Option<Priority>,
    },
    Children {
        children: BTreeMap<String, Node>,
        priority: Option<Priority>,
    },
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.export_json())
    }
}

impl Node {
    pub fn empty() -> Self {
        Node::Children {
            children: BTreeMap::new(),
            priority: None,
        }
    }

    pub fn leaf(value: Value) -> Self {
        Node::Leaf {
            value,
            priority: None,
        }
    }

    pub fn leaf_with_priority(value: Value, priority: Priority) -> Self {
        Node::Leaf {
            value,
            priority: Some(priority),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Children { children, .. } if children.is_empty())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn priority(&self) -> Option<&Priority> {
        match self {
            Node::Leaf { priority, .. } => priority.as_ref(),
            Node::Children { priority, .. } => priority.as_ref(),
        }
    }

    pub fn num_children(&self) -> usize {
        match self {
            Node::Leaf { .. } => 0,
            Node::Children { children, .. } => children.len(),
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Children { children, .. } => Some(children),
            Node::Leaf { .. } => None,
        }
    }

    pub fn get_immediate_child(&self, key: &str) -> Node {
        match self {
            Node::Children { children, .. } => children.get(key).cloned().unwrap_or_else(Node::empty),
            Node::Leaf { .. } => Node::empty(),
        }
    }

    /// Returns a new node with `key` replaced by `value`. Setting an empty
    /// node at `key` removes that child (matches the source's "empty node
    /// is absence" convention). Setting a child under a leaf discards the
    /// leaf's own value — children always win over a stale leaf value.
    pub fn update_immediate_child(&self, key: &str, value: Node) -> Node {
        let mut children = match self {
            Node::Children { children, .. } => children.clone(),
            Node::Leaf { .. } => BTreeMap::new(),
        };
        let priority = self.priority().cloned();
        if value.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.to_string(), value);
        }
        Node::Children { children, priority }
    }

    pub fn update_priority(&self, priority: Option<Priority>) -> Node {
        match self {
            Node::Leaf { value, .. } => Node::Leaf {
                value: value.clone(),
                priority,
            },
            Node::Children { children, .. } => Node::Children {
                children: children.clone(),
                priority,
            },
        }
    }

    /// A deterministic content hash used to revalidate listens against the
    /// server. Not a cryptographic hash — just stable across process
    /// restarts for the same logical content.
    pub fn hash(&self) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash_into(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    fn hash_into<H: std::hash::Hasher>(&self, hasher: &mut H) {
        use std::hash::Hash;
        match self {
            Node::Leaf { value, priority } => {
                0u8.hash(hasher);
                value.to_string().hash(hasher);
                priority_repr(priority).hash(hasher);
            }
            Node::Children { children, priority } => {
                1u8.hash(hasher);
                priority_repr(priority).hash(hasher);
                for (k, v) in children {
                    k.hash(hasher);
                    v.hash_into(hasher);
                }
            }
        }
    }

    /// Exports to a plain `serde_json::Value`, dropping priority
    /// information (priorities never round-trip through the public JSON
    /// view; they only affect ordering).
    pub fn export_json(&self) -> Value {
        match self {
            Node::Leaf { value, .. } => value.clone(),
            Node::Children { children, .. } => {
                let mut map = serde_json::Map::new();
                for (k, v) in children {
                    map.insert(k.clone(), v.export_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Builds a `Node` from a plain `serde_json::Value` (no priorities).
    pub fn from_json(value: &Value) -> Node {
        match value {
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (k, v) in map {
                    let child = Node::from_json(v);
                    if !child.is_empty() {
                        children.insert(k.clone(), child);
                    }
                }
                Node::Children {
                    children,
                    priority: None,
                }
            }
            Value::Null => Node::empty(),
            other => Node::leaf(other.clone()),
        }
    }

    /// Navigates to an arbitrary descendant path, returning `empty()` if any
    /// component is missing.
    pub fn get_child(&self, path: &crate::path::Path) -> Node {
        let mut current = self.clone();
        for part in path.parts() {
            current = current.get_immediate_child(part);
        }
        current
    }

    /// Returns a new node with `value` spliced in at `path`, creating
    /// intermediate `Children` nodes as needed.
    pub fn update_child(&self, path: &crate::path::Path, value: Node) -> Node {
        match path.front() {
            None => value,
            Some(front) => {
                let child = self.get_immediate_child(front);
                let updated_child = child.update_child(&path.pop_front(), value);
                self.update_immediate_child(front, updated_child)
            }
        }
    }

    /// Merges `other`'s children into `self`, recursively, used for
    /// partial/merge operations. Leaves in `other` overwrite `self` at the
    /// same key entirely.
    pub fn merge(&self, other: &Node) -> Node {
        if other.is_leaf() {
            return other.clone();
        }
        let mut result = self.clone();
        if let Some(other_children) = other.children() {
            for (k, v) in other_children {
                if v.is_empty() {
                    result = result.update_immediate_child(k, Node::empty());
                } else {
                    result = result.update_immediate_child(k, v.clone());
                }
            }
        }
        result
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::empty()
    }
}

fn priority_repr(priority: &Option<Priority>) -> String {
    match priority {
        None => "∅".to_string(),
        Some(Priority::Number(n)) => format!("n:{n}"),
        Some(Priority::Str(s)) => format!("s:{s}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_node_has_no_children() {
        let n = Node::empty();
        assert!(n.is_empty());
        assert_eq!(n.num_children(), 0);
    }

    #[test]
    fn update_immediate_child_adds_and_removes() {
        let n = Node::empty().update_immediate_child("a", Node::leaf(json!(1)));
        assert_eq!(n.num_children(), 1);
        let n = n.update_immediate_child("a", Node::empty());
        assert!(n.is_empty());
    }

    #[test]
    fn from_json_round_trips_export() {
        let value = json!({"a": 1, "b": {"c": "x"}});
        let node = Node::from_json(&value);
        assert_eq!(node.export_json(), value);
    }

    #[test]
    fn from_json_drops_null_children() {
        let value = json!({"a": 1, "b": null});
        let node = Node::from_json(&value);
        assert_eq!(node.export_json(), json!({"a": 1}));
    }

    #[test]
    fn hash_is_stable_and_order_independent_of_insertion() {
        let a = Node::empty()
            .update_immediate_child("a", Node::leaf(json!(1)))
            .update_immediate_child("b", Node::leaf(json!(2)));
        let b = Node::empty()
            .update_immediate_child("b", Node::leaf(json!(2)))
            .update_immediate_child("a", Node::leaf(json!(1)));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_differs_for_different_content() {
        let a = Node::leaf(json!(1));
        let b = Node::leaf(json!(2));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn update_child_splices_in_nested_path() {
        let base = Node::empty();
        let updated = base.update_child(&crate::path::Path::from_string("/a/b"), Node::leaf(json!(1)));
        assert_eq!(updated.get_child(&crate::path::Path::from_string("/a/b")), Node::leaf(json!(1)));
        assert!(updated.get_child(&crate::path::Path::from_string("/a/c")).is_empty());
    }

    #[test]
    fn merge_overwrites_named_children_only() {
        let base = Node::empty()
            .update_immediate_child("a", Node::leaf(json!(1)))
            .update_immediate_child("b", Node::leaf(json!(2)));
        let patch = Node::empty().update_immediate_child("b", Node::leaf(json!(99)));
        let merged = base.merge(&patch);
        assert_eq!(merged.get_immediate_child("a"), Node::leaf(json!(1)));
        assert_eq!(merged.get_immediate_child("b"), Node::leaf(json!(99)));
    }
}
