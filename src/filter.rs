//! Applies a query's index, bounds, and limit to a `Node`'s children.
//!
//! Keeps this logic out of `query.rs` (which only describes parameters) and
//! `view.rs` (which only diffs already-filtered caches).

use std::cmp::Ordering;

use serde_json::Value;

use crate::node::{Node, Priority};
use crate::path::Path;
use crate::query::{Index, Limit, QueryParams};

/// A rank used so values of different JSON types still compare (matches the
/// type ordering real-time-database-style indexes use: null < bool < number
/// < string < object).
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) | Value::Object(_) => 4,
    }
}

pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// The sortable value of `key`/`node` under `index`.
pub fn index_value(index: &Index, _key: &str, node: &Node) -> Value {
    match index {
        Index::Key => Value::Null, // key itself is the tiebreaker, not the primary sort value
        Index::Priority => match node.priority() {
            None => Value::Null,
            Some(Priority::Number(n)) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Some(Priority::Str(s)) => Value::String(s.clone()),
        },
        Index::Value => match node {
            Node::Leaf { value, .. } => value.clone(),
            Node::Children { .. } => Value::Null,
        },
        Index::Child(child_path) => {
            let child = node.get_child(&Path::from_string(child_path));
            match child {
                Node::Leaf { value, .. } => value,
                Node::Children { .. } => Value::Null,
            }
        }
    }
}

/// Ordering key: (index value, key) — key is always the tiebreaker, matching
/// the source's convention that every index is secondarily ordered by key.
fn sort_key<'a>(index: &Index, key: &'a str, node: &Node) -> (Value, &'a str) {
    (index_value(index, key, node), key)
}

fn cmp_sort_keys(a: &(Value, &str), b: &(Value, &str)) -> Ordering {
    cmp_values(&a.0, &b.0).then_with(|| a.1.cmp(b.1))
}

/// Returns child keys of `node` in the order `params.index` (default: `Key`)
/// would enumerate them in.
pub fn ordered_keys(node: &Node, params: &QueryParams) -> Vec<String> {
    let index = params.index.clone().unwrap_or(Index::Key);
    let Some(children) = node.children() else {
        return Vec::new();
    };
    if matches!(index, Index::Key) {
        return children.keys().cloned().collect();
    }
    let mut entries: Vec<(String, Value)> = children
        .iter()
        .map(|(k, v)| (k.clone(), index_value(&index, k, v)))
        .collect();
    entries.sort_by(|a, b| cmp_values(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
    entries.into_iter().map(|(k, _)| k).collect()
}

/// Applies index/start/end/limit filtering, returning a `Node` containing
/// only the selected children (unfiltered leaves/empties pass through
/// unchanged since they have no children to filter).
pub fn apply(node: &Node, params: &QueryParams) -> Node {
    if params.loads_all_data() {
        return node.clone();
    }
    let Some(children) = node.children() else {
        return node.clone();
    };
    let index = params.index.clone().unwrap_or(Index::Key);
    let mut entries: Vec<(String, Node, Value)> = children
        .iter()
        .map(|(k, v)| {
            let iv = index_value(&index, k, v);
            (k.clone(), v.clone(), iv)
        })
        .collect();
    entries.sort_by(|a, b| cmp_values(&a.2, &b.2).then_with(|| a.0.cmp(&b.0)));

    if let Some(start) = &params.start {
        entries.retain(|(k, _, iv)| {
            cmp_values(iv, &start.index_value)
                .then_with(|| k.as_str().cmp(start.name.as_deref().unwrap_or("")))
                != Ordering::Less
        });
    }
    if let Some(end) = &params.end {
        entries.retain(|(k, _, iv)| {
            cmp_values(iv, &end.index_value)
                .then_with(|| k.as_str().cmp(end.name.as_deref().unwrap_or("\u{10FFFF}")))
                != Ordering::Greater
        });
    }
    if let Some(limit) = params.limit {
        match limit {
            Limit::First(n) => entries.truncate(n),
            Limit::Last(n) => {
                if entries.len() > n {
                    entries.drain(0..entries.len() - n);
                }
            }
        }
    }

    let mut result = Node::empty();
    for (k, v, _) in entries {
        result = result.update_immediate_child(&k, v);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::IndexBound;
    use serde_json::json;

    fn sample() -> Node {
        Node::empty()
            .update_immediate_child("a", Node::leaf(json!(3)))
            .update_immediate_child("b", Node::leaf(json!(1)))
            .update_immediate_child("c", Node::leaf(json!(2)))
    }

    #[test]
    fn default_params_pass_through_unchanged() {
        let node = sample();
        assert_eq!(apply(&node, &QueryParams::none()), node);
    }

    #[test]
    fn limit_first_orders_by_value_index() {
        let node = sample();
        let params = QueryParams {
            index: Some(Index::Value),
            limit: Some(Limit::First(2)),
            ..Default::default()
        };
        let filtered = apply(&node, &params);
        assert_eq!(filtered.num_children(), 2);
        assert_eq!(filtered.get_immediate_child("b"), Node::leaf(json!(1)));
        assert_eq!(filtered.get_immediate_child("c"), Node::leaf(json!(2)));
        assert!(filtered.get_immediate_child("a").is_empty());
    }

    #[test]
    fn limit_last_keeps_tail_of_ordering() {
        let node = sample();
        let params = QueryParams {
            index: Some(Index::Value),
            limit: Some(Limit::Last(1)),
            ..Default::default()
        };
        let filtered = apply(&node, &params);
        assert_eq!(filtered.num_children(), 1);
        assert_eq!(filtered.get_immediate_child("a"), Node::leaf(json!(3)));
    }

    #[test]
    fn start_at_bound_filters_by_index_value() {
        let node = sample();
        let params = QueryParams {
            index: Some(Index::Value),
            start: Some(IndexBound {
                index_value: json!(2),
                name: None,
            }),
            ..Default::default()
        };
        let filtered = apply(&node, &params);
        assert_eq!(filtered.num_children(), 2);
        assert!(filtered.get_immediate_child("b").is_empty());
    }

    #[test]
    fn ordered_keys_respects_value_index() {
        let node = sample();
        let params = QueryParams {
            index: Some(Index::Value),
            ..Default::default()
        };
        assert_eq!(ordered_keys(&node, &params), vec!["b", "c", "a"]);
    }
}
