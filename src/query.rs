//! Queries: a path plus optional ordering/filter parameters.

use std::fmt;

use serde_json::Value;

use crate::path::Path;

/// The index a query orders and filters by.
#[derive(Debug, Clone, PartialEq)]
pub enum Index {
    Key,
    Priority,
    Value,
    /// Order by the value of a named child path (`orderByChild`).
    Child(String),
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Key => write!(f, ".key"),
            Index::Priority => write!(f, ".priority"),
            Index::Value => write!(f, ".value"),
            Index::Child(path) => write!(f, "{path}"),
        }
    }
}

/// Limit direction: first N (from the start of the index) or last N (from
/// the end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    First(usize),
    Last(usize),
}

/// An inclusive/exclusive bound over the query's index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBound {
    pub index_value: Value,
    pub name: Option<String>,
}

/// Filter/order/limit parameters of a query. `None` across the board means
/// "no parameters" (`QueryParams::none().is_default()` is true).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    pub index: Option<Index>,
    pub start: Option<IndexBound>,
    pub end: Option<IndexBound>,
    pub limit: Option<Limit>,
}

impl QueryParams {
    pub fn none() -> Self {
        QueryParams::default()
    }

    pub fn is_default(&self) -> bool {
        self == &QueryParams::default()
    }

    /// True iff these parameters select the whole node at the query's path:
    /// no bounds and no limit. An index alone (`orderByChild` with no
    /// start/end/limit) still loads everything, it just changes iteration
    /// order.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    pub fn is_filtered(&self) -> bool {
        !self.loads_all_data()
    }

    fn limit_repr(&self) -> String {
        match self.limit {
            None => String::new(),
            Some(Limit::First(n)) => format!("l:{n}"),
            Some(Limit::Last(n)) => format!("r:{n}"),
        }
    }

    fn bound_repr(bound: &Option<IndexBound>) -> String {
        match bound {
            None => "-".to_string(),
            Some(b) => format!("{}:{}", b.index_value, b.name.as_deref().unwrap_or("")),
        }
    }

    /// Deterministic fingerprint of these parameters, used as the query
    /// identifier when parameters are present. Two `QueryParams` with equal
    /// fields always produce the same identifier.
    pub fn identifier(&self) -> String {
        let index = self
            .index
            .as_ref()
            .map(|i| i.to_string())
            .unwrap_or_default();
        format!(
            "ix:{}|s:{}|e:{}|{}",
            index,
            Self::bound_repr(&self.start),
            Self::bound_repr(&self.end),
            self.limit_repr()
        )
    }
}

/// The identifier reserved for queries with no parameters at all.
pub const DEFAULT_IDENTIFIER: &str = "default";

/// A `(path, parameters)` pair. Two queries with equal path and
/// `query_identifier()` are interchangeable for sync-point lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub path: Path,
    pub params: QueryParams,
}

impl Query {
    pub fn new(path: Path, params: QueryParams) -> Self {
        Query { path, params }
    }

    pub fn default_at_path(path: Path) -> Self {
        Query {
            path,
            params: QueryParams::none(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }

    pub fn is_filtered(&self) -> bool {
        self.params.is_filtered()
    }

    pub fn query_identifier(&self) -> String {
        if self.params.is_default() {
            DEFAULT_IDENTIFIER.to_string()
        } else {
            self.params.identifier()
        }
    }

    /// The key used to route tagged server updates and to de-duplicate
    /// listens: `path + "$" + identifier`.
    pub fn query_key(&self) -> String {
        format!("{}${}", self.path.to_path_string(), self.query_identifier())
    }

    /// A non-default query with no filter still "loads all data"; for
    /// listening purposes such a query is promoted to the plain default
    /// query at its path (see `SyncTree::query_for_listening`).
    pub fn at_child(&self, key: &str) -> Query {
        Query::default_at_path(self.path.child(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_query_has_reserved_identifier() {
        let q = Query::default_at_path(Path::from_string("/a"));
        assert_eq!(q.query_identifier(), DEFAULT_IDENTIFIER);
        assert!(q.loads_all_data());
        assert!(q.is_default());
    }

    #[test]
    fn filtered_query_is_not_default_but_may_load_all_data() {
        let unfiltered_order = Query::new(
            Path::from_string("/a"),
            QueryParams {
                index: Some(Index::Child("name".into())),
                ..Default::default()
            },
        );
        assert!(!unfiltered_order.is_default());
        assert!(unfiltered_order.loads_all_data());

        let limited = Query::new(
            Path::from_string("/a"),
            QueryParams {
                limit: Some(Limit::First(2)),
                ..Default::default()
            },
        );
        assert!(!limited.loads_all_data());
        assert!(limited.is_filtered());
    }

    #[test]
    fn identifier_is_deterministic_and_distinguishes_params() {
        let a = Query::new(
            Path::from_string("/a"),
            QueryParams {
                limit: Some(Limit::First(2)),
                ..Default::default()
            },
        );
        let b = Query::new(
            Path::from_string("/a"),
            QueryParams {
                limit: Some(Limit::First(2)),
                ..Default::default()
            },
        );
        let c = Query::new(
            Path::from_string("/a"),
            QueryParams {
                limit: Some(Limit::Last(2)),
                ..Default::default()
            },
        );
        assert_eq!(a.query_identifier(), b.query_identifier());
        assert_ne!(a.query_identifier(), c.query_identifier());
    }
}
