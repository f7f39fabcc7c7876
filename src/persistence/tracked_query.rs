//! `TrackedQuery`: the durable record of "we have (or are building) a local
//! copy of this query's data" (§3, §4.6).

use crate::path::Path;
use crate::query::Query;

/// A `loadsAllData` query is always normalized to the plain default query at
/// its path before being tracked — two queries that load everything are
/// interchangeable for caching purposes even if their parameters differ
/// (e.g. an unfiltered `orderByChild` vs. no ordering at all).
pub fn normalize(query: &Query) -> Query {
    if query.loads_all_data() {
        Query::default_at_path(query.path.clone())
    } else {
        query.clone()
    }
}

#[derive(Debug, Clone)]
pub struct TrackedQuery {
    pub id: u64,
    pub query: Query,
    /// Milliseconds since epoch, supplied by the caller (never read via
    /// `SystemTime::now()` inside this module so recovery logic stays
    /// testable with fixed clocks).
    pub last_use: i64,
    pub active: bool,
    pub complete: bool,
}

impl TrackedQuery {
    pub fn new(id: u64, query: Query, last_use: i64) -> Self {
        debug_assert!(
            query.is_default() || !query.loads_all_data(),
            "a non-default tracked query must never load all data (normalize first)"
        );
        TrackedQuery {
            id,
            query,
            last_use,
            active: false,
            complete: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.query.path
    }
}
