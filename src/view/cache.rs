//! `CacheNode` and `ViewCache`: the two snapshots a `View` keeps — one for
//! what the user sees (server data with pending writes layered on), one for
//! the authoritative remote snapshot.

use crate::node::Node;

/// A node plus metadata about how complete/limited it is.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNode {
    pub node: Node,
    /// Whether `node` is known to be the full value at this path (as
    /// opposed to a partial view built from whatever children happen to be
    /// known).
    pub fully_initialized: bool,
    /// Whether this node is the result of a query limit, i.e. it may not
    /// contain the full set of children even when `fully_initialized` is
    /// true for the *selected* subset.
    pub filtered: bool,
}

impl CacheNode {
    pub fn empty() -> Self {
        CacheNode {
            node: Node::empty(),
            fully_initialized: false,
            filtered: false,
        }
    }

    pub fn new(node: Node, fully_initialized: bool, filtered: bool) -> Self {
        CacheNode {
            node,
            fully_initialized,
            filtered,
        }
    }
}

/// The two caches a `View` maintains for one `(query, path)`.
#[derive(Debug, Clone)]
pub struct ViewCache {
    pub event_cache: CacheNode,
    pub server_cache: CacheNode,
}

impl ViewCache {
    pub fn new(event_cache: CacheNode, server_cache: CacheNode) -> Self {
        ViewCache {
            event_cache,
            server_cache,
        }
    }

    pub fn empty() -> Self {
        ViewCache {
            event_cache: CacheNode::empty(),
            server_cache: CacheNode::empty(),
        }
    }
}
