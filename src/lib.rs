//! `synctree-core`: a hierarchical, query-aware realtime sync engine with a
//! durable, LRU-pruned local cache.
//!
//! The core mutation path (`SyncTree`/`SyncPoint`/`View`) is synchronous and
//! single-threaded; durability is layered underneath it through the
//! [`persistence`] module, which is the only place this crate talks to
//! `tokio` or does actual I/O.

pub mod change;
pub mod error;
pub mod filter;
pub mod node;
pub mod operation;
pub mod path;
pub mod persistence;
pub mod query;
pub mod storage;
pub mod sync_point;
pub mod sync_tree;
pub mod view;
pub mod write_tree;

pub use error::{Error, Result};
pub use node::Node;
pub use path::Path;
pub use query::Query;
pub use sync_tree::{SyncTree, TreePersistence};
