//! Durable persistence for the sync engine: tracked-query bookkeeping, the
//! server-cache and user-write stores, and the LRU pruning protocol that
//! ties them together (§4.5-§4.8).

mod cache_policy;
mod manager;
mod prune_forest;
mod server_cache_store;
mod tracked_query;
mod tracked_query_manager;
mod tracked_query_store;
mod user_write_store;

pub use cache_policy::{CachePolicy, LruCachePolicy};
pub use manager::PersistenceManager;
pub use prune_forest::{PruneForest, PruneMark, PrunePathError};
pub use server_cache_store::ServerCacheStore;
pub use tracked_query::TrackedQuery;
pub use tracked_query_manager::TrackedQueryManager;
pub use tracked_query_store::TrackedQueryStore;
pub use user_write_store::UserWriteStore;
