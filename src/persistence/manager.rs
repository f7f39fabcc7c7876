//! `PersistenceManager`: owns the three stores, the tracked-query index, and
//! the pruning protocol (§4.5).
//!
//! `SyncTree` only ever sees this type through the narrow `TreePersistence`
//! trait, so it never depends on this module directly (no cyclic ownership).
//! Most `TreePersistence` methods are synchronous by contract — durable
//! writes here are fire-and-forget `tokio::spawn` tasks over the in-memory
//! `TrackedQueryManager`'s `parking_lot::Mutex`, matching §5's "callers do
//! not await for event correctness".

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::node::Node;
use crate::path::Path;
use crate::query::Query;
use crate::storage::StorageAdapter;
use crate::sync_tree::TreePersistence;
use crate::write_tree::UserWriteRecord;

use super::cache_policy::{CachePolicy, LruCachePolicy};
use super::prune_forest::PruneForest;
use super::server_cache_store::ServerCacheStore;
use super::tracked_query_manager::TrackedQueryManager;
use super::tracked_query_store::TrackedQueryStore;
use super::user_write_store::UserWriteStore;
use crate::error::Result;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct PersistenceManager {
    server_cache_store: Arc<ServerCacheStore>,
    user_write_store: Arc<UserWriteStore>,
    tracked_query_store: Arc<TrackedQueryStore>,
    tracked_query_manager: Arc<Mutex<TrackedQueryManager>>,
    cache_policy: Arc<dyn CachePolicy>,
    server_updates_since_prune_check: Mutex<u64>,
}

impl PersistenceManager {
    /// Loads persisted tracked-query state and performs startup recovery
    /// (any record left `active` from an unclean shutdown is deactivated and
    /// its flip persisted before we return).
    pub async fn new(adapter: Arc<dyn StorageAdapter>) -> Result<Self> {
        Self::with_cache_policy(adapter, Arc::new(LruCachePolicy::default())).await
    }

    pub async fn with_cache_policy(adapter: Arc<dyn StorageAdapter>, cache_policy: Arc<dyn CachePolicy>) -> Result<Self> {
        let server_cache_store = Arc::new(ServerCacheStore::new(adapter.clone()));
        let user_write_store = Arc::new(UserWriteStore::new(adapter.clone()));
        let tracked_query_store = Arc::new(TrackedQueryStore::new(adapter));

        let (records, tracked_keys) = tracked_query_store.get_all().await?;
        let now = now_millis();
        for record in records.iter().filter(|r| r.active) {
            let mut flipped = record.clone();
            flipped.active = false;
            flipped.last_use = now;
            tracked_query_store.save(&flipped).await?;
        }
        let tracked_query_manager = Arc::new(Mutex::new(TrackedQueryManager::from_persisted(records, tracked_keys, now)));

        Ok(PersistenceManager {
            server_cache_store,
            user_write_store,
            tracked_query_store,
            tracked_query_manager,
            cache_policy,
            server_updates_since_prune_check: Mutex::new(0),
        })
    }

    pub async fn get_user_writes(&self) -> Result<Vec<UserWriteRecord>> {
        self.user_write_store.get_all().await
    }

    pub async fn close(&self) -> Result<()> {
        self.server_cache_store.close().await?;
        self.user_write_store.close().await?;
        self.tracked_query_store.close().await
    }

    fn spawn_store_write<F>(&self, context: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(err) = fut.await {
                tracing::warn!(context, error = %err, "persistence write failed");
            }
        });
    }

    fn persist_tracked_query(&self, query: &Query) {
        let manager = self.tracked_query_manager.clone();
        let store = self.tracked_query_store.clone();
        let query = query.clone();
        self.spawn_store_write("persist_tracked_query", async move {
            let snapshot = manager.lock().find(&query).cloned();
            if let Some(tq) = snapshot {
                store.save(&tq).await?;
            }
            Ok(())
        });
    }

    fn note_server_update(&self) {
        let mut counter = self.server_updates_since_prune_check.lock();
        *counter += 1;
        if self.cache_policy.should_check_size(*counter) {
            *counter = 0;
            drop(counter);
            self.prune_check();
        }
    }

    fn prune_check(&self) {
        let server_cache_store = self.server_cache_store.clone();
        let tracked_query_store = self.tracked_query_store.clone();
        let tracked_query_manager = self.tracked_query_manager.clone();
        let cache_policy = self.cache_policy.clone();
        self.spawn_store_write("prune_check", async move {
            recursive_prune_check(&server_cache_store, &tracked_query_store, &tracked_query_manager, cache_policy.as_ref()).await
        });
    }
}

fn recursive_prune_check<'a>(
    server_cache_store: &'a ServerCacheStore,
    tracked_query_store: &'a TrackedQueryStore,
    tracked_query_manager: &'a Mutex<TrackedQueryManager>,
    cache_policy: &'a dyn CachePolicy,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let size = server_cache_store.estimated_size().await?;
        let num_tracked = tracked_query_manager.lock().num_prunable_queries();
        if !cache_policy.should_prune(size, num_tracked) {
            return Ok(());
        }
        let (forest, removed_ids): (PruneForest, Vec<u64>) = tracked_query_manager.lock().prune_old(cache_policy);
        if forest.prunes_anything() {
            for id in removed_ids {
                tracked_query_store.remove(id).await?;
            }
            server_cache_store.prune_cache(&forest, &Path::empty()).await?;
            recursive_prune_check(server_cache_store, tracked_query_store, tracked_query_manager, cache_policy).await?;
        }
        Ok(())
    })
}

#[async_trait]
impl TreePersistence for PersistenceManager {
    async fn get_server_cache(&self, query: &Query) -> (Node, bool) {
        let complete = self.tracked_query_manager.lock().is_complete(query);
        if complete {
            if query.is_filtered() {
                let keys: Vec<String> = self
                    .tracked_query_manager
                    .lock()
                    .known_complete_children(&query.path)
                    .into_iter()
                    .collect();
                match self.server_cache_store.get_for_keys(&keys, &query.path).await {
                    Ok(node) => return (node, true),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed reading complete filtered server cache");
                        return (Node::empty(), false);
                    }
                }
            }
            return match self.server_cache_store.get_at_path(&query.path).await {
                Ok(node) => (node, true),
                Err(err) => {
                    tracing::warn!(error = %err, "failed reading complete server cache");
                    (Node::empty(), false)
                }
            };
        }

        let known_children: Vec<String> = self
            .tracked_query_manager
            .lock()
            .known_complete_children(&query.path)
            .into_iter()
            .collect();
        match self.server_cache_store.get_for_keys(&known_children, &query.path).await {
            Ok(node) => (node, false),
            Err(err) => {
                tracing::warn!(error = %err, "failed reading partial server cache");
                (Node::empty(), false)
            }
        }
    }

    fn mark_query_active(&self, query: &Query) {
        self.tracked_query_manager.lock().ensure_tracked(query, now_millis());
        self.tracked_query_manager.lock().set_active(query, now_millis());
        self.persist_tracked_query(query);
    }

    fn mark_query_inactive(&self, query: &Query) {
        self.tracked_query_manager.lock().set_inactive(query, now_millis());
        self.persist_tracked_query(query);
    }

    fn set_query_complete(&self, query: &Query) {
        self.tracked_query_manager.lock().set_complete(query);
        self.persist_tracked_query(query);
    }

    fn set_tracked_query_keys(&self, query: &Query, keys: Vec<String>) {
        let id = {
            let mut manager = self.tracked_query_manager.lock();
            manager.ensure_tracked(query, now_millis());
            manager.set_tracked_query_keys(query, keys);
            manager.find(query).map(|tq| tq.id)
        };
        let Some(id) = id else { return };
        let store = self.tracked_query_store.clone();
        let manager = self.tracked_query_manager.clone();
        let query = query.clone();
        self.spawn_store_write("set_tracked_query_keys", async move {
            let keys = manager.lock().known_complete_children(&query.path);
            store.set_tracked_keys(id, &keys).await
        });
    }

    fn update_tracked_query_keys(&self, query: &Query, added: Vec<String>, removed: Vec<String>) {
        self.tracked_query_manager.lock().update_tracked_query_keys(query, added, removed);
        let id = self.tracked_query_manager.lock().find(query).map(|tq| tq.id);
        let Some(id) = id else { return };
        let store = self.tracked_query_store.clone();
        let manager = self.tracked_query_manager.clone();
        let query = query.clone();
        self.spawn_store_write("update_tracked_query_keys", async move {
            let keys = manager.lock().known_complete_children(&query.path);
            store.set_tracked_keys(id, &keys).await
        });
    }

    fn save_user_overwrite(&self, path: &Path, node: &Node, write_id: u64) {
        let store = self.user_write_store.clone();
        let path = path.clone();
        let node = node.clone();
        self.spawn_store_write("save_user_overwrite", async move { store.save_overwrite(write_id, &path, &node).await });
    }

    fn save_user_merge(&self, path: &Path, children: &BTreeMap<String, Node>, write_id: u64) {
        let store = self.user_write_store.clone();
        let path = path.clone();
        let children = children.clone();
        self.spawn_store_write("save_user_merge", async move { store.save_merge(write_id, &path, &children).await });
    }

    fn remove_user_write(&self, write_id: u64) {
        let store = self.user_write_store.clone();
        self.spawn_store_write("remove_user_write", async move { store.remove(write_id).await });
    }

    fn apply_user_write(&self, node: &Node, path: &Path) {
        if !self.tracked_query_manager.lock().has_active_default(path) {
            return;
        }
        let store = self.server_cache_store.clone();
        let manager = self.tracked_query_manager.clone();
        let node = node.clone();
        let path = path.clone();
        manager.lock().ensure_complete(&path, now_millis());
        self.spawn_store_write("apply_user_write", async move { store.overwrite(&node, &path, false).await });
    }

    fn apply_user_merge(&self, children: &BTreeMap<String, Node>, path: &Path) {
        if !self.tracked_query_manager.lock().has_active_default(path) {
            return;
        }
        let store = self.server_cache_store.clone();
        let manager = self.tracked_query_manager.clone();
        let children = children.clone();
        let path = path.clone();
        manager.lock().ensure_complete(&path, now_millis());
        self.spawn_store_write("apply_user_merge", async move { store.merge(&children, &path).await });
    }

    fn apply_server_overwrite(&self, node: &Node, query: &Query) {
        self.tracked_query_manager.lock().ensure_tracked(query, now_millis());
        let store = self.server_cache_store.clone();
        let manager = self.tracked_query_manager.clone();
        let node = node.clone();
        let query = query.clone();
        let partial = !query.loads_all_data();
        self.spawn_store_write("apply_server_overwrite", async move {
            store.overwrite(&node, &query.path, partial).await?;
            manager.lock().set_complete(&query);
            Ok(())
        });
        self.note_server_update();
    }

    fn apply_server_merge(&self, children: &BTreeMap<String, Node>, path: &Path) {
        let store = self.server_cache_store.clone();
        let children = children.clone();
        let path = path.clone();
        self.spawn_store_write("apply_server_merge", async move { store.merge(&children, &path).await });
        self.note_server_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageAdapter;
    use serde_json::json;

    async fn manager() -> PersistenceManager {
        PersistenceManager::new(Arc::new(MemoryStorageAdapter::new())).await.unwrap()
    }

    #[tokio::test]
    async fn new_with_no_persisted_state_has_no_tracked_queries() {
        let pm = manager().await;
        assert_eq!(pm.tracked_query_manager.lock().num_prunable_queries(), 0);
    }

    #[tokio::test]
    async fn startup_recovery_deactivates_previously_active_query() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        {
            let store = TrackedQueryStore::new(adapter.clone());
            let mut tq = super::super::tracked_query::TrackedQuery::new(1, Query::default_at_path(Path::from_string("/a")), 0);
            tq.active = true;
            store.save(&tq).await.unwrap();
        }
        let pm = PersistenceManager::new(adapter).await.unwrap();
        let entry = pm
            .tracked_query_manager
            .lock()
            .find(&Query::default_at_path(Path::from_string("/a")))
            .cloned()
            .unwrap();
        assert!(!entry.active);
    }

    #[tokio::test]
    async fn get_server_cache_reads_persisted_complete_query() {
        let pm = manager().await;
        let path = Path::from_string("/a");
        pm.server_cache_store.overwrite(&Node::leaf(json!(1)), &path, false).await.unwrap();
        pm.tracked_query_manager.lock().ensure_complete(&path, 0);

        let (node, complete) = pm.get_server_cache(&Query::default_at_path(path)).await;
        assert!(complete);
        assert_eq!(node, Node::leaf(json!(1)));
    }

    #[tokio::test]
    async fn apply_user_write_only_touches_server_cache_with_active_default() {
        let pm = manager().await;
        let path = Path::from_string("/a");
        pm.apply_user_write(&Node::leaf(json!(1)), &path);
        tokio::task::yield_now().await;
        let read = pm.server_cache_store.get_at_path(&path).await.unwrap();
        assert!(read.is_empty(), "no active default tracked query yet, write should be dropped");

        pm.tracked_query_manager.lock().ensure_complete(&path, 0);
        pm.apply_user_write(&Node::leaf(json!(2)), &path);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let read = pm.server_cache_store.get_at_path(&path).await.unwrap();
        assert_eq!(read, Node::leaf(json!(2)));
    }
}
