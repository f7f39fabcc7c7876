//! Restart-recovery and LRU-eviction scenarios for `PersistenceManager`,
//! driven through its public surface plus direct reads of the underlying
//! `StorageAdapter` (standing in for "what a fresh process would see").

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use synctree_core::node::Node;
use synctree_core::path::Path;
use synctree_core::persistence::{CachePolicy, PersistenceManager};
use synctree_core::query::Query;
use synctree_core::storage::{MemoryStorageAdapter, StorageAdapter};
use synctree_core::sync_tree::TreePersistence;

async fn settle() {
    // Persistence effects are fire-and-forget `tokio::spawn` tasks; give them
    // a tick to run before inspecting durable state.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn restart_recovers_user_writes_and_deactivates_stale_queries() {
    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorageAdapter::new());

    {
        let pm = PersistenceManager::new(adapter.clone()).await.unwrap();
        let query = Query::default_at_path(Path::from_string("/a"));
        pm.mark_query_active(&query);
        pm.save_user_overwrite(&Path::from_string("/a"), &Node::leaf(json!(1)), 1);
        settle().await;
    }

    let pm = PersistenceManager::new(adapter).await.unwrap();
    let writes = pm.get_user_writes().await.unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].write_id, 1);

    // The query left active by the previous "process" must come back inactive.
    let (_, complete) = pm.get_server_cache(&Query::default_at_path(Path::from_string("/a"))).await;
    assert!(!complete);
}

#[tokio::test]
async fn aggressive_policy_prunes_inactive_tracked_queries_on_server_update() {
    struct AlwaysPruneAboveTwo;
    impl CachePolicy for AlwaysPruneAboveTwo {
        fn percent_queries_prune_at_once(&self) -> f64 {
            1.0
        }
        fn max_prunable_queries_to_keep(&self) -> usize {
            0
        }
        fn should_prune(&self, _cache_size: f64, num_tracked: usize) -> bool {
            num_tracked > 2
        }
        fn should_check_size(&self, _num_server_updates: u64) -> bool {
            true
        }
    }

    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorageAdapter::new());
    let pm = PersistenceManager::with_cache_policy(adapter.clone(), Arc::new(AlwaysPruneAboveTwo)).await.unwrap();

    for i in 0..5 {
        let query = Query::default_at_path(Path::from_string(&format!("/q{i}")));
        pm.mark_query_active(&query);
        pm.mark_query_inactive(&query);
    }
    settle().await;
    let before = adapter.keys("query", Some("query/")).await.unwrap();
    assert_eq!(before.len(), 5);

    pm.apply_server_overwrite(&Node::leaf(json!(1)), &Query::default_at_path(Path::from_string("/trigger")));
    settle().await;

    let after = adapter.keys("query", Some("query/")).await.unwrap();
    assert!(after.len() < before.len(), "inactive tracked queries should have been pruned");
}

#[tokio::test]
async fn active_query_survives_aggressive_pruning() {
    struct AlwaysPrune;
    impl CachePolicy for AlwaysPrune {
        fn percent_queries_prune_at_once(&self) -> f64 {
            1.0
        }
        fn max_prunable_queries_to_keep(&self) -> usize {
            0
        }
        fn should_prune(&self, _cache_size: f64, _num_tracked: usize) -> bool {
            true
        }
        fn should_check_size(&self, _num_server_updates: u64) -> bool {
            true
        }
    }

    let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorageAdapter::new());
    let pm = PersistenceManager::with_cache_policy(adapter.clone(), Arc::new(AlwaysPrune)).await.unwrap();

    let kept = Query::default_at_path(Path::from_string("/kept"));
    pm.mark_query_active(&kept);
    let dropped = Query::default_at_path(Path::from_string("/dropped"));
    pm.mark_query_active(&dropped);
    pm.mark_query_inactive(&dropped);
    settle().await;

    pm.apply_server_overwrite(&Node::leaf(json!(1)), &Query::default_at_path(Path::from_string("/trigger")));
    settle().await;

    let entries = adapter.get_all("query", Some("query/")).await.unwrap();
    let paths: Vec<String> = entries
        .iter()
        .map(|(_, v)| serde_json::from_str::<serde_json::Value>(v).unwrap()["path"].as_str().unwrap().to_string())
        .collect();
    assert!(paths.iter().any(|p| p == "/kept"), "the active query must survive pruning");
    assert!(!paths.iter().any(|p| p == "/dropped"), "the inactive query must be evicted");
}
