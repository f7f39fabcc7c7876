//! `ServerCacheStore`: persisted server snapshot, one key per primitive
//! leaf (§3, §4.7).

use std::sync::Arc;

use crate::node::Node;
use crate::path::Path;

use super::prune_forest::PruneForest;
use crate::error::Result;
use crate::storage::{StorageAdapter, STORE_SERVER};

fn path_prefix(path: &Path) -> String {
    let s = path.to_path_string();
    if s == "/" {
        s
    } else {
        format!("{s}/")
    }
}

fn leaf_key(path: &Path) -> String {
    format!("{}/", path.to_path_string())
}

fn flatten(base: &Path, node: &Node, out: &mut Vec<(String, String)>) {
    match node.children() {
        None => {
            let value = serde_json::to_string(&node.export_json()).expect("Value serialization never fails");
            out.push((leaf_key(base), value));
        }
        Some(children) => {
            for (key, child) in children {
                flatten(&base.child(key), child, out);
            }
        }
    }
}

fn ancestors_inclusive(path: &Path) -> Vec<Path> {
    (0..=path.len()).map(|n| Path::from_parts(path.parts()[..n].to_vec())).collect()
}

pub struct ServerCacheStore {
    adapter: Arc<dyn StorageAdapter>,
}

impl ServerCacheStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        ServerCacheStore { adapter }
    }

    /// Writes `node` at `path`. `partial = true` only touches `node`'s
    /// immediate children (a merge-shaped write); `partial = false` replaces
    /// everything under `path`.
    pub async fn overwrite(&self, node: &Node, path: &Path, partial: bool) -> Result<()> {
        let mut batch = self.adapter.write_batch(STORE_SERVER);
        for ancestor in ancestors_inclusive(path) {
            batch.remove(&leaf_key(&ancestor));
        }
        if partial {
            if let Some(children) = node.children() {
                for (key, child) in children {
                    let child_path = path.child(key);
                    batch.remove_prefixed(&path_prefix(&child_path));
                    let mut entries = Vec::new();
                    flatten(&child_path, child, &mut entries);
                    for (k, v) in entries {
                        batch.set(&k, Some(v));
                    }
                }
            }
        } else {
            batch.remove_prefixed(&path_prefix(path));
            let mut entries = Vec::new();
            flatten(path, node, &mut entries);
            for (k, v) in entries {
                batch.set(&k, Some(v));
            }
        }
        batch.run().await
    }

    /// Like `overwrite` with `partial = true`, but only for the children
    /// named in `merge`.
    pub async fn merge(&self, merge: &std::collections::BTreeMap<String, Node>, path: &Path) -> Result<()> {
        let node = merge.iter().fold(Node::empty(), |acc, (k, v)| acc.update_immediate_child(k, v.clone()));
        self.overwrite(&node, path, true).await
    }

    pub async fn get_at_path(&self, path: &Path) -> Result<Node> {
        let prefix = path_prefix(path);
        let entries = self.adapter.get_all(STORE_SERVER, Some(&prefix)).await?;
        let mut node = Node::empty();
        for (key, value) in entries {
            let rel = key.strip_prefix(&prefix).unwrap_or(&key);
            let rel = rel.strip_suffix('/').unwrap_or(rel);
            let json: serde_json::Value = serde_json::from_str(&value)?;
            node = node.update_child(&Path::from_string(rel), Node::from_json(&json));
        }
        Ok(node)
    }

    /// Reads each named immediate child of `path` and assembles a children
    /// node from just those (used for incomplete-query reads, §4.5).
    pub async fn get_for_keys(&self, keys: &[String], path: &Path) -> Result<Node> {
        let mut node = Node::empty();
        for key in keys {
            let child = self.get_at_path(&path.child(key)).await?;
            node = node.update_immediate_child(key, child);
        }
        Ok(node)
    }

    pub async fn prune_cache(&self, forest: &PruneForest, path: &Path) -> Result<()> {
        let prefix = path_prefix(path);
        let keys = self.adapter.keys(STORE_SERVER, Some(&prefix)).await?;
        let mut batch = self.adapter.write_batch(STORE_SERVER);
        let mut any = false;
        for key in &keys {
            let rel = key.strip_prefix(&prefix).unwrap_or(key);
            let rel = rel.strip_suffix('/').unwrap_or(rel);
            let rel_path = path.child_path(&Path::from_string(rel));
            if forest.should_prune_unkept_descendants(&rel_path) {
                batch.remove(key);
                any = true;
            }
        }
        if any {
            batch.run().await?;
        }
        Ok(())
    }

    pub async fn estimated_size(&self) -> Result<f64> {
        self.adapter.estimated_size(STORE_SERVER).await
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close(STORE_SERVER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn overwrite_then_read_round_trips_nested_tree() {
        let store = ServerCacheStore::new(Arc::new(MemoryStorageAdapter::new()));
        let node = Node::empty()
            .update_immediate_child("a", Node::leaf(json!(1)))
            .update_immediate_child("b", Node::empty().update_immediate_child("c", Node::leaf(json!("x"))));
        store.overwrite(&node, &Path::from_string("/root"), false).await.unwrap();
        let read = store.get_at_path(&Path::from_string("/root")).await.unwrap();
        assert_eq!(read.export_json(), node.export_json());
    }

    #[tokio::test]
    async fn partial_overwrite_only_touches_named_children() {
        let store = ServerCacheStore::new(Arc::new(MemoryStorageAdapter::new()));
        let full = Node::empty()
            .update_immediate_child("a", Node::leaf(json!(1)))
            .update_immediate_child("b", Node::leaf(json!(2)));
        store.overwrite(&full, &Path::from_string("/root"), false).await.unwrap();

        let patch = Node::empty().update_immediate_child("b", Node::leaf(json!(99)));
        store.overwrite(&patch, &Path::from_string("/root"), true).await.unwrap();

        let read = store.get_at_path(&Path::from_string("/root")).await.unwrap();
        assert_eq!(read.get_immediate_child("a"), Node::leaf(json!(1)));
        assert_eq!(read.get_immediate_child("b"), Node::leaf(json!(99)));
    }

    #[tokio::test]
    async fn overwrite_clears_stale_leaf_at_ancestor() {
        let store = ServerCacheStore::new(Arc::new(MemoryStorageAdapter::new()));
        store.overwrite(&Node::leaf(json!(1)), &Path::from_string("/a"), false).await.unwrap();
        let deeper = Node::empty().update_immediate_child("b", Node::leaf(json!(2)));
        store.overwrite(&deeper, &Path::from_string("/a"), false).await.unwrap();
        let read = store.get_at_path(&Path::from_string("/a")).await.unwrap();
        assert!(!read.is_leaf());
        assert_eq!(read.get_immediate_child("b"), Node::leaf(json!(2)));
    }

    #[tokio::test]
    async fn prune_cache_removes_only_pruned_subtree() {
        let store = ServerCacheStore::new(Arc::new(MemoryStorageAdapter::new()));
        let node = Node::empty()
            .update_immediate_child("keep", Node::leaf(json!(1)))
            .update_immediate_child("gone", Node::leaf(json!(2)));
        store.overwrite(&node, &Path::from_string("/root"), false).await.unwrap();

        let mut forest = PruneForest::new();
        forest.prune_path(Path::from_string("/root/gone")).unwrap();
        store.prune_cache(&forest, &Path::from_string("/root")).await.unwrap();

        let read = store.get_at_path(&Path::from_string("/root")).await.unwrap();
        assert!(read.get_immediate_child("gone").is_empty());
        assert_eq!(read.get_immediate_child("keep"), Node::leaf(json!(1)));
    }
}
