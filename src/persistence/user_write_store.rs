//! `UserWriteStore`: persisted pending user writes, keyed by decimal
//! `writeId` (§3, §4.7).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::Result;
use crate::node::Node;
use crate::path::Path;
use crate::storage::{StorageAdapter, STORE_USER};
use crate::write_tree::{UserWriteRecord, WritePayload};

pub struct UserWriteStore {
    adapter: Arc<dyn StorageAdapter>,
}

impl UserWriteStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        UserWriteStore { adapter }
    }

    pub async fn save_overwrite(&self, write_id: u64, path: &Path, node: &Node) -> Result<()> {
        let value = json!({
            "id": write_id,
            "path": path.to_path_string(),
            "overwrite": node.export_json(),
        });
        self.adapter.set(STORE_USER, &write_id.to_string(), Some(value.to_string())).await
    }

    pub async fn save_merge(&self, write_id: u64, path: &Path, children: &BTreeMap<String, Node>) -> Result<()> {
        let mut merge_obj = serde_json::Map::new();
        for (k, v) in children {
            merge_obj.insert(k.clone(), v.export_json());
        }
        let value = json!({
            "id": write_id,
            "path": path.to_path_string(),
            "merge": Value::Object(merge_obj),
        });
        self.adapter.set(STORE_USER, &write_id.to_string(), Some(value.to_string())).await
    }

    pub async fn remove(&self, write_id: u64) -> Result<()> {
        self.adapter.set(STORE_USER, &write_id.to_string(), None).await
    }

    /// All persisted writes, ordered by ascending `writeId`.
    pub async fn get_all(&self) -> Result<Vec<UserWriteRecord>> {
        let entries = self.adapter.get_all(STORE_USER, None).await?;
        let mut records = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            let parsed: Value = serde_json::from_str(&value)?;
            let write_id = parsed["id"].as_u64().unwrap_or(0);
            let path = Path::from_string(parsed["path"].as_str().unwrap_or(""));
            if let Some(overwrite) = parsed.get("overwrite") {
                records.push(UserWriteRecord {
                    write_id,
                    path,
                    write: WritePayload::Overwrite(Node::from_json(overwrite)),
                    visible: true,
                });
            } else if let Some(Value::Object(map)) = parsed.get("merge") {
                let children = map.iter().map(|(k, v)| (k.clone(), Node::from_json(v))).collect();
                records.push(UserWriteRecord {
                    write_id,
                    path,
                    write: WritePayload::Merge(children),
                    visible: true,
                });
            }
        }
        records.sort_by_key(|r| r.write_id);
        Ok(records)
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close(STORE_USER).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorageAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn overwrite_round_trips_and_sorts_by_id() {
        let store = UserWriteStore::new(Arc::new(MemoryStorageAdapter::new()));
        store.save_overwrite(2, &Path::from_string("/b"), &Node::leaf(json!(2))).await.unwrap();
        store.save_overwrite(1, &Path::from_string("/a"), &Node::leaf(json!(1))).await.unwrap();
        let all = store.get_all().await.unwrap();
        assert_eq!(all.iter().map(|r| r.write_id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn merge_round_trips_children() {
        let store = UserWriteStore::new(Arc::new(MemoryStorageAdapter::new()));
        let mut children = BTreeMap::new();
        children.insert("x".to_string(), Node::leaf(json!(1)));
        store.save_merge(5, &Path::from_string("/a"), &children).await.unwrap();
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        match &all[0].write {
            WritePayload::Merge(c) => assert_eq!(c.get("x"), Some(&Node::leaf(json!(1)))),
            _ => panic!("expected merge"),
        }
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let store = UserWriteStore::new(Arc::new(MemoryStorageAdapter::new()));
        store.save_overwrite(1, &Path::from_string("/a"), &Node::leaf(json!(1))).await.unwrap();
        store.remove(1).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }
}
