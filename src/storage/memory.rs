//! In-memory `StorageAdapter`, used by tests and as the memory-only fallback
//! when persistence is never enabled.
//!
//! Mirrors the teacher's `MemoryMapped<B>` wrapper in spirit (interior
//! mutability via `parking_lot::Mutex`, writes buffered into a batch that
//! applies atomically) but has no inner backend to flush to — it is its own
//! backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

use super::traits::{StorageAdapter, WriteBatch};

#[derive(Debug, Clone)]
enum PendingOp {
    Set { key: String, value: Option<String> },
    RemoveMany { keys: Vec<String> },
    RemovePrefixed { prefix: String },
}

pub struct MemoryStorageAdapter {
    stores: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
}

impl Default for MemoryStorageAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        MemoryStorageAdapter {
            stores: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorageAdapter {
    async fn get(&self, store: &str, key: &str) -> Result<Option<String>> {
        Ok(self.stores.lock().get(store).and_then(|s| s.get(key).cloned()))
    }

    async fn get_all(&self, store: &str, prefix: Option<&str>) -> Result<Vec<(String, String)>> {
        let stores = self.stores.lock();
        let Some(map) = stores.get(store) else {
            return Ok(Vec::new());
        };
        let prefix = prefix.unwrap_or("");
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set(&self, store: &str, key: &str, value: Option<String>) -> Result<()> {
        let mut stores = self.stores.lock();
        let map = stores.entry(store.to_string()).or_default();
        match value {
            Some(v) => {
                map.insert(key.to_string(), v);
            }
            None => {
                map.remove(key);
            }
        }
        Ok(())
    }

    async fn remove(&self, store: &str, keys: &[String]) -> Result<()> {
        let mut stores = self.stores.lock();
        if let Some(map) = stores.get_mut(store) {
            for key in keys {
                map.remove(key);
            }
        }
        Ok(())
    }

    async fn remove_prefixed(&self, store: &str, prefix: &str) -> Result<()> {
        let mut stores = self.stores.lock();
        if let Some(map) = stores.get_mut(store) {
            map.retain(|k, _| !k.starts_with(prefix));
        }
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.stores.lock().remove(store);
        Ok(())
    }

    async fn keys(&self, store: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        Ok(self.get_all(store, prefix).await?.into_iter().map(|(k, _)| k).collect())
    }

    async fn count(&self, store: &str) -> Result<usize> {
        Ok(self.stores.lock().get(store).map(|m| m.len()).unwrap_or(0))
    }

    async fn close(&self, _store: &str) -> Result<()> {
        Ok(())
    }

    async fn estimated_size(&self, store: &str) -> Result<f64> {
        let stores = self.stores.lock();
        let Some(map) = stores.get(store) else {
            return Ok(0.0);
        };
        Ok(map
            .iter()
            .map(|(k, v)| k.len() as f64 / 2.0 + v.len() as f64)
            .sum())
    }

    fn write_batch(&self, store: &str) -> Box<dyn WriteBatch> {
        Box::new(MemoryWriteBatch {
            store: store.to_string(),
            ops: Vec::new(),
            stores: self.stores.clone(),
        })
    }
}

/// Buffers mutations and applies them to the adapter's map atomically on
/// `run()`. Holds a clone of the adapter's `Arc<Mutex<..>>` rather than a
/// borrow, since `StorageAdapter::write_batch` takes `&self`.
struct MemoryWriteBatch {
    store: String,
    ops: Vec<PendingOp>,
    stores: Arc<Mutex<BTreeMap<String, BTreeMap<String, String>>>>,
}

#[async_trait]
impl WriteBatch for MemoryWriteBatch {
    fn set(&mut self, key: &str, value: Option<String>) {
        self.ops.push(PendingOp::Set {
            key: key.to_string(),
            value,
        });
    }

    fn remove(&mut self, key: &str) {
        self.ops.push(PendingOp::RemoveMany { keys: vec![key.to_string()] });
    }

    fn remove_prefixed(&mut self, prefix: &str) {
        self.ops.push(PendingOp::RemovePrefixed { prefix: prefix.to_string() });
    }

    async fn run(&mut self) -> Result<()> {
        let mut stores = self.stores.lock();
        let map = stores.entry(self.store.clone()).or_default();
        for op in self.ops.drain(..) {
            match op {
                PendingOp::Set { key, value } => match value {
                    Some(v) => {
                        map.insert(key, v);
                    }
                    None => {
                        map.remove(&key);
                    }
                },
                PendingOp::RemoveMany { keys } => {
                    for key in keys {
                        map.remove(&key);
                    }
                }
                PendingOp::RemovePrefixed { prefix } => {
                    map.retain(|k, _| !k.starts_with(&prefix));
                }
            }
        }
        Ok(())
    }

    fn estimated_size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                PendingOp::Set { key, value } => key.len() + value.as_ref().map(String::len).unwrap_or(0),
                PendingOp::RemoveMany { keys } => keys.iter().map(String::len).sum(),
                PendingOp::RemovePrefixed { prefix } => prefix.len(),
            })
            .sum()
    }
}
