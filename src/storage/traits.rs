//! `StorageAdapter`: the key-value contract the engine persists through
//! (§6). Keys are typed by `(store, key)`; a `store` is one of `server`,
//! `user`, `query` (§3). Values are opaque JSON-encoded strings — this
//! module never interprets them.

use async_trait::async_trait;

use crate::error::Result;

/// A batch of mutations against one store, run atomically and in submission
/// order relative to other batches on the same store.
#[async_trait]
pub trait WriteBatch: Send {
    fn set(&mut self, key: &str, value: Option<String>);
    fn remove(&mut self, key: &str);
    fn remove_prefixed(&mut self, prefix: &str);
    async fn run(&mut self) -> Result<()>;
    /// Rough byte size of the batch's buffered mutations, used by
    /// `CachePolicy`-driven size estimation.
    fn estimated_size(&self) -> usize;
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<Option<String>>;
    async fn get_all(&self, store: &str, prefix: Option<&str>) -> Result<Vec<(String, String)>>;
    /// `value = None` deletes the key.
    async fn set(&self, store: &str, key: &str, value: Option<String>) -> Result<()>;
    async fn remove(&self, store: &str, keys: &[String]) -> Result<()>;
    async fn remove_prefixed(&self, store: &str, prefix: &str) -> Result<()>;
    async fn clear(&self, store: &str) -> Result<()>;
    async fn keys(&self, store: &str, prefix: Option<&str>) -> Result<Vec<String>>;
    async fn count(&self, store: &str) -> Result<usize>;
    async fn close(&self, store: &str) -> Result<()>;
    async fn estimated_size(&self, store: &str) -> Result<f64>;
    fn write_batch(&self, store: &str) -> Box<dyn WriteBatch>;
}
