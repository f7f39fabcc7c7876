//! Pluggable key-value persistence (§4.7/§4.8).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;

pub use memory::MemoryStorageAdapter;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorageAdapter;
pub use traits::{StorageAdapter, WriteBatch};

pub const STORE_SERVER: &str = "server";
pub const STORE_USER: &str = "user";
pub const STORE_QUERY: &str = "query";
