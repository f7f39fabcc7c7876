//! SQLite-backed `StorageAdapter`, feature-gated behind `sqlite`.
//!
//! One table per store (`server`, `user`, `query`), created lazily on first
//! use. Values are stored exactly as handed in — this module is oblivious to
//! their JSON structure, same contract as `MemoryStorageAdapter`.
//!
//! rusqlite's `Connection` is not `Send`-safe to share across an `&self`
//! boundary without synchronization, so every access goes through a
//! `parking_lot::Mutex`. Calls are synchronous under the hood; the `async`
//! signatures exist to satisfy `StorageAdapter` and to leave room for an
//! actual async driver later without touching call sites.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

use super::traits::{StorageAdapter, WriteBatch};

pub struct SqliteStorageAdapter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorageAdapter {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sqlite_err)?;
        Ok(SqliteStorageAdapter { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Ok(SqliteStorageAdapter { conn: Arc::new(Mutex::new(conn)) })
    }

    fn ensure_table(conn: &Connection, store: &str) -> Result<()> {
        let table = table_name(store);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
        ))
        .map_err(sqlite_err)
    }
}

fn table_name(store: &str) -> String {
    format!("kv_{store}")
}

fn sqlite_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

#[async_trait]
impl StorageAdapter for SqliteStorageAdapter {
    async fn get(&self, store: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        conn.query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", table_name(store)),
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(sqlite_err)
    }

    async fn get_all(&self, store: &str, prefix: Option<&str>) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let table = table_name(store);
        let rows: Vec<(String, String)> = match prefix {
            Some(p) => {
                let upper = prefix_upper_bound(p);
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT key, value FROM {table} WHERE key >= ?1 AND key < ?2 ORDER BY key"
                    ))
                    .map_err(sqlite_err)?;
                let rows = stmt
                    .query_map(params![p, upper], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(sqlite_err)?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sqlite_err)?
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT key, value FROM {table} ORDER BY key"))
                    .map_err(sqlite_err)?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))).map_err(sqlite_err)?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sqlite_err)?
            }
        };
        Ok(rows)
    }

    async fn set(&self, store: &str, key: &str, value: Option<String>) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let table = table_name(store);
        match value {
            Some(v) => conn
                .execute(
                    &format!("INSERT INTO {table} (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value"),
                    params![key, v],
                )
                .map_err(sqlite_err)?,
            None => conn
                .execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])
                .map_err(sqlite_err)?,
        };
        Ok(())
    }

    async fn remove(&self, store: &str, keys: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let table = table_name(store);
        for key in keys {
            conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])
                .map_err(sqlite_err)?;
        }
        Ok(())
    }

    async fn remove_prefixed(&self, store: &str, prefix: &str) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let table = table_name(store);
        let upper = prefix_upper_bound(prefix);
        conn.execute(
            &format!("DELETE FROM {table} WHERE key >= ?1 AND key < ?2"),
            params![prefix, upper],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        conn.execute(&format!("DELETE FROM {}", table_name(store)), [])
            .map_err(sqlite_err)?;
        Ok(())
    }

    async fn keys(&self, store: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        Ok(self.get_all(store, prefix).await?.into_iter().map(|(k, _)| k).collect())
    }

    async fn count(&self, store: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table_name(store)), [], |row| row.get(0))
            .map_err(sqlite_err)?;
        Ok(count as usize)
    }

    async fn close(&self, _store: &str) -> Result<()> {
        Ok(())
    }

    async fn estimated_size(&self, store: &str) -> Result<f64> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let size: Option<i64> = conn
            .query_row(
                &format!("SELECT SUM(LENGTH(key) + LENGTH(value)) FROM {}", table_name(store)),
                [],
                |row| row.get(0),
            )
            .map_err(sqlite_err)?;
        Ok(size.unwrap_or(0) as f64)
    }

    fn write_batch(&self, store: &str) -> Box<dyn WriteBatch> {
        Box::new(SqliteWriteBatch {
            store: store.to_string(),
            ops: Vec::new(),
            conn: self.conn.clone(),
        })
    }
}

/// `b'/'` would also match, so the upper bound is the prefix with its last
/// char incremented; any key `>= prefix` and `< upper` starts with `prefix`.
/// Works char-by-char (not byte-by-byte) so the result is always valid UTF-8.
fn prefix_upper_bound(prefix: &str) -> String {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(incremented) = increment_char(last) {
            chars.push(incremented);
            return chars.into_iter().collect();
        }
    }
    "\u{10FFFF}".to_string()
}

fn increment_char(c: char) -> Option<char> {
    let mut next = c as u32 + 1;
    if (0xD800..=0xDFFF).contains(&next) {
        next = 0xE000;
    }
    char::from_u32(next)
}

enum PendingOp {
    Set { key: String, value: Option<String> },
    RemoveMany { keys: Vec<String> },
    RemovePrefixed { prefix: String },
}

struct SqliteWriteBatch {
    store: String,
    ops: Vec<PendingOp>,
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl WriteBatch for SqliteWriteBatch {
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
        let mut conn = self.conn.lock();
        SqliteStorageAdapter::ensure_table(&conn, &self.store)?;
        let table = table_name(&self.store);
        let tx = conn.transaction().map_err(sqlite_err)?;
        for op in self.ops.drain(..) {
            match op {
                PendingOp::Set { key, value } => match value {
                    Some(v) => {
                        tx.execute(
                            &format!("INSERT INTO {table} (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value"),
                            params![key, v],
                        )
                        .map_err(sqlite_err)?;
                    }
                    None => {
                        tx.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])
                            .map_err(sqlite_err)?;
                    }
                },
                PendingOp::RemoveMany { keys } => {
                    for key in keys {
                        tx.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])
                            .map_err(sqlite_err)?;
                    }
                }
                PendingOp::RemovePrefixed { prefix } => {
                    let upper = prefix_upper_bound(&prefix);
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE key >= ?1 AND key < ?2"),
                        params![prefix, upper],
                    )
                    .map_err(sqlite_err)?;
                }
            };
        }
        tx.commit().map_err(sqlite_err)?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let adapter = SqliteStorageAdapter::open_in_memory().unwrap();
        adapter.set("server", "a/", Some("1".into())).await.unwrap();
        assert_eq!(adapter.get("server", "a/").await.unwrap(), Some("1".into()));
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_value() {
        let adapter = SqliteStorageAdapter::open_in_memory().unwrap();
        adapter.set("server", "a/", Some("1".into())).await.unwrap();
        adapter.set("server", "a/", Some("2".into())).await.unwrap();
        assert_eq!(adapter.get("server", "a/").await.unwrap(), Some("2".into()));
    }

    #[tokio::test]
    async fn remove_prefixed_deletes_subtree_only() {
        let adapter = SqliteStorageAdapter::open_in_memory().unwrap();
        adapter.set("server", "a/b/", Some("1".into())).await.unwrap();
        adapter.set("server", "a/c/", Some("2".into())).await.unwrap();
        adapter.set("server", "b/", Some("3".into())).await.unwrap();
        adapter.remove_prefixed("server", "a/").await.unwrap();
        assert_eq!(adapter.count("server").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn write_batch_commits_as_one_transaction() {
        let adapter = SqliteStorageAdapter::open_in_memory().unwrap();
        let mut batch = adapter.write_batch("user");
        batch.set("1", Some("{}".into()));
        batch.set("2", Some("{}".into()));
        batch.run().await.unwrap();
        assert_eq!(adapter.count("user").await.unwrap(), 2);
    }
}
