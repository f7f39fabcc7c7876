//! `TrackedQueryStore`: persisted tracked-query bookkeeping (§3, §4.7).
//!
//! Two key families in the `query` store: `query/{id}` holds the serialized
//! `TrackedQuery`; `key/{id}/{childName}` each hold `childName` itself and
//! together form the persisted tracked-key set for a complete filtered
//! query.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::path::Path;
use crate::query::{Index, IndexBound, Limit, Query, QueryParams};
use crate::storage::{StorageAdapter, STORE_QUERY};

use crate::error::Result;

use super::tracked_query::TrackedQuery;

fn serialize_index(index: &Index) -> Value {
    match index {
        Index::Key => json!({"kind": "key"}),
        Index::Priority => json!({"kind": "priority"}),
        Index::Value => json!({"kind": "value"}),
        Index::Child(path) => json!({"kind": "child", "path": path}),
    }
}

fn deserialize_index(value: &Value) -> Option<Index> {
    match value.get("kind")?.as_str()? {
        "key" => Some(Index::Key),
        "priority" => Some(Index::Priority),
        "value" => Some(Index::Value),
        "child" => Some(Index::Child(value.get("path")?.as_str()?.to_string())),
        _ => None,
    }
}

fn serialize_bound(bound: &Option<IndexBound>) -> Value {
    match bound {
        None => Value::Null,
        Some(b) => json!({"value": b.index_value, "name": b.name}),
    }
}

fn deserialize_bound(value: &Value) -> Option<IndexBound> {
    if value.is_null() {
        return None;
    }
    Some(IndexBound {
        index_value: value.get("value")?.clone(),
        name: value.get("name").and_then(|n| n.as_str()).map(String::from),
    })
}

fn serialize_limit(limit: &Option<Limit>) -> Value {
    match limit {
        None => Value::Null,
        Some(Limit::First(n)) => json!({"dir": "first", "n": n}),
        Some(Limit::Last(n)) => json!({"dir": "last", "n": n}),
    }
}

fn deserialize_limit(value: &Value) -> Option<Limit> {
    if value.is_null() {
        return None;
    }
    let n = value.get("n")?.as_u64()? as usize;
    match value.get("dir")?.as_str()? {
        "first" => Some(Limit::First(n)),
        "last" => Some(Limit::Last(n)),
        _ => None,
    }
}

fn serialize_params(params: &QueryParams) -> Value {
    json!({
        "index": params.index.as_ref().map(serialize_index),
        "start": serialize_bound(&params.start),
        "end": serialize_bound(&params.end),
        "limit": serialize_limit(&params.limit),
    })
}

fn deserialize_params(value: &Value) -> QueryParams {
    QueryParams {
        index: value.get("index").and_then(deserialize_index),
        start: value.get("start").and_then(deserialize_bound),
        end: value.get("end").and_then(deserialize_bound),
        limit: value.get("limit").and_then(deserialize_limit),
    }
}

pub struct TrackedQueryStore {
    adapter: Arc<dyn StorageAdapter>,
}

impl TrackedQueryStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        TrackedQueryStore { adapter }
    }

    pub async fn save(&self, tq: &TrackedQuery) -> Result<()> {
        let value = json!({
            "id": tq.id,
            "path": tq.query.path.to_path_string(),
            "params": serialize_params(&tq.query.params),
            "lastUse": tq.last_use,
            "active": tq.active,
            "complete": tq.complete,
        });
        self.adapter.set(STORE_QUERY, &format!("query/{}", tq.id), Some(value.to_string())).await
    }

    pub async fn remove(&self, id: u64) -> Result<()> {
        self.adapter.set(STORE_QUERY, &format!("query/{id}"), None).await?;
        self.adapter.remove_prefixed(STORE_QUERY, &format!("key/{id}/")).await
    }

    pub async fn set_tracked_keys(&self, id: u64, keys: &BTreeSet<String>) -> Result<()> {
        self.adapter.remove_prefixed(STORE_QUERY, &format!("key/{id}/")).await?;
        let mut batch = self.adapter.write_batch(STORE_QUERY);
        for key in keys {
            batch.set(&format!("key/{id}/{key}"), Some(key.clone()));
        }
        batch.run().await
    }

    /// All persisted tracked queries plus their tracked-key sets, keyed by
    /// query id.
    pub async fn get_all(&self) -> Result<(Vec<TrackedQuery>, HashMap<u64, BTreeSet<String>>)> {
        let query_entries = self.adapter.get_all(STORE_QUERY, Some("query/")).await?;
        let mut records = Vec::with_capacity(query_entries.len());
        for (_, value) in query_entries {
            let parsed: Value = serde_json::from_str(&value)?;
            let id = parsed["id"].as_u64().unwrap_or(0);
            let path = Path::from_string(parsed["path"].as_str().unwrap_or(""));
            let params = deserialize_params(&parsed["params"]);
            let mut tq = TrackedQuery::new(id, Query::new(path, params), parsed["lastUse"].as_i64().unwrap_or(0));
            tq.active = parsed["active"].as_bool().unwrap_or(false);
            tq.complete = parsed["complete"].as_bool().unwrap_or(false);
            records.push(tq);
        }

        let key_entries = self.adapter.get_all(STORE_QUERY, Some("key/")).await?;
        let mut keys: HashMap<u64, BTreeSet<String>> = HashMap::new();
        for (key, value) in key_entries {
            let rest = key.strip_prefix("key/").unwrap_or(&key);
            if let Some((id_str, _child)) = rest.split_once('/') {
                if let Ok(id) = id_str.parse::<u64>() {
                    keys.entry(id).or_default().insert(value);
                }
            }
        }
        Ok((records, keys))
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close(STORE_QUERY).await
    }
}
