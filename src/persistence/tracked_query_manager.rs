//! `TrackedQueryManager`: the in-memory index of tracked queries (§4.6).
//!
//! Loaded once from storage at `PersistenceManager` construction; every
//! mutator here is synchronous, matching the rest of the sync engine's
//! single-threaded core. The `initialized`-future gating the spec describes
//! is pushed up to `PersistenceManager`, which only builds this index once
//! the load has resolved.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::path::Path;
use crate::query::{Query, DEFAULT_IDENTIFIER};

use super::cache_policy::CachePolicy;
use super::prune_forest::PruneForest;
use super::tracked_query::{normalize, TrackedQuery};

#[derive(Default)]
pub struct TrackedQueryManager {
    by_path: BTreeMap<Path, HashMap<String, TrackedQuery>>,
    tracked_keys: HashMap<u64, BTreeSet<String>>,
    next_id: u64,
}

impl TrackedQueryManager {
    pub fn new() -> Self {
        TrackedQueryManager {
            by_path: BTreeMap::new(),
            tracked_keys: HashMap::new(),
            next_id: 1,
        }
    }

    /// Rebuilds the index from persisted records. Any record left `active`
    /// from an unclean shutdown is flipped to inactive with `last_use` reset
    /// to `now` (§4.6 startup recovery).
    pub fn from_persisted(records: Vec<TrackedQuery>, tracked_keys: HashMap<u64, BTreeSet<String>>, now: i64) -> Self {
        let mut by_path: BTreeMap<Path, HashMap<String, TrackedQuery>> = BTreeMap::new();
        let mut next_id = 1;
        for mut tq in records {
            next_id = next_id.max(tq.id + 1);
            if tq.active {
                tq.active = false;
                tq.last_use = now;
            }
            by_path
                .entry(tq.path().clone())
                .or_default()
                .insert(tq.query.query_identifier(), tq);
        }
        TrackedQueryManager {
            by_path,
            tracked_keys,
            next_id,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn find(&self, query: &Query) -> Option<&TrackedQuery> {
        let q = normalize(query);
        self.by_path.get(&q.path)?.get(&q.query_identifier())
    }

    fn find_mut(&mut self, query: &Query) -> Option<&mut TrackedQuery> {
        let q = normalize(query);
        self.by_path.get_mut(&q.path)?.get_mut(&q.query_identifier())
    }

    /// Creates the tracked-query record if missing. Returns its id.
    pub fn ensure_tracked(&mut self, query: &Query, now: i64) -> u64 {
        let q = normalize(query);
        if let Some(existing) = self.by_path.get(&q.path).and_then(|m| m.get(&q.query_identifier())) {
            return existing.id;
        }
        let id = self.alloc_id();
        let tq = TrackedQuery::new(id, q.clone(), now);
        self.by_path.entry(q.path.clone()).or_default().insert(q.query_identifier(), tq);
        id
    }

    pub fn remove(&mut self, query: &Query) {
        let q = normalize(query);
        if let Some(map) = self.by_path.get_mut(&q.path) {
            if let Some(tq) = map.remove(&q.query_identifier()) {
                self.tracked_keys.remove(&tq.id);
            }
            if map.is_empty() {
                self.by_path.remove(&q.path);
            }
        }
    }

    pub fn set_active(&mut self, query: &Query, now: i64) {
        if let Some(tq) = self.find_mut(query) {
            tq.active = true;
            tq.last_use = now;
        }
    }

    pub fn set_inactive(&mut self, query: &Query, now: i64) {
        if let Some(tq) = self.find_mut(query) {
            tq.active = false;
            tq.last_use = now;
        }
    }

    pub fn set_complete(&mut self, query: &Query) {
        if let Some(tq) = self.find_mut(query) {
            tq.complete = true;
        }
    }

    /// Marks every tracked query at or beneath `path` complete.
    pub fn set_complete_path(&mut self, path: &Path) {
        for (p, map) in self.by_path.iter_mut() {
            if path.contains(p) {
                for tq in map.values_mut() {
                    tq.complete = true;
                }
            }
        }
    }

    /// Creates (if missing) or updates the default tracked query at `path`,
    /// marking it active and complete.
    pub fn ensure_complete(&mut self, path: &Path, now: i64) {
        let query = Query::default_at_path(path.clone());
        self.ensure_tracked(&query, now);
        if let Some(tq) = self.find_mut(&query) {
            tq.complete = true;
            tq.active = true;
        }
    }

    /// True if an ancestor (inclusive) holds a complete default tracked
    /// query, else the specific entry's own `complete` flag.
    pub fn is_complete(&self, query: &Query) -> bool {
        if self.has_complete_default_ancestor(&query.path) {
            return true;
        }
        self.find(query).map(|tq| tq.complete).unwrap_or(false)
    }

    fn has_complete_default_ancestor(&self, path: &Path) -> bool {
        self.by_path.iter().any(|(p, map)| {
            p.contains(path)
                && map
                    .get(DEFAULT_IDENTIFIER)
                    .map(|tq| tq.complete)
                    .unwrap_or(false)
        })
    }

    /// True if any ancestor (inclusive) path has an active default tracked
    /// query.
    pub fn has_active_default(&self, path: &Path) -> bool {
        self.by_path.iter().any(|(p, map)| {
            p.contains(path)
                && map
                    .get(DEFAULT_IDENTIFIER)
                    .map(|tq| tq.active)
                    .unwrap_or(false)
        })
    }

    pub fn set_tracked_query_keys(&mut self, query: &Query, keys: Vec<String>) {
        if let Some(id) = self.find(query).map(|tq| tq.id) {
            self.tracked_keys.insert(id, keys.into_iter().collect());
        }
    }

    pub fn update_tracked_query_keys(&mut self, query: &Query, added: Vec<String>, removed: Vec<String>) {
        let Some(id) = self.find(query).map(|tq| tq.id) else {
            return;
        };
        let set = self.tracked_keys.entry(id).or_default();
        for key in added {
            set.insert(key);
        }
        for key in removed {
            set.remove(&key);
        }
    }

    /// Union of persisted tracked keys for complete filtered queries at
    /// `path`, plus the names of immediate children that have a complete
    /// default tracked query of their own.
    pub fn known_complete_children(&self, path: &Path) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        if let Some(map) = self.by_path.get(path) {
            for tq in map.values() {
                if tq.query.is_filtered() && tq.complete {
                    if let Some(keys) = self.tracked_keys.get(&tq.id) {
                        result.extend(keys.iter().cloned());
                    }
                }
            }
        }
        for (p, map) in &self.by_path {
            if let Some(rel) = p.relative_to(path) {
                if rel.len() == 1
                    && map
                        .get(DEFAULT_IDENTIFIER)
                        .map(|tq| tq.complete)
                        .unwrap_or(false)
                {
                    result.insert(rel.parts()[0].clone());
                }
            }
        }
        result
    }

    pub fn num_prunable_queries(&self) -> usize {
        self.by_path.values().flat_map(|m| m.values()).filter(|tq| !tq.active).count()
    }

    /// Partitions tracked queries into prunable (inactive) and unprunable
    /// (active); evicts the oldest-`last_use` share of the prunable set per
    /// `policy`, returning the `PruneForest` the store uses to delete their
    /// persisted data.
    /// Returns the `PruneForest` describing what the store should delete,
    /// plus the ids of the tracked queries evicted from this index (the
    /// caller must also delete their persisted `query/{id}` records).
    pub fn prune_old(&mut self, policy: &dyn CachePolicy) -> (PruneForest, Vec<u64>) {
        let mut prunable: Vec<(Path, String, i64)> = Vec::new();
        let mut keep_paths: HashSet<Path> = HashSet::new();
        for (path, map) in &self.by_path {
            for tq in map.values() {
                if tq.active {
                    keep_paths.insert(path.clone());
                } else {
                    prunable.push((path.clone(), tq.query.query_identifier(), tq.last_use));
                }
            }
        }
        prunable.sort_by_key(|(_, _, last_use)| *last_use);

        let num_prunable = prunable.len();
        let num_to_prune = num_prunable
            .saturating_sub(policy.max_prunable_queries_to_keep())
            .max((num_prunable as f64 * policy.percent_queries_prune_at_once()).ceil() as usize)
            .min(num_prunable);

        for (path, _, _) in prunable.iter().skip(num_to_prune) {
            keep_paths.insert(path.clone());
        }

        let mut forest = PruneForest::new();
        for path in &keep_paths {
            forest.keep_path(path.clone());
        }
        let mut removed_ids = Vec::new();
        for (path, qid, _) in prunable.iter().take(num_to_prune) {
            // A path also hosting a kept query (active, or another filtered
            // query past the cutoff) keeps its persisted data; we still
            // forget this particular tracked query in memory.
            if !keep_paths.contains(path) {
                forest
                    .prune_path(path.clone())
                    .expect("path not marked keep above");
            }
            if let Some(map) = self.by_path.get_mut(path) {
                if let Some(tq) = map.remove(qid) {
                    self.tracked_keys.remove(&tq.id);
                    removed_ids.push(tq.id);
                }
            }
        }
        self.by_path.retain(|_, map| !map.is_empty());
        (forest, removed_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Limit, QueryParams};

    fn filtered(path: &str) -> Query {
        Query::new(
            Path::from_string(path),
            QueryParams {
                limit: Some(Limit::First(2)),
                ..Default::default()
            },
        )
    }

    #[test]
    fn startup_recovery_deactivates_stale_active_queries() {
        let mut tq = TrackedQuery::new(1, Query::default_at_path(Path::from_string("/a")), 0);
        tq.active = true;
        let manager = TrackedQueryManager::from_persisted(vec![tq], HashMap::new(), 500);
        let entry = manager.find(&Query::default_at_path(Path::from_string("/a"))).unwrap();
        assert!(!entry.active);
        assert_eq!(entry.last_use, 500);
    }

    #[test]
    fn ensure_complete_marks_default_query_active_and_complete() {
        let mut manager = TrackedQueryManager::new();
        manager.ensure_complete(&Path::from_string("/a"), 0);
        assert!(manager.is_complete(&Query::default_at_path(Path::from_string("/a"))));
        assert!(manager.has_active_default(&Path::from_string("/a/b")));
    }

    #[test]
    fn is_complete_true_for_descendant_of_complete_default() {
        let mut manager = TrackedQueryManager::new();
        manager.ensure_complete(&Path::from_string("/a"), 0);
        assert!(manager.is_complete(&Query::default_at_path(Path::from_string("/a/b/c"))));
    }

    #[test]
    fn known_complete_children_combines_filtered_keys_and_complete_child_defaults() {
        let mut manager = TrackedQueryManager::new();
        let q = filtered("/a");
        manager.ensure_tracked(&q, 0);
        manager.set_complete(&q);
        manager.set_tracked_query_keys(&q, vec!["x".into(), "y".into()]);
        manager.ensure_complete(&Path::from_string("/a/z"), 0);

        let children = manager.known_complete_children(&Path::from_string("/a"));
        assert_eq!(children, ["x", "y", "z"].into_iter().map(String::from).collect());
    }

    #[test]
    fn prune_old_evicts_oldest_inactive_queries_first() {
        let mut manager = TrackedQueryManager::new();
        for i in 0..10 {
            let q = filtered(&format!("/q{i}"));
            manager.ensure_tracked(&q, i as i64);
        }
        struct AggressivePolicy;
        impl CachePolicy for AggressivePolicy {
            fn percent_queries_prune_at_once(&self) -> f64 {
                0.2
            }
            fn max_prunable_queries_to_keep(&self) -> usize {
                5
            }
            fn should_prune(&self, _: f64, _: usize) -> bool {
                true
            }
            fn should_check_size(&self, _: u64) -> bool {
                true
            }
        }
        // numPrunable=10: max(10-5, ceil(10*0.2)) = max(5, 2) = 5.
        let (forest, removed_ids) = manager.prune_old(&AggressivePolicy);
        assert!(forest.prunes_anything());
        assert_eq!(removed_ids.len(), 5);
        assert_eq!(manager.num_prunable_queries(), 5);
        // the oldest (q0) should be gone, the newest (q9) should remain
        assert!(manager.find(&filtered("/q0")).is_none());
        assert!(manager.find(&filtered("/q9")).is_some());
    }

    #[test]
    fn active_queries_are_never_pruned() {
        let mut manager = TrackedQueryManager::new();
        let q = filtered("/a");
        manager.ensure_tracked(&q, 0);
        manager.set_active(&q, 0);
        struct AlwaysPrune;
        impl CachePolicy for AlwaysPrune {
            fn percent_queries_prune_at_once(&self) -> f64 {
                1.0
            }
            fn max_prunable_queries_to_keep(&self) -> usize {
                0
            }
            fn should_prune(&self, _: f64, _: usize) -> bool {
                true
            }
            fn should_check_size(&self, _: u64) -> bool {
                true
            }
        }
        manager.prune_old(&AlwaysPrune);
        assert!(manager.find(&q).is_some());
    }
}
