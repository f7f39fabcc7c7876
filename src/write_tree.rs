//! `WriteTree`: the ordered log of pending user writes, layered onto server
//! data to compute the event cache.
//!
//! Writes are totally ordered by a monotonically increasing `write_id`
//! (§3, §5); a later write at a path supersedes earlier overlays at that
//! path and its descendants. Hidden writes (`visible = false`) still occupy
//! a slot in the ordering (so acks/reverts line up) but never affect the
//! event cache.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    Overwrite(Node),
    Merge(BTreeMap<String, Node>),
}

#[derive(Debug, Clone)]
pub struct UserWriteRecord {
    pub write_id: u64,
    pub path: Path,
    pub write: WritePayload,
    pub visible: bool,
}

/// The append-only, ascending-by-id log of pending writes.
#[derive(Debug, Default)]
pub struct WriteTree {
    writes: Vec<UserWriteRecord>,
}

impl WriteTree {
    pub fn new() -> Self {
        WriteTree { writes: Vec::new() }
    }

    fn last_write_id(&self) -> Option<u64> {
        self.writes.last().map(|w| w.write_id)
    }

    pub fn add_overwrite(&mut self, path: Path, snap: Node, write_id: u64, visible: bool) -> Result<()> {
        if let Some(last) = self.last_write_id() {
            if write_id <= last {
                return Err(Error::Invariant(format!(
                    "write id {write_id} is not greater than last write id {last}"
                )));
            }
        }
        self.writes.push(UserWriteRecord {
            write_id,
            path,
            write: WritePayload::Overwrite(snap),
            visible,
        });
        Ok(())
    }

    pub fn add_merge(&mut self, path: Path, children: BTreeMap<String, Node>, write_id: u64) -> Result<()> {
        if let Some(last) = self.last_write_id() {
            if write_id <= last {
                return Err(Error::Invariant(format!(
                    "write id {write_id} is not greater than last write id {last}"
                )));
            }
        }
        self.writes.push(UserWriteRecord {
            write_id,
            path,
            write: WritePayload::Merge(children),
            visible: true,
        });
        Ok(())
    }

    pub fn get_write(&self, write_id: u64) -> Option<&UserWriteRecord> {
        self.writes.iter().find(|w| w.write_id == write_id)
    }

    /// Removes the write with the given id. Returns whether any *visible*
    /// overlay existed at that write — the caller must recompute affected
    /// sync points only when this is `true`.
    pub fn remove_write(&mut self, write_id: u64) -> bool {
        if let Some(pos) = self.writes.iter().position(|w| w.write_id == write_id) {
            let removed = self.writes.remove(pos);
            removed.visible
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn all_writes(&self) -> &[UserWriteRecord] {
        &self.writes
    }

    /// A read-only, path-bounded view for computing the overlay beneath
    /// `path`.
    pub fn child_writes(&self, path: Path) -> WriteTreeRef<'_> {
        WriteTreeRef {
            tree: self,
            root: path,
        }
    }
}

/// A view of a `WriteTree` bounded to one root path, used by `View`/`SyncPoint`
/// to compute the overlay for a single query without re-scanning the whole
/// write log by hand each time.
pub struct WriteTreeRef<'a> {
    tree: &'a WriteTree,
    root: Path,
}

impl<'a> WriteTreeRef<'a> {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn child(&self, key: &str) -> WriteTreeRef<'a> {
        WriteTreeRef {
            tree: self.tree,
            root: self.root.child(key),
        }
    }

    fn relevant_writes(&self, include_hidden: bool, exclude: &[u64]) -> Vec<&'a UserWriteRecord> {
        self.tree
            .writes
            .iter()
            .filter(|w| (w.visible || include_hidden) && !exclude.contains(&w.write_id))
            .filter(|w| self.root.contains(&w.path) || w.path.contains(&self.root))
            .collect()
    }

    /// Computes the fully resolved node at `self.root`, layering *visible*
    /// relevant writes (ascending id) onto `base`. Hidden writes never
    /// affect the event cache. Returns `None` if `base` is unknown (`None`)
    /// and no write fully overwrites the root (insufficient data to
    /// answer).
    pub fn calc_complete_event_cache(&self, base: Option<Node>) -> Option<Node> {
        self.calc_event_cache_excluding(base, &[], false)
    }

    /// Like `calc_complete_event_cache`, but also including hidden writes.
    /// Used only by the `SyncTree`-level "give me everything, acked or not"
    /// utility — never by view/sync-point event-cache computation.
    pub fn calc_complete_event_cache_excluding(&self, base: Option<Node>, exclude: &[u64]) -> Option<Node> {
        self.calc_event_cache_excluding(base, exclude, true)
    }

    fn calc_event_cache_excluding(&self, base: Option<Node>, exclude: &[u64], include_hidden: bool) -> Option<Node> {
        let writes = self.relevant_writes(include_hidden, exclude);
        let has_full_overwrite = writes
            .iter()
            .any(|w| w.path.contains(&self.root) && matches!(w.write, WritePayload::Overwrite(_)));
        if base.is_none() && !has_full_overwrite {
            return None;
        }
        let mut current = base;
        for write in writes {
            current = Some(Self::apply_one(current, &self.root, write));
        }
        current
    }

    /// Like `calc_complete_event_cache` but used when the full node can't be
    /// resolved (`base` unknown and no full overwrite) — overlays *visible*
    /// writes purely onto the known children of `base_children`, which must
    /// already reflect whatever partial server knowledge exists.
    pub fn calc_complete_event_children(&self, base_children: Node) -> Node {
        let writes = self.relevant_writes(false, &[]);
        let mut current = base_children;
        for write in writes {
            current = Self::apply_one(Some(current), &self.root, write);
        }
        current
    }

    fn apply_one(current: Option<Node>, root: &Path, write: &UserWriteRecord) -> Node {
        if write.path.contains(root) {
            // write's root is at or above our root: descend its payload down
            // to our root to find the value that applies here.
            let rel = root.relative_to(&write.path).expect("write.path contains root");
            match &write.write {
                WritePayload::Overwrite(snap) => snap.get_child(&rel),
                WritePayload::Merge(children) => {
                    if rel.is_empty() {
                        let mut base = current.unwrap_or_else(Node::empty);
                        for (k, v) in children {
                            base = base.update_immediate_child(k, v.clone());
                        }
                        base
                    } else {
                        let front = rel.front().expect("non-empty relative path has a front");
                        match children.get(front) {
                            Some(child_node) => {
                                let deeper = child_node.get_child(&rel.pop_front());
                                current.unwrap_or_else(Node::empty).update_child(&rel, deeper)
                            }
                            None => current.unwrap_or_else(Node::empty),
                        }
                    }
                }
            }
        } else if root.contains(&write.path) {
            // write is strictly inside our subtree: splice its effect in at
            // its relative position.
            let rel_within = write.path.relative_to(root).expect("root contains write.path");
            let base = current.unwrap_or_else(Node::empty);
            match &write.write {
                WritePayload::Overwrite(snap) => base.update_child(&rel_within, snap.clone()),
                WritePayload::Merge(children) => {
                    let existing = base.get_child(&rel_within);
                    let mut merged = existing;
                    for (k, v) in children {
                        merged = merged.update_immediate_child(k, v.clone());
                    }
                    base.update_child(&rel_within, merged)
                }
            }
        } else {
            current.unwrap_or_else(Node::empty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overwrite_must_use_strictly_increasing_ids() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(1)), 1, true)
            .unwrap();
        let err = tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(2)), 1, true);
        assert!(err.is_err());
    }

    #[test]
    fn later_overwrite_supersedes_earlier_at_same_path() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(1)), 1, true)
            .unwrap();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(2)), 2, true)
            .unwrap();
        let r#ref = tree.child_writes(Path::from_string("/a"));
        let result = r#ref.calc_complete_event_cache(None).unwrap();
        assert_eq!(result, Node::leaf(json!(2)));
    }

    #[test]
    fn merge_only_supersedes_named_children() {
        let mut tree = WriteTree::new();
        let base = Node::empty()
            .update_immediate_child("a", Node::leaf(json!(1)))
            .update_immediate_child("b", Node::leaf(json!(2)));
        let mut children = BTreeMap::new();
        children.insert("b".to_string(), Node::leaf(json!(99)));
        tree.add_merge(Path::empty(), children, 1).unwrap();

        let r#ref = tree.child_writes(Path::empty());
        let result = r#ref.calc_complete_event_cache(Some(base)).unwrap();
        assert_eq!(result.get_immediate_child("a"), Node::leaf(json!(1)));
        assert_eq!(result.get_immediate_child("b"), Node::leaf(json!(99)));
    }

    #[test]
    fn child_writes_narrows_overlay_to_subtree() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a/b"), Node::leaf(json!("x")), 1, true)
            .unwrap();
        let r#ref = tree.child_writes(Path::from_string("/a"));
        let result = r#ref.calc_complete_event_cache(Some(Node::empty())).unwrap();
        assert_eq!(result.get_immediate_child("b"), Node::leaf(json!("x")));
    }

    #[test]
    fn hidden_writes_excluded_from_visible_only_overlay() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(1)), 1, false)
            .unwrap();
        let removed_visible = tree.remove_write(1);
        assert!(!removed_visible, "hidden write removal reports no visible change");
    }

    #[test]
    fn remove_write_reports_whether_it_was_visible() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(1)), 1, true)
            .unwrap();
        assert!(tree.remove_write(1));
        assert!(tree.get_write(1).is_none());
    }

    #[test]
    fn no_data_and_no_full_overwrite_is_insufficient() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a/b"), Node::leaf(json!(1)), 1, true)
            .unwrap();
        let r#ref = tree.child_writes(Path::from_string("/a"));
        assert!(r#ref.calc_complete_event_cache(None).is_none());
    }

    #[test]
    fn hidden_write_never_affects_event_cache() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(1)), 1, true)
            .unwrap();
        tree.add_overwrite(Path::from_string("/a"), Node::leaf(json!(2)), 2, false)
            .unwrap();
        let r#ref = tree.child_writes(Path::from_string("/a"));
        assert_eq!(r#ref.calc_complete_event_cache(None).unwrap(), Node::leaf(json!(1)));
        // The hidden-inclusive variant (used only by the separate
        // "everything, acked or not" utility) does see it.
        assert_eq!(
            r#ref.calc_complete_event_cache_excluding(None, &[]).unwrap(),
            Node::leaf(json!(2))
        );
    }

    #[test]
    fn merge_at_root_with_unknown_base_is_still_insufficient() {
        let mut tree = WriteTree::new();
        let mut children = BTreeMap::new();
        children.insert("a".to_string(), Node::leaf(json!(1)));
        tree.add_merge(Path::empty(), children, 1).unwrap();
        let r#ref = tree.child_writes(Path::empty());
        assert!(
            r#ref.calc_complete_event_cache(None).is_none(),
            "a merge never fully determines a node whose base is unknown"
        );
    }

    #[test]
    fn full_overwrite_at_root_makes_base_unnecessary() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(Path::empty(), Node::leaf(json!("whole")), 1, true)
            .unwrap();
        let r#ref = tree.child_writes(Path::empty());
        assert_eq!(r#ref.calc_complete_event_cache(None).unwrap(), Node::leaf(json!("whole")));
    }
}
