//! `PruneForest`: a sparse decision tree over paths used to express "evict
//! these subtrees of the server cache while preserving those" (§3, §4.5).
//!
//! Keyed the same way `SyncTree` keys its sync points: a `BTreeMap<Path, _>`
//! standing in for a persistent path-indexed tree.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::path::Path;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PruneMark {
    Keep,
    Prune,
}

#[derive(Debug, Error)]
#[error("cannot prune {path}: it lies under a kept subtree")]
pub struct PrunePathError {
    path: Path,
}

#[derive(Default)]
pub struct PruneForest {
    marks: BTreeMap<Path, PruneMark>,
}

impl PruneForest {
    pub fn new() -> Self {
        PruneForest::default()
    }

    pub fn keep_path(&mut self, path: Path) {
        self.marks.insert(path, PruneMark::Keep);
    }

    /// Marks `path` for pruning. Fails if any ancestor of (or `path` itself)
    /// is marked `Keep`, since a prune mark beneath a kept subtree can never
    /// take effect (`should_prune_unkept_descendants` always prefers the
    /// leaf-most mark on the chain, so a keep below this prune would shadow
    /// it anyway — reject at construction time instead of silently no-op'ing).
    pub fn prune_path(&mut self, path: Path) -> Result<(), PrunePathError> {
        if self.has_kept_ancestor(&path) {
            return Err(PrunePathError { path });
        }
        self.marks.insert(path, PruneMark::Prune);
        Ok(())
    }

    fn has_kept_ancestor(&self, path: &Path) -> bool {
        self.marks
            .iter()
            .any(|(marked, mark)| *mark == PruneMark::Keep && marked.contains(path))
    }

    /// True iff the leaf-most (deepest) ancestor-or-self mark on the path to
    /// `path` is `Prune`. An unmarked path (or one with no ancestor mark at
    /// all) is never pruned.
    pub fn should_prune_unkept_descendants(&self, path: &Path) -> bool {
        let deepest = self
            .marks
            .iter()
            .filter(|(marked, _)| marked.contains(path))
            .max_by_key(|(marked, _)| marked.len());
        matches!(deepest, Some((_, PruneMark::Prune)))
    }

    pub fn prunes_anything(&self) -> bool {
        self.marks.values().any(|m| *m == PruneMark::Prune)
    }
}
