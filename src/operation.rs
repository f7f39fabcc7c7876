//! Operations: the tagged records that flow from `SyncTree` down through
//! `SyncPoint` into `View`.

use std::collections::BTreeMap;

use crate::node::Node;
use crate::path::Path;

/// Where an operation originated, used to route it to the right view(s).
#[derive(Debug, Clone, PartialEq)]
pub enum OperationSource {
    User,
    Server,
    /// A server update tagged to one specific filtered query.
    ServerTagged(String),
}

impl OperationSource {
    pub fn query_id(&self) -> Option<&str> {
        match self {
            OperationSource::ServerTagged(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_from_user(&self) -> bool {
        matches!(self, OperationSource::User)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Overwrite {
        source: OperationSource,
        path: Path,
        snap: Node,
    },
    Merge {
        source: OperationSource,
        path: Path,
        children: BTreeMap<String, Node>,
    },
    AckUserWrite {
        source: OperationSource,
        path: Path,
        /// Paths (relative to `path`) affected by the acked write, mapped to
        /// whether the affected subtree is now fully resolved again. An
        /// overwrite ack affects the whole subtree (`{Path::empty(): true}`);
        /// a merge ack affects only its named children.
        affected: BTreeMap<Path, bool>,
        revert: bool,
    },
    ListenComplete {
        source: OperationSource,
        path: Path,
    },
}

impl Operation {
    pub fn source(&self) -> &OperationSource {
        match self {
            Operation::Overwrite { source, .. } => source,
            Operation::Merge { source, .. } => source,
            Operation::AckUserWrite { source, .. } => source,
            Operation::ListenComplete { source, .. } => source,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. } => path,
            Operation::Merge { path, .. } => path,
            Operation::AckUserWrite { path, .. } => path,
            Operation::ListenComplete { path, .. } => path,
        }
    }

    /// Restricts this operation to the subtree rooted at `child`, or
    /// `None` if `child` is unaffected.
    pub fn operation_for_child(&self, child: &str) -> Option<Operation> {
        match self {
            Operation::Overwrite { source, path, snap } => {
                if path.is_empty() {
                    Some(Operation::Overwrite {
                        source: source.clone(),
                        path: Path::empty(),
                        snap: snap.get_immediate_child(child),
                    })
                } else {
                    match path.front() {
                        Some(front) if front == child => Some(Operation::Overwrite {
                            source: source.clone(),
                            path: path.pop_front(),
                            snap: snap.clone(),
                        }),
                        Some(_) => None,
                        None => unreachable!("non-empty path must have a front"),
                    }
                }
            }
            Operation::Merge {
                source,
                path,
                children,
            } => {
                if path.is_empty() {
                    children.get(child).map(|snap| Operation::Overwrite {
                        source: source.clone(),
                        path: Path::empty(),
                        snap: snap.clone(),
                    })
                } else {
                    match path.front() {
                        Some(front) if front == child => Some(Operation::Merge {
                            source: source.clone(),
                            path: path.pop_front(),
                            children: children.clone(),
                        }),
                        Some(_) => None,
                        None => unreachable!("non-empty path must have a front"),
                    }
                }
            }
            Operation::AckUserWrite {
                source,
                path,
                affected,
                revert,
            } => {
                if path.is_empty() {
                    let child_affected: BTreeMap<Path, bool> = affected
                        .iter()
                        .filter_map(|(p, v)| {
                            if p.is_empty() {
                                // whole-subtree ack affects every child
                                Some((Path::empty(), *v))
                            } else if p.front() == Some(child) {
                                Some((p.pop_front(), *v))
                            } else {
                                None
                            }
                        })
                        .collect();
                    if affected.contains_key(&Path::empty()) || !child_affected.is_empty() {
                        Some(Operation::AckUserWrite {
                            source: source.clone(),
                            path: Path::empty(),
                            affected: if child_affected.is_empty() {
                                let mut m = BTreeMap::new();
                                m.insert(Path::empty(), *affected.get(&Path::empty()).unwrap());
                                m
                            } else {
                                child_affected
                            },
                            revert: *revert,
                        })
                    } else {
                        None
                    }
                } else {
                    match path.front() {
                        Some(front) if front == child => Some(Operation::AckUserWrite {
                            source: source.clone(),
                            path: path.pop_front(),
                            affected: affected.clone(),
                            revert: *revert,
                        }),
                        Some(_) => None,
                        None => unreachable!("non-empty path must have a front"),
                    }
                }
            }
            Operation::ListenComplete { source, path } => {
                if path.is_empty() {
                    Some(Operation::ListenComplete {
                        source: source.clone(),
                        path: Path::empty(),
                    })
                } else {
                    match path.front() {
                        Some(front) if front == child => Some(Operation::ListenComplete {
                            source: source.clone(),
                            path: path.pop_front(),
                        }),
                        Some(_) => None,
                        None => unreachable!("non-empty path must have a front"),
                    }
                }
            }
        }
    }
}
