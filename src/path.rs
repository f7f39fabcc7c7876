//! Immutable slash-separated path of string components.
//!
//! Mirrors the path utility the rest of the sync engine treats as an
//! external, already-solved primitive — reimplemented here only to the
//! extent the engine needs it (construction, navigation, relative paths,
//! lexicographic ordering for use as a `BTreeMap` key).

use std::fmt;
use std::sync::Arc;

/// An ordered sequence of path components. Cheap to clone (`Arc`-backed).
#[derive(Clone, Eq, PartialEq, Hash, Default)]
pub struct Path {
    parts: Arc<Vec<String>>,
}

impl Path {
    pub fn empty() -> Self {
        Path {
            parts: Arc::new(Vec::new()),
        }
    }

    /// Parses a slash-separated path string. Leading/trailing/duplicate
    /// slashes and empty segments are ignored.
    pub fn from_string(s: &str) -> Self {
        let parts: Vec<String> = s
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(|seg| seg.to_string())
            .collect();
        Path {
            parts: Arc::new(parts),
        }
    }

    pub fn from_parts(parts: Vec<String>) -> Self {
        Path {
            parts: Arc::new(parts),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The first path component, if any.
    pub fn front(&self) -> Option<&str> {
        self.parts.first().map(|s| s.as_str())
    }

    /// The path with its first component removed.
    pub fn pop_front(&self) -> Path {
        if self.parts.is_empty() {
            return self.clone();
        }
        Path::from_parts(self.parts[1..].to_vec())
    }

    /// The path with its last component removed; `empty()` for an already-empty path.
    pub fn parent(&self) -> Option<Path> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Path::from_parts(self.parts[..self.parts.len() - 1].to_vec()))
    }

    pub fn last(&self) -> Option<&str> {
        self.parts.last().map(|s| s.as_str())
    }

    pub fn child(&self, key: &str) -> Path {
        if key.is_empty() {
            return self.clone();
        }
        let mut parts = (*self.parts).clone();
        parts.push(key.to_string());
        Path::from_parts(parts)
    }

    pub fn child_path(&self, other: &Path) -> Path {
        let mut parts = (*self.parts).clone();
        parts.extend(other.parts.iter().cloned());
        Path::from_parts(parts)
    }

    /// Whether `self` is an ancestor of or equal to `other`.
    pub fn contains(&self, other: &Path) -> bool {
        self.parts.len() <= other.parts.len() && self.parts.iter().zip(other.parts.iter()).all(|(a, b)| a == b)
    }

    /// `self`'s path expressed relative to `other`; `None` if `other` is not
    /// an ancestor of (or equal to) `self`.
    pub fn relative_to(&self, other: &Path) -> Option<Path> {
        if !other.contains(self) {
            return None;
        }
        Some(Path::from_parts(self.parts[other.parts.len()..].to_vec()))
    }

    pub fn to_path_string(&self) -> String {
        format!("/{}", self.parts.join("/"))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path_string())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", self.to_path_string())
    }
}

impl Ord for Path {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::from_string(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path::from_string(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_round_trips() {
        let p = Path::empty();
        assert!(p.is_empty());
        assert_eq!(p.to_path_string(), "/");
    }

    #[test]
    fn from_string_ignores_surrounding_slashes() {
        let p = Path::from_string("/a/b/c/");
        assert_eq!(p.parts(), &["a", "b", "c"]);
    }

    #[test]
    fn child_and_pop_front() {
        let p = Path::from_string("/a/b");
        let c = p.child("c");
        assert_eq!(c.parts(), &["a", "b", "c"]);
        assert_eq!(c.pop_front().parts(), &["b", "c"]);
    }

    #[test]
    fn parent_of_empty_is_none() {
        assert!(Path::empty().parent().is_none());
        assert_eq!(Path::from_string("/a").parent().unwrap(), Path::empty());
    }

    #[test]
    fn relative_to_requires_ancestor() {
        let ancestor = Path::from_string("/a");
        let descendant = Path::from_string("/a/b/c");
        assert_eq!(descendant.relative_to(&ancestor).unwrap(), Path::from_string("/b/c"));
        assert!(ancestor.relative_to(&descendant).is_none());
    }

    #[test]
    fn contains_is_reflexive() {
        let p = Path::from_string("/a/b");
        assert!(p.contains(&p));
    }

    #[test]
    fn lexicographic_ordering() {
        let mut paths = vec![
            Path::from_string("/b"),
            Path::from_string("/a/z"),
            Path::from_string("/a"),
        ];
        paths.sort();
        assert_eq!(
            paths.iter().map(|p| p.to_path_string()).collect::<Vec<_>>(),
            vec!["/a", "/a/z", "/b"]
        );
    }
}
