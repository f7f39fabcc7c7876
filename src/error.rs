//! Crate-wide error type.
//!
//! Storage failures are recoverable: call sites log a warning and degrade to
//! empty data per the error-handling policy (reads fall back to
//! `CacheNode::empty()`, writes are best-effort and never block event
//! propagation). Invariant violations are not — they indicate a programming
//! error in the sync engine itself and callers should treat them as fatal.

use thiserror::Error;

use crate::path::Path;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Marks a call site that has detected a broken invariant of the sync engine
/// (e.g. a tagged operation routed to a view that doesn't exist, a duplicate
/// tag assigned to a new view, an attempt to prune a path under a kept
/// subtree). Per the error-handling policy these are fatal assertions, not
/// recoverable `Result`s.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            panic!("sync engine invariant violated: {}", format!($($arg)*));
        }
    };
}

pub(crate) fn invariant_violation(msg: impl Into<String>) -> Error {
    Error::Invariant(msg.into())
}

/// Logs a storage failure and returns `None`/default so reads degrade to
/// empty data instead of propagating the error onto the event-emission hot
/// path.
pub(crate) fn log_storage_failure(context: &str, path: Option<&Path>, err: &Error) {
    match path {
        Some(p) => tracing::warn!(context, path = %p, error = %err, "storage operation failed, degrading to empty data"),
        None => tracing::warn!(context, error = %err, "storage operation failed, degrading to empty data"),
    }
}
