//! Corral error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// Operations of this crate return `anyhow::Result`, callers recover these variants with
/// `anyhow::Error::downcast`.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was malformed, nothing was applied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A required cluster state does not hold, nothing was applied.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// One or more paths of a batch update failed to commit.
    ///
    /// Paths committed before the failure are not rolled back.
    #[error("failed to commit paths: {}", failed_paths.join(", "))]
    PartialCommit { failed_paths: Vec<String> },
    /// The cluster did not converge within the allotted time.
    #[error("cluster did not converge within {waited_ms}ms")]
    ConvergenceTimeout { waited_ms: u64 },
}

/// Coordination store error variants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The expected version of a conditional write did not match the stored version.
    #[error("bad version for path {path}, expected {expected} found {found}")]
    BadVersion { path: String, expected: i64, found: i64 },
    /// The target path does not exist.
    #[error("no node exists at path {0}")]
    NoNode(String),
    /// A create-only write targeted an existing path.
    #[error("node already exists at path {0}")]
    NodeExists(String),
}
