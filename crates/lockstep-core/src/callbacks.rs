//! Embedder callbacks.
//!
//! The database server supplies one [`Applier`] to `recv`; the receive loop
//! and the apply workers drive every remote write-set through it. The
//! engine assumes the database is deterministic: applying the same
//! write-set stream yields the same state on every node.

use std::fmt;

use lockstep_types::Seqno;

/// Error returned by an embedder callback. Opaque to the engine, which
/// only logs it and retries; a persistent apply failure means the node has
/// diverged and is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError(pub String);

impl ApplyError {
    /// Create an apply error.
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ApplyError {}

/// Result of one callback invocation.
pub type ApplyResult = std::result::Result<(), ApplyError>;

/// What the embedding database server must provide to apply remote
/// write-sets.
pub trait Applier: Send + Sync {
    /// Execute one SQL statement against the local database.
    fn execute(&self, sql: &[u8]) -> ApplyResult;

    /// Apply one binary row image against the local database.
    fn apply_row(&self, row: &[u8]) -> ApplyResult;

    /// Called before a write-set is applied with its local seqno, and with
    /// zero once application finished. Lets the embedder tag the applying
    /// session.
    fn ws_start(&self, seqno: Seqno) {
        let _ = seqno;
    }
}
