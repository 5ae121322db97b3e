use lockstep_types::Seqno;
use thiserror::Error;

/// Primary error type for Lockstep operations.
///
/// Structured variants for the recoverable cases; genuine invariant
/// violations (gate ring overflow, cancel of the current holder, impossible
/// waiter states) are panics, not error values, because a node that
/// observes one is no longer fit to serve.
#[derive(Error, Debug)]
pub enum LockstepError {
    // === Transaction errors (caller rolls back, may retry) ===
    /// The write-set overlapped a concurrently committed one.
    #[error("certification failed for seqno {seqno_global}: conflict in ({last_seen}, {seqno_global})")]
    CertificationFail {
        seqno_global: Seqno,
        last_seen: Seqno,
    },

    /// The transaction was cancelled while waiting for its gate slot.
    #[error("commit cancelled at gate slot {seqno_local}")]
    Cancelled { seqno_local: Seqno },

    /// Serialized write-set exceeds the configured bound.
    #[error("write-set too large: {size} bytes (max {max})")]
    WriteSetOverflow { size: usize, max: usize },

    /// No transaction with this id is known to the table.
    #[error("unknown transaction: {trx_id}")]
    TrxUnknown { trx_id: u64 },

    /// A body row was appended without a matching row key.
    #[error("malformed write-set for transaction {trx_id}: {rows} rows but {keys} keys")]
    RowWithoutKey {
        trx_id: u64,
        rows: usize,
        keys: usize,
    },

    /// A row key exceeds the length limit.
    #[error("row key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    // === Connection errors (embedder closes the client) ===
    /// No connection with this id is known.
    #[error("unknown connection: {conn_id}")]
    ConnUnknown { conn_id: u64 },

    /// A total-order execution was ended without being started.
    #[error("connection {conn_id} has no total-order execution in flight")]
    NoExecInFlight { conn_id: u64 },

    /// Wire decoding failed.
    #[error("codec error: {detail}")]
    Codec { detail: String },

    /// The group-communication backend rejected an operation.
    #[error("group backend error: {detail}")]
    Backend { detail: String },

    // === Node errors (embedder re-initialises the engine) ===
    /// The group-communication connection is closed.
    #[error("group backend is closed")]
    BackendClosed,

    /// Engine operation attempted before `enable()`.
    #[error("replication is not enabled")]
    NotEnabled,

    /// `enable()` called on an already-enabled engine.
    #[error("replication is already enabled")]
    AlreadyEnabled,

    /// This node is not part of the primary component; writes are rejected.
    #[error("node is not in the primary component")]
    NonPrimary,

    // === Fatal ===
    /// Write-set store I/O failed; the node must leave the cluster.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Embedder-visible status codes.
///
/// These are what the database server branches on at its integration
/// points; `LockstepError::status` maps every error to one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// Success.
    Ok = 0,
    /// Minor anomaly; logged, caller may continue.
    Warning = 1,
    /// Transaction aborted; caller rolls back and may retry.
    TrxFail = 2,
    /// Client connection error; embedder closes the client.
    ConnFail = 3,
    /// Node-level error; engine must be re-initialised.
    NodeFail = 4,
    /// Unrecoverable; the embedding server must abort.
    Fatal = 5,
}

impl LockstepError {
    /// Map this error to the embedder status code.
    #[must_use]
    pub const fn status(&self) -> Status {
        match self {
            Self::CertificationFail { .. }
            | Self::Cancelled { .. }
            | Self::WriteSetOverflow { .. }
            | Self::TrxUnknown { .. }
            | Self::RowWithoutKey { .. }
            | Self::KeyTooLong { .. } => Status::TrxFail,
            Self::ConnUnknown { .. }
            | Self::NoExecInFlight { .. }
            | Self::Codec { .. }
            | Self::Backend { .. } => Status::ConnFail,
            Self::BackendClosed
            | Self::NotEnabled
            | Self::AlreadyEnabled
            | Self::NonPrimary => Status::NodeFail,
            Self::Io(_) => Status::Fatal,
        }
    }

    /// Whether the operation may succeed if simply retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CertificationFail { .. } | Self::Cancelled { .. }
        )
    }

    /// Whether the node must stop serving after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.status(), Status::Fatal)
    }

    /// Create a codec error.
    pub fn codec(detail: impl Into<String>) -> Self {
        Self::Codec {
            detail: detail.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(detail: impl Into<String>) -> Self {
        Self::Backend {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `LockstepError`.
pub type Result<T> = std::result::Result<T, LockstepError>;
