//! Sequence-number domain.
//!
//! The group-communication layer assigns every totally-ordered action two
//! dense, monotonically increasing 64-bit sequence numbers: `seqno_local`
//! (unique per node) and `seqno_global` (unique cluster-wide). Both are
//! delivered together. Zero is reserved as "not assigned"; the all-ones
//! value marks a transaction that was cancelled before it could commit.

/// A sequence number in either the local or the global stream.
pub type Seqno = u64;

/// Identifier of a transaction on its originating node.
///
/// Only meaningful on the originator; remote nodes identify the same
/// transaction by its global seqno.
pub type TrxId = u64;

/// Identifier of a client connection on its originating node.
pub type ConnId = u64;

/// Reserved "no seqno assigned yet" value.
pub const SEQNO_NONE: Seqno = 0;

/// Sentinel marking a locally-cancelled transaction.
///
/// A transaction whose record carries this seqno was aborted by
/// `cancel_commit` before (or while) it was being replicated. The commit
/// path checks for this marker on both sides of the replication call.
pub const SEQNO_ABORTED: Seqno = u64::MAX;

/// Whether `seqno` is a real assigned sequence number (not a sentinel).
#[must_use]
pub const fn is_assigned(seqno: Seqno) -> bool {
    seqno != SEQNO_NONE && seqno != SEQNO_ABORTED
}
