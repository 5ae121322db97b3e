//! Write-set representation.
//!
//! A write-set is the serialized unit of replication: the row-level effects
//! and/or SQL statements produced by one transaction, plus the row-key
//! footprints that certification tests against. A write-set is immutable
//! once submitted for replication; the wire codec lives in `lockstep-wire`.

use xxhash_rust::xxh3::Xxh3;

use crate::seqno::{Seqno, TrxId};

/// Longest accepted row key, in bytes (all parts together).
pub const MAX_KEY_LEN: usize = 1024;

/// What a write-set carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsKind {
    /// One complete transaction.
    Trx = 1,
    /// One connection-level statement for direct total-order execution.
    Conn = 2,
}

impl WsKind {
    /// Wire code for this kind.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Trx),
            2 => Some(Self::Conn),
            _ => None,
        }
    }
}

/// How the payload of a write-set is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsLevel {
    /// Binary row images.
    Row = 1,
    /// Modified columns only. Declared but not applied; see the apply path.
    Cols = 2,
    /// The original SQL statements.
    Query = 3,
}

impl WsLevel {
    /// Wire code for this level.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Row),
            2 => Some(Self::Cols),
            3 => Some(Self::Query),
            _ => None,
        }
    }
}

/// Lifecycle of a local transaction, as tracked by the transaction table.
///
/// The phase only ever moves forward; `Aborted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrxPhase {
    /// Executing locally, write-set still being built.
    Local = 0,
    /// Submitted to the group, waiting for its gate slot.
    Replicating = 1,
    /// Holding its gate slot, certifying / committing.
    Committing = 2,
    /// Certified and committed.
    Committed = 3,
    /// Cancelled; terminal.
    Aborted = 4,
}

impl TrxPhase {
    /// Wire code for this phase.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Local),
            1 => Some(Self::Replicating),
            2 => Some(Self::Committing),
            3 => Some(Self::Committed),
            4 => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Whether this phase may transition into `next`.
    ///
    /// Phases never regress; `Aborted` accepts nothing.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Local => matches!(next, Self::Replicating | Self::Aborted),
            Self::Replicating => matches!(next, Self::Committing | Self::Aborted),
            Self::Committing => matches!(next, Self::Committed | Self::Aborted),
            Self::Committed | Self::Aborted => false,
        }
    }
}

/// Row operation recorded in a write-set item.
///
/// Codes are the ASCII letters of the operation, which keeps wire dumps
/// readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RowAction {
    Insert = b'I',
    Update = b'U',
    Delete = b'D',
}

impl RowAction {
    /// Wire code for this action.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'I' => Some(Self::Insert),
            b'U' => Some(Self::Update),
            b'D' => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Declared type of a key part or column value. Char-coded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    Char = b'C',
    Float = b'F',
    Int = b'I',
    Blob = b'B',
    Void = b'V',
}

impl KeyKind {
    /// Wire code for this kind.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'C' => Some(Self::Char),
            b'F' => Some(Self::Float),
            b'I' => Some(Self::Int),
            b'B' => Some(Self::Blob),
            b'V' => Some(Self::Void),
            _ => None,
        }
    }
}

/// One part of a (possibly composite) row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPart {
    pub kind: KeyKind,
    pub data: Vec<u8>,
}

/// Unique key of one row: table identifier plus key parts.
///
/// The table identifier is the `db.table` byte string; it is not assumed to
/// be UTF-8 at this level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub table: Vec<u8>,
    pub parts: Vec<KeyPart>,
}

impl RowKey {
    /// Build a single-part key with an opaque (void-typed) part.
    #[must_use]
    pub fn single(table: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            table: table.into(),
            parts: vec![KeyPart {
                kind: KeyKind::Void,
                data: key.into(),
            }],
        }
    }

    /// Total length of all key part bytes.
    #[must_use]
    pub fn key_len(&self) -> usize {
        self.parts.iter().map(|p| p.data.len()).sum()
    }
}

/// One column value, for column-level write-sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColData {
    pub column: u16,
    pub kind: KeyKind,
    pub data: Vec<u8>,
}

/// Payload attached to a write-set item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemData {
    /// Key-only item (statement-level replication carries no row image).
    None,
    /// Full binary row image.
    Row(Vec<u8>),
    /// Modified columns only.
    Cols(Vec<ColData>),
}

impl ItemData {
    /// Wire code of the data mode.
    #[must_use]
    pub const fn mode_code(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Cols(_) => 1,
            Self::Row(_) => 2,
        }
    }
}

/// One item of a write-set: a row operation, its key, and optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsItem {
    pub action: RowAction,
    pub key: RowKey,
    pub data: ItemData,
}

/// An SQL statement carried in a write-set. Not assumed UTF-8.
pub type Query = Vec<u8>;

/// Certification footprint of one row-key touch.
///
/// The certification index is keyed by a 64-bit digest of
/// `(table, key parts, action)`. The digest is deterministic across nodes:
/// every field is hashed with an explicit length prefix so that no two
/// distinct keys can collide by concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Footprint(pub u64);

impl Footprint {
    /// Digest a row key and action into a footprint.
    #[must_use]
    pub fn of(key: &RowKey, action: RowAction) -> Self {
        let mut h = Xxh3::new();
        h.update(&(key.table.len() as u32).to_le_bytes());
        h.update(&key.table);
        h.update(&(key.parts.len() as u32).to_le_bytes());
        for part in &key.parts {
            h.update(&[part.kind.code()]);
            h.update(&(part.data.len() as u32).to_le_bytes());
            h.update(&part.data);
        }
        h.update(&[action.code()]);
        Self(h.digest())
    }
}

/// The serialized unit of replication.
///
/// Immutable after submission. `last_seen_seqno` is the certification
/// horizon: the highest globally-committed seqno the originator had
/// observed when the set was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSet {
    /// Transaction id on the originator; meaningless elsewhere.
    pub local_trx_id: TrxId,
    /// Certification horizon.
    pub last_seen_seqno: Seqno,
    pub kind: WsKind,
    pub level: WsLevel,
    /// Originator-side phase at serialization time. Informational.
    pub phase: TrxPhase,
    /// Transaction body, when `level` is `Query`.
    pub queries: Vec<Query>,
    /// Connection-context statements applied before the body.
    pub conn_queries: Vec<Query>,
    /// Row operations and certification keys.
    pub items: Vec<WsItem>,
}

impl WriteSet {
    /// Whether this write-set carries no replicable work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.conn_queries.is_empty() && self.items.is_empty()
    }

    /// Certification footprints of every item, in item order.
    #[must_use]
    pub fn footprints(&self) -> Vec<Footprint> {
        self.items
            .iter()
            .map(|item| Footprint::of(&item.key, item.action))
            .collect()
    }
}
