//! Core data model for the Lockstep replication engine.
//!
//! This crate is dependency-light on purpose: it defines the sequence-number
//! domain, the write-set representation that travels between nodes, and the
//! row-key footprints that drive certification. Everything that moves across
//! the wire or into the certification index is built from these types.

pub mod seqno;
pub mod writeset;

pub use seqno::{ConnId, Seqno, TrxId, SEQNO_ABORTED, SEQNO_NONE};
pub use writeset::{
    ColData, Footprint, ItemData, KeyKind, KeyPart, Query, RowAction, RowKey, TrxPhase, WriteSet,
    WsItem, WsKind, WsLevel,
};
