//! Lockstep: a synchronous multi-master replication engine.
//!
//! A database server embeds this crate to obtain virtually synchronous,
//! certification-based replication: every local transaction is broadcast
//! to the cluster as a serialized write-set, the cluster agrees a global
//! total order, and each node independently certifies each write-set
//! against prior committed work and, on pass, applies it in order.
//!
//! The moving parts:
//!
//! - [`gate::TotalOrderGate`] — strict in-order critical sections indexed
//!   by the local seqno stream.
//! - [`trx::TrxTable`] — local transactions, write-set builders, and
//!   connection contexts.
//! - [`engine::Replicator`] — the commit state machine tying replication,
//!   the gate, and certification together; the embedder API.
//! - [`apply::ApplyPool`] — dependency-aware parallel application of
//!   remote write-sets.
//! - [`group::GroupComm`] — the interface to the total-order broadcast
//!   substrate, with [`group::LoopbackGroup`] as the in-process backend.
//!
//! The write-set store (certification index + append-only log) lives in
//! `lockstep-store`; wire formats in `lockstep-wire`.

pub mod apply;
pub mod callbacks;
pub mod config;
pub mod engine;
pub mod gate;
pub mod group;
pub mod trx;

pub use apply::{ApplyJob, ApplyPool, PoolMetricsSnapshot};
pub use callbacks::{Applier, ApplyError, ApplyResult};
pub use config::{BackendKind, Config};
pub use engine::{EngineMetricsSnapshot, Replicator};
pub use gate::{GateMetricsSnapshot, TotalOrderGate};
pub use group::{Delivery, GroupComm, LoopbackGroup};
pub use trx::TrxTable;
