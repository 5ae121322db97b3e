//! The replication coordinator.
//!
//! [`Replicator`] is the commit state machine binding a local transaction
//! through replication, total-order serialization, certification, and
//! commit. One value per node, shared across the embedder's threads; all
//! engine state hangs off it; there are no globals.
//!
//! # Local commit
//!
//! `commit` runs the originator's half of the protocol: drain the builder
//! into a write-set, serialize, replicate through the group, re-check the
//! cancel marker, grab the gate slot the group assigned, certify, and
//! report. On pass the embedder commits its own storage and must call
//! `committed`, which releases the gate slot; on certification failure the
//! slot is released here and the embedder rolls back.
//!
//! # Remote apply
//!
//! `recv` is the single-threaded drain of the totally-ordered delivery
//! stream. Data actions are certified under their gate slot and handed to
//! the apply pool, whose admission keeps conflicting write-sets in seqno
//! order while the slot is released for the next delivery. Membership and
//! snapshot actions advance the gate without side effects so the seqno
//! stream stays dense.
//!
//! # Locking
//!
//! `commit_mtx` guards the span between submit and gate-grab and every
//! cancel path. The gate, the transaction table, and the store each own
//! their own lock; `commit_mtx` is never held across a blocking gate
//! operation, only around table bookkeeping, so the order is acyclic.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use lockstep_error::{LockstepError, Result, Status};
use lockstep_store::WriteSetStore;
use lockstep_types::{
    seqno::is_assigned, ConnId, RowAction, RowKey, Seqno, TrxId, WriteSet, WsKind, SEQNO_ABORTED,
};
use lockstep_wire::{decode_write_set, encode_write_set, ActionKind, ComponentMsg};

use crate::apply::{apply_write_set, ApplyJob, ApplyPool, CommitHook};
use crate::callbacks::Applier;
use crate::config::{BackendKind, Config};
use crate::gate::{GateMetricsSnapshot, TotalOrderGate};
use crate::group::{Delivery, GroupComm, LoopbackGroup};
use crate::trx::TrxTable;

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ReplState {
    Initialized = 0,
    Enabled = 1,
    Disabled = 2,
}

/// Atomic counters for the coordinator.
#[derive(Debug, Default)]
struct EngineMetrics {
    replicated: AtomicU64,
    cert_pass: AtomicU64,
    cert_fail: AtomicU64,
    cancelled: AtomicU64,
    control_actions: AtomicU64,
}

/// Point-in-time snapshot of the coordinator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub replicated: u64,
    pub cert_pass: u64,
    pub cert_fail: u64,
    pub cancelled: u64,
    pub control_actions: u64,
}

/// The replication engine. See the module docs for the protocol.
pub struct Replicator {
    config: Config,
    gate: TotalOrderGate,
    table: TrxTable,
    store: Arc<WriteSetStore>,
    group: Mutex<Option<Arc<dyn GroupComm>>>,
    commit_mtx: Mutex<()>,
    state: AtomicU8,
    primary: AtomicBool,
    metrics: EngineMetrics,
}

impl Replicator {
    /// Open the engine: write-set store under `config.data_dir`, gate
    /// sized from `config.gate_capacity`, empty transaction table.
    ///
    /// # Errors
    ///
    /// I/O errors opening the store.
    pub fn new(config: Config) -> Result<Self> {
        let config = config.validated();
        let store = Arc::new(WriteSetStore::open(&config.data_dir)?);
        let gate = TotalOrderGate::new(config.gate_capacity, 1);
        info!(
            target: "lockstep_core::engine",
            data_dir = %config.data_dir.display(),
            group = %config.group_name,
            "engine initialized"
        );
        Ok(Self {
            config,
            gate,
            table: TrxTable::new(),
            store,
            group: Mutex::new(None),
            commit_mtx: Mutex::new(()),
            state: AtomicU8::new(ReplState::Initialized as u8),
            primary: AtomicBool::new(false),
            metrics: EngineMetrics::default(),
        })
    }

    // ── Lifecycle ──

    /// Open the group-communication connection configured in
    /// [`Config::backend`].
    ///
    /// # Errors
    ///
    /// `AlreadyEnabled` when a connection is open.
    pub fn enable(&self) -> Result<()> {
        let group: Arc<dyn GroupComm> = match self.config.backend {
            BackendKind::Loopback => {
                LoopbackGroup::open(&self.config.group_name, self.config.recv_queue_depth)
            }
        };
        self.enable_with(group)
    }

    /// Open the engine over an embedder-supplied substrate.
    ///
    /// # Errors
    ///
    /// `AlreadyEnabled` when a connection is open.
    pub fn enable_with(&self, group: Arc<dyn GroupComm>) -> Result<()> {
        let mut slot = self.group.lock();
        if slot.is_some() {
            return Err(LockstepError::AlreadyEnabled);
        }
        *slot = Some(group);
        self.set_state(ReplState::Enabled);
        info!(target: "lockstep_core::engine", "replication enabled");
        Ok(())
    }

    /// Close the group connection and quiesce.
    ///
    /// Ordering: new commits are rejected first, then the connection
    /// closes (the receive loop drains and exits), then the gate drains.
    /// The receive loop joins its apply workers on exit; a fully quiesced
    /// shutdown joins the thread running [`recv`](Self::recv) after this
    /// returns.
    ///
    /// # Errors
    ///
    /// `NotEnabled` when no connection is open.
    pub fn disable(&self) -> Result<()> {
        let Some(group) = self.group.lock().take() else {
            return Err(LockstepError::NotEnabled);
        };
        self.set_state(ReplState::Disabled);
        self.primary.store(false, Ordering::Release);
        group.close();
        self.gate.drain();
        info!(target: "lockstep_core::engine", "replication disabled");
        Ok(())
    }

    /// Whether this node is currently in a primary component.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    // ── Write-set building (delegated to the transaction table) ──

    /// Append an SQL statement to the transaction's write-set.
    ///
    /// # Errors
    ///
    /// `NotEnabled` when replication is not enabled.
    pub fn append_query(&self, trx_id: TrxId, query: impl Into<Vec<u8>>) -> Result<()> {
        self.require_enabled()?;
        self.table.append_query(trx_id, query);
        Ok(())
    }

    /// Append a binary row image to the transaction's write-set.
    ///
    /// # Errors
    ///
    /// `NotEnabled` when replication is not enabled.
    pub fn append_row(&self, trx_id: TrxId, row: impl Into<Vec<u8>>) -> Result<()> {
        self.require_enabled()?;
        self.table.append_row(trx_id, row);
        Ok(())
    }

    /// Append a row-key footprint to the transaction's write-set.
    ///
    /// # Errors
    ///
    /// `NotEnabled`; `KeyTooLong` for an oversized key.
    pub fn append_row_key(&self, trx_id: TrxId, key: RowKey, action: RowAction) -> Result<()> {
        self.require_enabled()?;
        self.table.append_row_key(trx_id, key, action)
    }

    /// Attach a session-variable statement to the connection's context.
    ///
    /// # Errors
    ///
    /// `NotEnabled` when replication is not enabled.
    pub fn set_variable(
        &self,
        conn_id: ConnId,
        name: impl Into<Vec<u8>>,
        query: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.require_enabled()?;
        self.table.set_variable(conn_id, name, query);
        Ok(())
    }

    /// Attach the default-database statement to the connection's context.
    ///
    /// # Errors
    ///
    /// `NotEnabled` when replication is not enabled.
    pub fn set_database(&self, conn_id: ConnId, query: impl Into<Vec<u8>>) -> Result<()> {
        self.require_enabled()?;
        self.table.set_database(conn_id, query);
        Ok(())
    }

    // ── Local commit path ──

    /// Replicate and certify a local transaction. Blocking.
    ///
    /// On `Ok` the transaction certified pass: the embedder commits its
    /// storage and must then call [`committed`](Self::committed), which
    /// releases the total-order gate slot. An empty write-set (autocommit
    /// that changed nothing) returns `Ok` immediately.
    ///
    /// # Errors
    ///
    /// `Cancelled` / `CertificationFail` / `WriteSetOverflow` map to
    /// `TrxFail` (the embedder rolls back, and `rolled_back` releases the
    /// slot where one was assigned); backend errors map to `ConnFail`;
    /// `NotEnabled` / `NonPrimary` to `NodeFail`; store I/O to `Fatal`.
    pub fn commit(&self, trx_id: TrxId, conn_id: ConnId) -> Result<()> {
        self.require_enabled()?;
        if !self.is_primary() {
            return Err(LockstepError::NonPrimary);
        }
        let group = self.group_handle()?;

        // Pre-check the cancel marker before touching the builder.
        let guard = self.commit_mtx.lock();
        if self.table.seqno_local_of(trx_id) == Some(SEQNO_ABORTED) {
            info!(target: "lockstep_core::engine", trx_id, "trx already cancelled at commit");
            self.table.erase(trx_id);
            self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(LockstepError::Cancelled { seqno_local: 0 });
        }

        let last_seen = self.store.last_committed();
        let Some(ws) = self.table.take_write_set(trx_id, conn_id, last_seen)? else {
            drop(guard);
            debug!(target: "lockstep_core::engine", trx_id, "empty write-set, nothing to replicate");
            return Ok(());
        };

        let encoded = encode_write_set(&ws, self.config.max_write_set)?;
        drop(guard);

        // Replicate. The group assigns the seqnos.
        let (seqno_global, seqno_local) = group.repl(ActionKind::Data, &encoded)?;
        self.metrics.replicated.fetch_add(1, Ordering::Relaxed);

        // Re-check the marker: cancel_commit may have run while repl
        // blocked. Record the seqnos regardless so the rollback path can
        // release the slot.
        let guard = self.commit_mtx.lock();
        if self.table.seqno_local_of(trx_id) == Some(SEQNO_ABORTED) {
            info!(
                target: "lockstep_core::engine",
                trx_id,
                seqno_local,
                "trx cancelled during replication"
            );
            self.table.assign(trx_id, seqno_local, seqno_global);
            drop(guard);
            self.gate.self_cancel(seqno_local);
            self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(LockstepError::Cancelled { seqno_local });
        }
        self.table.assign(trx_id, seqno_local, seqno_global);
        drop(guard);

        // Wait for our turn in the total order.
        if let Err(err) = self.gate.grab(seqno_local) {
            warn!(
                target: "lockstep_core::engine",
                trx_id,
                seqno_local,
                "commit aborted at the gate"
            );
            self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.table.mark_committing(trx_id);

        // Certify while holding the slot; pass also appends to the log.
        let verdict = self
            .store
            .certify(seqno_global, ws.last_seen_seqno, &ws.footprints(), &encoded)
            .inspect_err(|err| {
                error!(
                    target: "lockstep_core::engine",
                    seqno_global,
                    error = %err,
                    "write-set store append failed, node must leave the cluster"
                );
            })?;

        if verdict.passed() {
            self.metrics.cert_pass.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "lockstep_core::engine",
                trx_id,
                seqno_global,
                last_seen = ws.last_seen_seqno,
                "local commit certified"
            );
            Ok(())
        } else {
            info!(
                target: "lockstep_core::engine",
                trx_id,
                seqno_local,
                seqno_global,
                last_seen = ws.last_seen_seqno,
                "local commit failed certification"
            );
            self.metrics.cert_fail.fetch_add(1, Ordering::Relaxed);
            self.gate.release(seqno_local);
            self.table.erase(trx_id);
            Err(LockstepError::CertificationFail {
                seqno_global,
                last_seen: ws.last_seen_seqno,
            })
        }
    }

    /// Post-commit hook: the embedder durably committed the transaction.
    /// Records the commit high-water, releases the gate slot, and drops
    /// the transaction record.
    ///
    /// Lenient by design: unknown transactions (already torn down) are
    /// logged and ignored, and a disabled engine accepts the call so the
    /// embedder can finish in-flight commits during teardown.
    ///
    /// # Errors
    ///
    /// None currently; the signature leaves room for store errors.
    pub fn committed(&self, trx_id: TrxId) -> Result<()> {
        match self.table.seqnos_of(trx_id) {
            Some((seqno_local, seqno_global)) if is_assigned(seqno_local) => {
                self.store.note_committed(seqno_global);
                self.table.mark_committed(trx_id);
                self.gate.release(seqno_local);
                self.table.erase(trx_id);
                debug!(target: "lockstep_core::engine", trx_id, seqno_global, "trx committed");
            }
            _ => {
                warn!(target: "lockstep_core::engine", trx_id, "committed() for unknown trx");
            }
        }
        Ok(())
    }

    /// Post-rollback hook: releases the gate slot if one was assigned and
    /// drops the transaction record.
    ///
    /// # Errors
    ///
    /// None currently; see [`committed`](Self::committed).
    pub fn rolled_back(&self, trx_id: TrxId) -> Result<()> {
        if let Some((seqno_local, _)) = self.table.seqnos_of(trx_id) {
            if is_assigned(seqno_local) {
                self.gate.release(seqno_local);
            }
            debug!(target: "lockstep_core::engine", trx_id, seqno_local, "trx rolled back");
        }
        self.table.erase(trx_id);
        Ok(())
    }

    /// Non-blocking cancel of a replicating or gate-waiting transaction.
    ///
    /// With a slot assigned, the victim's waiter is cancelled and its
    /// `grab` returns `Cancelled`. Before assignment the transaction is
    /// marked aborted; the commit path observes the marker at its next
    /// check. Returns `Warning` in the marker case, mirroring the weaker
    /// guarantee: the victim may still be mid-replication.
    pub fn cancel_commit(&self, victim_trx: TrxId) -> Status {
        if !self.is_enabled() {
            return Status::Ok;
        }
        let _guard = self.commit_mtx.lock();
        match self.table.seqno_local_of(victim_trx) {
            Some(seqno_local) if is_assigned(seqno_local) => {
                info!(
                    target: "lockstep_core::engine",
                    victim_trx,
                    seqno_local,
                    "cancelling trx commit"
                );
                self.gate.cancel(seqno_local);
                Status::Ok
            }
            _ => {
                warn!(
                    target: "lockstep_core::engine",
                    victim_trx,
                    "no seqno for victim, marking trx aborted"
                );
                self.table.mark_aborted(victim_trx);
                Status::Warning
            }
        }
    }

    // ── Total-order execution (DDL-style statements) ──

    /// Replicate one statement for total-order execution and enter its
    /// critical section. The embedder executes the statement, then calls
    /// [`to_execute_end`](Self::to_execute_end).
    ///
    /// # Errors
    ///
    /// `WriteSetOverflow` for an oversized statement; backend errors;
    /// `NotEnabled` / `NonPrimary`.
    pub fn to_execute_start(&self, conn_id: ConnId, query: impl Into<Vec<u8>>) -> Result<()> {
        self.require_enabled()?;
        if !self.is_primary() {
            return Err(LockstepError::NonPrimary);
        }
        let group = self.group_handle()?;

        let last_seen = self.store.last_committed();
        let ws = self.table.conn_write_set(conn_id, query, last_seen);
        let encoded = encode_write_set(&ws, self.config.max_write_set)?;

        let (seqno_global, seqno_local) = group.repl(ActionKind::Data, &encoded)?;
        self.metrics.replicated.fetch_add(1, Ordering::Relaxed);

        // Nothing can cancel a connection slot; a cancelled grab here is a
        // corrupted gate.
        if let Err(err) = self.gate.grab(seqno_local) {
            panic!("total-order execution lost its own gate slot {seqno_local}: {err}");
        }
        self.table.set_exec_seqno(conn_id, seqno_local, seqno_global);
        debug!(
            target: "lockstep_core::engine",
            conn_id,
            seqno_global,
            "total-order execution admitted"
        );
        Ok(())
    }

    /// Leave the total-order critical section opened by
    /// [`to_execute_start`](Self::to_execute_start).
    ///
    /// # Errors
    ///
    /// `NoExecInFlight` when no execution is pending on the connection.
    pub fn to_execute_end(&self, conn_id: ConnId) -> Result<()> {
        self.require_enabled()?;
        let Some((seqno_local, seqno_global)) = self.table.take_exec_seqno(conn_id) else {
            return Err(LockstepError::NoExecInFlight { conn_id });
        };
        self.gate.release(seqno_local);
        debug!(
            target: "lockstep_core::engine",
            conn_id,
            seqno_global,
            "total-order execution finished"
        );
        Ok(())
    }

    // ── Receive loop ──

    /// Drain the totally-ordered delivery stream. Blocks until the group
    /// connection closes; run on a dedicated thread.
    ///
    /// Returns `Ok` after a graceful [`disable`](Self::disable); a
    /// connection failure while enabled propagates as an error.
    ///
    /// # Errors
    ///
    /// `BackendClosed` on an unexpected connection loss; store I/O errors
    /// are fatal and propagate.
    pub fn recv(&self, applier: Arc<dyn Applier>) -> Result<()> {
        let group = self.group_handle()?;

        let store = Arc::clone(&self.store);
        let on_committed: CommitHook = Arc::new(move |seqno_global| {
            store.note_committed(seqno_global);
        });
        let mut pool = ApplyPool::new(
            self.config.apply_workers,
            Arc::clone(&applier),
            on_committed,
            self.config.apply_retry_limit,
        );

        info!(target: "lockstep_core::engine", "receive loop running");
        let result = loop {
            match group.recv() {
                Ok(delivery) => {
                    if let Err(err) = self.dispatch(delivery, &applier, &pool) {
                        break Err(err);
                    }
                }
                Err(LockstepError::BackendClosed) if !self.is_enabled() => {
                    info!(target: "lockstep_core::engine", "receive loop drained, shutting down");
                    break Ok(());
                }
                Err(err) => {
                    error!(
                        target: "lockstep_core::engine",
                        error = %err,
                        "group connection failed"
                    );
                    break Err(err);
                }
            }
        };
        pool.shutdown();
        result
    }

    /// Route one delivered action.
    fn dispatch(
        &self,
        delivery: Delivery,
        applier: &Arc<dyn Applier>,
        pool: &ApplyPool,
    ) -> Result<()> {
        match delivery.kind {
            ActionKind::Data => self.process_data(delivery, applier, pool),
            ActionKind::Primary | ActionKind::NonPrimary => {
                self.process_component(&delivery);
                Ok(())
            }
            ActionKind::Snapshot => {
                self.metrics.control_actions.fetch_add(1, Ordering::Relaxed);
                self.advance_gate_only(delivery.seqno_local);
                Ok(())
            }
        }
    }

    fn process_data(
        &self,
        delivery: Delivery,
        applier: &Arc<dyn Applier>,
        pool: &ApplyPool,
    ) -> Result<()> {
        let ws = match decode_write_set(&delivery.payload) {
            Ok(ws) => ws,
            Err(err) => {
                // The slot must still advance or the gate stalls forever.
                warn!(
                    target: "lockstep_core::engine",
                    seqno_local = delivery.seqno_local,
                    error = %err,
                    "undecodable write-set skipped"
                );
                self.advance_gate_only(delivery.seqno_local);
                return Ok(());
            }
        };

        match ws.kind {
            WsKind::Trx => self.process_trx_write_set(ws, &delivery, pool),
            WsKind::Conn => {
                self.process_conn_write_set(&ws, delivery.seqno_local, applier);
                Ok(())
            }
        }
    }

    /// Remote transactional write-set: certify under the gate slot, then
    /// hand to the apply pool. The slot is released once the job is
    /// registered, so independent write-sets apply in parallel while
    /// conflicting ones serialize behind the admission rule.
    fn process_trx_write_set(
        &self,
        ws: WriteSet,
        delivery: &Delivery,
        pool: &ApplyPool,
    ) -> Result<()> {
        let seqno_local = delivery.seqno_local;
        let seqno_global = delivery.seqno_global;

        if self.gate.grab(seqno_local).is_err() {
            debug!(
                target: "lockstep_core::engine",
                seqno_local,
                "slot already cancelled, skipping delivery"
            );
            return Ok(());
        }

        let verdict = self.store.certify(
            seqno_global,
            ws.last_seen_seqno,
            &ws.footprints(),
            &delivery.payload,
        )?;

        if verdict.passed() {
            self.metrics.cert_pass.fetch_add(1, Ordering::Relaxed);
            pool.submit(ApplyJob {
                seqno_local,
                seqno_global,
                write_set: ws,
            });
        } else {
            self.metrics.cert_fail.fetch_add(1, Ordering::Relaxed);
            info!(
                target: "lockstep_core::engine",
                seqno_global,
                last_seen = ws.last_seen_seqno,
                "remote write-set failed certification, skipping apply"
            );
        }
        self.gate.release(seqno_local);
        Ok(())
    }

    /// Remote connection-level write-set: applied inline under the gate
    /// slot, no certification. A failure is logged; the statement stream
    /// stays ordered either way.
    fn process_conn_write_set(&self, ws: &WriteSet, seqno_local: Seqno, applier: &Arc<dyn Applier>) {
        if self.gate.grab(seqno_local).is_err() {
            debug!(
                target: "lockstep_core::engine",
                seqno_local,
                "slot already cancelled, skipping conn delivery"
            );
            return;
        }
        applier.ws_start(seqno_local);
        if let Err(err) = apply_write_set(applier.as_ref(), ws) {
            warn!(
                target: "lockstep_core::engine",
                seqno_local,
                error = %err,
                "connection write-set apply failed"
            );
        }
        applier.ws_start(0);
        self.gate.release(seqno_local);
    }

    /// Membership change: latch the primary flag and keep the gate dense.
    fn process_component(&self, delivery: &Delivery) {
        self.metrics.control_actions.fetch_add(1, Ordering::Relaxed);
        let primary = delivery.kind == ActionKind::Primary;
        self.primary.store(primary, Ordering::Release);

        match ComponentMsg::from_bytes(&delivery.payload) {
            Ok(comp) => info!(
                target: "lockstep_core::engine",
                primary,
                members = comp.member_count(),
                my_index = comp.my_index,
                "component change"
            ),
            Err(err) => warn!(
                target: "lockstep_core::engine",
                primary,
                error = %err,
                "component change with undecodable membership"
            ),
        }

        self.advance_gate_only(delivery.seqno_local);
    }

    /// Grab and release a control action's slot so the seqno stream stays
    /// dense. Seqno zero means the action was delivered outside the
    /// streams (the loopback backend's initial component message).
    fn advance_gate_only(&self, seqno_local: Seqno) {
        if seqno_local == 0 {
            return;
        }
        if self.gate.grab(seqno_local).is_ok() {
            self.gate.release(seqno_local);
        }
    }

    // ── Observability ──

    /// Highest global seqno committed on this node.
    #[must_use]
    pub fn last_committed(&self) -> Seqno {
        self.store.last_committed()
    }

    /// Last local seqno admitted through the total-order gate.
    #[must_use]
    pub fn gate_seqno(&self) -> Seqno {
        self.gate.seqno()
    }

    /// Drop certification-index entries below `horizon` (the oldest
    /// `last_seen_seqno` any in-flight write-set can still carry).
    /// Returns how many entries were discarded. Embedder-driven; the
    /// correctness contract only needs entries reachable by in-flight
    /// horizons.
    pub fn purge_certification(&self, horizon: Seqno) -> usize {
        self.store.purge_below(horizon)
    }

    /// Snapshot of the coordinator counters.
    #[must_use]
    pub fn metrics(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            replicated: self.metrics.replicated.load(Ordering::Relaxed),
            cert_pass: self.metrics.cert_pass.load(Ordering::Relaxed),
            cert_fail: self.metrics.cert_fail.load(Ordering::Relaxed),
            cancelled: self.metrics.cancelled.load(Ordering::Relaxed),
            control_actions: self.metrics.control_actions.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the gate counters.
    #[must_use]
    pub fn gate_metrics(&self) -> GateMetricsSnapshot {
        self.gate.metrics()
    }

    // ── Internal helpers ──

    fn set_state(&self, state: ReplState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_enabled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ReplState::Enabled as u8
    }

    fn require_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(LockstepError::NotEnabled)
        }
    }

    fn group_handle(&self) -> Result<Arc<dyn GroupComm>> {
        self.group.lock().clone().ok_or(LockstepError::NotEnabled)
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("group", &self.config.group_name)
            .field("enabled", &self.is_enabled())
            .field("primary", &self.is_primary())
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_guards() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Replicator::new(Config::new(dir.path())).unwrap();

        assert!(matches!(
            engine.commit(1, 0),
            Err(LockstepError::NotEnabled)
        ));
        assert!(matches!(engine.disable(), Err(LockstepError::NotEnabled)));

        engine.enable().unwrap();
        assert!(matches!(
            engine.enable(),
            Err(LockstepError::AlreadyEnabled)
        ));

        engine.disable().unwrap();
        assert!(matches!(engine.disable(), Err(LockstepError::NotEnabled)));
    }

    #[test]
    fn test_commit_rejected_outside_primary_component() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Replicator::new(Config::new(dir.path())).unwrap();
        engine.enable().unwrap();

        // The primary component announcement sits unprocessed in the
        // delivery queue: writes must be rejected until the receive loop
        // latches it.
        engine.append_query(1, b"INSERT INTO t VALUES(1)".to_vec()).unwrap();
        assert!(matches!(engine.commit(1, 0), Err(LockstepError::NonPrimary)));
    }

    #[test]
    fn test_cancel_before_assignment_marks_aborted() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Replicator::new(Config::new(dir.path())).unwrap();
        engine.enable().unwrap();

        assert_eq!(engine.cancel_commit(7), Status::Warning);
        // The marker makes the eventual commit fail fast.
        engine.append_query(7, b"q".to_vec()).unwrap();
        engine.primary.store(true, Ordering::Release);
        assert!(matches!(
            engine.commit(7, 0),
            Err(LockstepError::Cancelled { seqno_local: 0 })
        ));
        assert_eq!(engine.metrics().cancelled, 1);
    }

    #[test]
    fn test_cancel_when_disabled_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Replicator::new(Config::new(dir.path())).unwrap();
        assert_eq!(engine.cancel_commit(1), Status::Ok);
    }

    #[test]
    fn test_to_execute_end_without_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Replicator::new(Config::new(dir.path())).unwrap();
        engine.enable().unwrap();
        assert!(matches!(
            engine.to_execute_end(3),
            Err(LockstepError::NoExecInFlight { conn_id: 3 })
        ));
    }
}
