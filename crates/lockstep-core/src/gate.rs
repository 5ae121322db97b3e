//! Total-order gate.
//!
//! A synchronization primitive realising strict in-order critical sections
//! indexed by a dense monotonic seqno. Although the group-communication
//! layer hands out seqnos in total order, application threads race each
//! other between receiving a seqno and entering the critical section; the
//! gate restores the order: `grab(s)` admits its caller only once every
//! seqno below `s` has been released or cancelled.
//!
//! Waiters live in a ring indexed by `seqno & mask`, one condition variable
//! per slot, so a release signals exactly the next waiter instead of a
//! thundering herd. Density of the seqno stream is what makes the ring
//! correct: the gate panics if the in-flight window ever exceeds the ring.
//!
//! State machine per slot:
//!
//! ```text
//! RELEASED ──grab──▶ HOLDER ──release──▶ RELEASED
//! RELEASED ──grab──▶ WAIT ──signal──▶ HOLDER
//! WAIT / RELEASED ──cancel / self_cancel──▶ CANCELED ──sweep──▶ RELEASED
//! ```
//!
//! Invariant violations (ring overflow, cancelling the holder, releasing a
//! slot that is not held) are programming errors on the node and panic.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use lockstep_error::{LockstepError, Result};
use lockstep_types::Seqno;

/// State of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterState {
    /// Free slot; a grab may enter.
    Released,
    /// A thread is parked on this slot's condvar.
    Wait,
    /// The current total-order holder.
    Holder,
    /// Cancelled; the next release sweep will free it.
    Canceled,
}

struct GateCore {
    /// The next seqno eligible to hold the gate.
    current: Seqno,
    slots: Box<[WaiterState]>,
    /// Threads parked in `grab`.
    waiting: usize,
    /// Whether `current`'s slot is held right now.
    holding: bool,
}

/// Atomic counters for gate observability.
#[derive(Debug, Default)]
pub struct GateMetrics {
    pub grabs: AtomicU64,
    pub waits: AtomicU64,
    pub cancels: AtomicU64,
    pub swept: AtomicU64,
}

/// Point-in-time snapshot of [`GateMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateMetricsSnapshot {
    pub grabs: u64,
    pub waits: u64,
    pub cancels: u64,
    pub swept: u64,
}

/// The total-order gate.
pub struct TotalOrderGate {
    core: Mutex<GateCore>,
    /// One condvar per ring slot, parallel to `core.slots`.
    conds: Box<[Condvar]>,
    /// Signalled whenever the gate becomes idle (no holder, no waiters).
    idle: Condvar,
    mask: u64,
    metrics: GateMetrics,
}

impl TotalOrderGate {
    /// Create a gate admitting `start` first, with room for at least
    /// `capacity` in-flight seqnos (rounded up to a power of two).
    ///
    /// `capacity` must cover the maximum number of seqnos between the
    /// oldest unreleased and the newest assigned one; overflow is fatal.
    #[must_use]
    pub fn new(capacity: usize, start: Seqno) -> Self {
        let len = capacity.max(2).next_power_of_two();
        Self {
            core: Mutex::new(GateCore {
                current: start,
                slots: vec![WaiterState::Released; len].into_boxed_slice(),
                waiting: 0,
                holding: false,
            }),
            conds: (0..len).map(|_| Condvar::new()).collect(),
            idle: Condvar::new(),
            mask: (len - 1) as u64,
            metrics: GateMetrics::default(),
        }
    }

    #[inline]
    fn slot(&self, seqno: Seqno) -> usize {
        (seqno & self.mask) as usize
    }

    /// Block until `seqno` is at the head of the total order and enter the
    /// critical section as its holder.
    ///
    /// # Errors
    ///
    /// `Cancelled` when the slot was cancelled before or while waiting.
    ///
    /// # Panics
    ///
    /// On a grab of an already-admitted seqno, on ring overflow, or on an
    /// impossible slot state; all are node-fatal invariant violations.
    pub fn grab(&self, seqno: Seqno) -> Result<()> {
        self.metrics.grabs.fetch_add(1, Ordering::Relaxed);
        let idx = self.slot(seqno);
        let mut core = self.core.lock();

        match core.slots[idx] {
            WaiterState::Canceled => {
                // Left in place for the release sweep.
                Err(LockstepError::Cancelled { seqno_local: seqno })
            }
            WaiterState::Released => {
                if seqno == core.current {
                    core.slots[idx] = WaiterState::Holder;
                    core.holding = true;
                    trace!(target: "lockstep_core::gate", seqno, "grabbed immediately");
                    Ok(())
                } else if seqno < core.current {
                    panic!(
                        "gate: grab of outdated seqno {seqno} (gate at {})",
                        core.current
                    );
                } else {
                    assert!(
                        seqno - core.current <= self.mask,
                        "gate: ring overflow, seqno {seqno} too far ahead of {}",
                        core.current
                    );
                    self.metrics.waits.fetch_add(1, Ordering::Relaxed);
                    core.slots[idx] = WaiterState::Wait;
                    core.waiting += 1;
                    // parking_lot condvars do not wake spuriously; one wait,
                    // then the state tells us why we woke.
                    self.conds[idx].wait(&mut core);
                    core.waiting -= 1;
                    match core.slots[idx] {
                        WaiterState::Canceled => {
                            if core.waiting == 0 && !core.holding {
                                self.idle.notify_all();
                            }
                            Err(LockstepError::Cancelled { seqno_local: seqno })
                        }
                        WaiterState::Wait => {
                            core.slots[idx] = WaiterState::Holder;
                            core.holding = true;
                            trace!(target: "lockstep_core::gate", seqno, "grabbed after wait");
                            Ok(())
                        }
                        other => panic!(
                            "gate: invalid waiter state {other:?} after wake for seqno {seqno}"
                        ),
                    }
                }
            }
            other => panic!("gate: ring wrap at seqno {seqno}, slot busy in {other:?}"),
        }
    }

    /// Leave the critical section for `seqno` and admit the next seqno.
    ///
    /// Accepted in three shapes: the holder releasing; a premature release
    /// of a cancelled future slot (left for the sweep); and a release of a
    /// seqno the sweep already freed (a no-op). Anything else panics.
    pub fn release(&self, seqno: Seqno) {
        let idx = self.slot(seqno);
        let mut core = self.core.lock();

        if seqno == core.current {
            match core.slots[idx] {
                // Normal holder release, or a self-cancelled slot that
                // became head and is being released by its originator's
                // rollback path.
                WaiterState::Holder | WaiterState::Canceled => {}
                other => panic!("gate: release of {seqno} in state {other:?}"),
            }
            core.slots[idx] = WaiterState::Released;
            core.holding = false;

            // Advance past every trailing cancelled slot.
            core.current += 1;
            loop {
                let head = self.slot(core.current);
                if core.slots[head] == WaiterState::Canceled {
                    core.slots[head] = WaiterState::Released;
                    core.current += 1;
                    self.metrics.swept.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
            }

            let head = self.slot(core.current);
            if core.slots[head] == WaiterState::Wait {
                self.conds[head].notify_one();
            }
            trace!(target: "lockstep_core::gate", seqno, current = core.current, "released");

            if core.waiting == 0 && !core.holding {
                self.idle.notify_all();
            }
        } else if seqno > core.current {
            assert!(
                core.slots[idx] == WaiterState::Canceled,
                "gate: premature release of {seqno} in state {:?}",
                core.slots[idx]
            );
            // Leave CANCELED so the real release sweep can free it.
        } else {
            assert!(
                core.slots[idx] == WaiterState::Released,
                "gate: outdated release of {seqno} in state {:?}",
                core.slots[idx]
            );
        }
    }

    /// Cancel a waiter that has not yet been admitted.
    ///
    /// # Panics
    ///
    /// If `seqno` is the current holder or already admitted: cancellation
    /// is only legal for seqnos still ahead of the gate.
    pub fn cancel(&self, seqno: Seqno) {
        let idx = self.slot(seqno);
        let mut core = self.core.lock();
        assert!(
            seqno > core.current,
            "gate: cancel of seqno {seqno} at or behind the gate ({})",
            core.current
        );
        self.metrics.cancels.fetch_add(1, Ordering::Relaxed);
        core.slots[idx] = WaiterState::Canceled;
        self.conds[idx].notify_one();
        trace!(target: "lockstep_core::gate", seqno, "cancelled");
    }

    /// Mark a slot cancelled on behalf of an originator that will never
    /// try to grab it (it aborted between replication and the gate).
    ///
    /// Unlike [`cancel`](Self::cancel) the seqno may already be at the
    /// head; no thread is waiting there, so nothing is signalled.
    pub fn self_cancel(&self, seqno: Seqno) {
        let idx = self.slot(seqno);
        let mut core = self.core.lock();
        assert!(
            seqno >= core.current,
            "gate: self-cancel of seqno {seqno} already passed by the gate ({})",
            core.current
        );
        self.metrics.cancels.fetch_add(1, Ordering::Relaxed);
        core.slots[idx] = WaiterState::Canceled;
        trace!(target: "lockstep_core::gate", seqno, "self-cancelled");
    }

    /// The last seqno admitted through the gate.
    #[must_use]
    pub fn seqno(&self) -> Seqno {
        self.core.lock().current - 1
    }

    /// Block until the gate is idle: no holder and no parked waiters.
    /// Used by engine teardown after commits have stopped.
    pub fn drain(&self) {
        let mut core = self.core.lock();
        while core.waiting > 0 || core.holding {
            self.idle.wait(&mut core);
        }
    }

    /// Snapshot of the gate counters.
    #[must_use]
    pub fn metrics(&self) -> GateMetricsSnapshot {
        GateMetricsSnapshot {
            grabs: self.metrics.grabs.load(Ordering::Relaxed),
            waits: self.metrics.waits.load(Ordering::Relaxed),
            cancels: self.metrics.cancels.load(Ordering::Relaxed),
            swept: self.metrics.swept.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TotalOrderGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("TotalOrderGate")
            .field("current", &core.current)
            .field("waiting", &core.waiting)
            .field("holding", &core.holding)
            .field("ring", &self.conds.len())
            .finish()
    }
}
