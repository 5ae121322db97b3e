//! Apply worker pool.
//!
//! Remote write-sets that certified pass are handed to a pool of worker
//! threads. Admission respects dependencies: a job may start only when no
//! already-running job with a lower seqno touches any of the same row
//! keys. Conflicting write-sets therefore apply in seqno order while
//! independent ones parallelize.
//!
//! The dependency test is the certification test applied pairwise: J
//! conflicts with K exactly when certifying J against an index holding
//! only K's footprints (with `J.last_seen = K.seqno_local - 1`) would
//! fail, which reduces to footprint intersection.
//!
//! The registration in [`ApplyPool::submit`] happens while the caller
//! still holds the gate slot, so jobs enter the running set in total
//! order; the apply itself runs after the slot is released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use lockstep_types::{Footprint, Seqno, WriteSet, WsLevel};

use crate::callbacks::{Applier, ApplyResult};

/// Called with the global seqno once a write-set has been fully applied
/// and committed on this node.
pub type CommitHook = Arc<dyn Fn(Seqno) + Send + Sync>;

/// One certified remote write-set awaiting application.
#[derive(Debug)]
pub struct ApplyJob {
    pub seqno_local: Seqno,
    pub seqno_global: Seqno,
    pub write_set: WriteSet,
}

struct RunningJob {
    seqno_local: Seqno,
    footprints: HashSet<Footprint>,
}

#[derive(Default)]
struct PoolShared {
    running: Mutex<Vec<RunningJob>>,
    /// Signalled whenever a job leaves the running set.
    finished: Condvar,
    applied: AtomicU64,
    retried: AtomicU64,
    admission_waits: AtomicU64,
    skipped: AtomicU64,
}

impl PoolShared {
    fn end_job(&self, seqno_local: Seqno) {
        let mut running = self.running.lock();
        running.retain(|job| job.seqno_local != seqno_local);
        self.finished.notify_all();
    }
}

/// Point-in-time snapshot of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub applied: u64,
    pub retried: u64,
    pub admission_waits: u64,
    pub skipped: u64,
}

/// The pool of apply workers.
pub struct ApplyPool {
    shared: Arc<PoolShared>,
    tx: Option<Sender<ApplyJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl ApplyPool {
    /// Spawn `workers` apply threads.
    ///
    /// `on_committed` fires after each successfully applied write-set;
    /// `retry_limit` bounds apply attempts before the node declares itself
    /// divergent and panics.
    #[must_use]
    pub fn new(
        workers: usize,
        applier: Arc<dyn Applier>,
        on_committed: CommitHook,
        retry_limit: usize,
    ) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared::default());
        let (tx, rx) = bounded::<ApplyJob>(workers);

        let handles = (0..workers)
            .map(|id| {
                let rx = rx.clone();
                let shared = Arc::clone(&shared);
                let applier = Arc::clone(&applier);
                let on_committed = Arc::clone(&on_committed);
                std::thread::Builder::new()
                    .name(format!("lockstep-apply-{id}"))
                    .spawn(move || worker_loop(id, &rx, &shared, &*applier, &on_committed, retry_limit))
                    .expect("spawn apply worker")
            })
            .collect();

        info!(target: "lockstep_core::apply", workers, "apply pool started");
        Self {
            shared,
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Register a job in the running set (blocking while any running job
    /// with a lower seqno dependency-conflicts with it) and queue it for a
    /// worker.
    ///
    /// Must be called with jobs in increasing `seqno_local` order; the
    /// receive loop's delivery order guarantees this.
    pub fn submit(&self, job: ApplyJob) {
        let footprints: HashSet<Footprint> = job.write_set.footprints().into_iter().collect();

        let mut running = self.shared.running.lock();
        while running
            .iter()
            .any(|k| k.seqno_local < job.seqno_local && !k.footprints.is_disjoint(&footprints))
        {
            self.shared.admission_waits.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "lockstep_core::apply",
                seqno_local = job.seqno_local,
                "admission blocked on conflicting predecessor"
            );
            self.shared.finished.wait(&mut running);
        }
        running.push(RunningJob {
            seqno_local: job.seqno_local,
            footprints,
        });
        drop(running);

        self.tx
            .as_ref()
            .expect("pool is live until shutdown")
            .send(job)
            .expect("apply workers outlive submissions");
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            applied: self.shared.applied.load(Ordering::Relaxed),
            retried: self.shared.retried.load(Ordering::Relaxed),
            admission_waits: self.shared.admission_waits.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, drain the queue, and join the workers.
    /// Idempotent; `submit` after shutdown panics.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        info!(target: "lockstep_core::apply", "apply pool stopped");
    }
}

fn worker_loop(
    id: usize,
    rx: &Receiver<ApplyJob>,
    shared: &PoolShared,
    applier: &dyn Applier,
    on_committed: &CommitHook,
    retry_limit: usize,
) {
    while let Ok(job) = rx.recv() {
        apply_job(id, &job, shared, applier, on_committed, retry_limit);
        shared.end_job(job.seqno_local);
    }
}

fn apply_job(
    worker: usize,
    job: &ApplyJob,
    shared: &PoolShared,
    applier: &dyn Applier,
    on_committed: &CommitHook,
    retry_limit: usize,
) {
    applier.ws_start(job.seqno_local);

    if job.write_set.level == WsLevel::Cols {
        warn!(
            target: "lockstep_core::apply",
            seqno_global = job.seqno_global,
            "column-level write-sets are not applied, skipping"
        );
        shared.skipped.fetch_add(1, Ordering::Relaxed);
        applier.ws_start(0);
        return;
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome =
            apply_write_set(applier, &job.write_set).and_then(|()| applier.execute(b"commit"));
        match outcome {
            Ok(()) => {
                on_committed.as_ref()(job.seqno_global);
                shared.applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "lockstep_core::apply",
                    worker,
                    seqno_global = job.seqno_global,
                    attempt,
                    "write-set applied"
                );
                break;
            }
            Err(err) => {
                // The database is expected to be deterministic; failing to
                // apply a certified write-set means divergence.
                warn!(
                    target: "lockstep_core::apply",
                    seqno_global = job.seqno_global,
                    attempt,
                    error = %err,
                    "write-set apply failed"
                );
                shared.retried.fetch_add(1, Ordering::Relaxed);
                assert!(
                    attempt < retry_limit,
                    "apply divergence: write-set {} failed {} times: {}",
                    job.seqno_global,
                    attempt,
                    err
                );
            }
        }
    }

    applier.ws_start(0);
}

/// Apply one write-set body through the embedder callbacks: connection
/// context first, then the body in recorded order.
pub fn apply_write_set(applier: &dyn Applier, ws: &WriteSet) -> ApplyResult {
    for query in &ws.conn_queries {
        applier.execute(query)?;
    }

    match ws.level {
        WsLevel::Query | WsLevel::Cols => {
            for query in &ws.queries {
                applier.execute(query)?;
            }
        }
        WsLevel::Row => {
            for item in &ws.items {
                if let lockstep_types::ItemData::Row(row) = &item.data {
                    applier.apply_row(row)?;
                }
            }
        }
    }
    Ok(())
}
