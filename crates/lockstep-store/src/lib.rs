//! Write-set store: the certification index plus the append-only log.
//!
//! The store answers exactly one question for the replication coordinator:
//! *may the write-set with global seqno `s` and horizon `last_seen`
//! commit?* It also durably records every write-set for which the answer
//! was yes, and tracks the node's committed high-water seqno, which becomes
//! the `last_seen_seqno` horizon of new local write-sets.

pub mod cert;
pub mod log;

pub use cert::{CertIndex, CertVerdict};
pub use log::{WriteSetLog, LOG_FILE_NAME};

use std::path::Path;

use parking_lot::Mutex;

use lockstep_error::Result;
use lockstep_types::{Footprint, Seqno};

/// The store handle shared by the coordinator and the receive loop.
#[derive(Debug)]
pub struct WriteSetStore {
    index: CertIndex,
    log: Mutex<WriteSetLog>,
}

impl WriteSetStore {
    /// Open the store under `data_dir`.
    ///
    /// # Errors
    ///
    /// I/O errors opening the log.
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            index: CertIndex::new(),
            log: Mutex::new(WriteSetLog::open(data_dir)?),
        })
    }

    /// Certify a candidate and, on pass, append its encoded form to the log.
    ///
    /// Only the holder of the total-order gate slot for `seqno_global` may
    /// call this; that discipline is what serializes index writes.
    ///
    /// # Errors
    ///
    /// I/O errors from the log append. These are fatal to the node: the
    /// verdict was pass but the write-set could not be recorded.
    pub fn certify(
        &self,
        seqno_global: Seqno,
        last_seen: Seqno,
        footprints: &[Footprint],
        encoded: &[u8],
    ) -> Result<CertVerdict> {
        let verdict = self.index.certify(seqno_global, last_seen, footprints);
        if verdict.passed() {
            self.log.lock().append(seqno_global, encoded)?;
        }
        Ok(verdict)
    }

    /// Record that `seqno_global` committed on this node.
    pub fn note_committed(&self, seqno_global: Seqno) {
        self.index.note_committed(seqno_global);
    }

    /// Highest global seqno committed on this node.
    #[must_use]
    pub fn last_committed(&self) -> Seqno {
        self.index.last_committed()
    }

    /// Garbage-collect index entries below the oldest outstanding horizon.
    pub fn purge_below(&self, horizon: Seqno) -> usize {
        self.index.purge_below(horizon)
    }

    /// Number of live footprints in the certification index.
    #[must_use]
    pub fn footprint_count(&self) -> usize {
        self.index.footprint_count()
    }
}
