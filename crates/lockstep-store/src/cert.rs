//! Certification index.
//!
//! Maps each row-key footprint to the highest global seqno that committed a
//! write-set touching that key. A candidate with global seqno `s_new` and
//! horizon `last_seen` passes iff none of its footprints is recorded at a
//! seqno `s_x` with `last_seen < s_x < s_new`; on pass its own footprints
//! are recorded at `s_new`, overwriting older entries.
//!
//! Mutation is single-writer: only the holder of the total-order gate slot
//! for `s_new` certifies, so writes are already serialized in seqno order.
//! The mutex here is what makes each verdict safely publishable to the next
//! holder, not a contention point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use lockstep_types::{Footprint, Seqno};

/// Outcome of a certification test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertVerdict {
    /// No overlap in the certification gap; footprints recorded.
    Pass,
    /// A footprint was committed inside the gap; nothing recorded.
    Fail {
        /// The overlapping footprint.
        footprint: Footprint,
        /// The seqno that committed it.
        committed_at: Seqno,
    },
}

impl CertVerdict {
    /// Whether the candidate may commit.
    #[must_use]
    pub const fn passed(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// The in-memory certification index.
#[derive(Debug, Default)]
pub struct CertIndex {
    entries: Mutex<HashMap<Footprint, Seqno>>,
    /// Highest global seqno recorded as committed on this node.
    last_committed: AtomicU64,
}

impl CertIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the certification test for a candidate and, on pass, record its
    /// footprints at `seqno_global`.
    pub fn certify(
        &self,
        seqno_global: Seqno,
        last_seen: Seqno,
        footprints: &[Footprint],
    ) -> CertVerdict {
        let mut entries = self.entries.lock();

        for &fp in footprints {
            if let Some(&committed_at) = entries.get(&fp) {
                if last_seen < committed_at && committed_at < seqno_global {
                    trace!(
                        target: "lockstep_store::cert",
                        seqno_global,
                        last_seen,
                        committed_at,
                        "certification conflict"
                    );
                    return CertVerdict::Fail {
                        footprint: fp,
                        committed_at,
                    };
                }
            }
        }

        for &fp in footprints {
            entries.insert(fp, seqno_global);
        }

        trace!(
            target: "lockstep_store::cert",
            seqno_global,
            last_seen,
            footprints = footprints.len(),
            "certification pass"
        );
        CertVerdict::Pass
    }

    /// Record that `seqno_global` has committed on this node.
    ///
    /// Monotonic: an older seqno never lowers the high-water mark.
    pub fn note_committed(&self, seqno_global: Seqno) {
        self.last_committed.fetch_max(seqno_global, Ordering::Release);
    }

    /// Highest global seqno recorded as committed. This is the horizon
    /// stamped into new local write-sets as `last_seen_seqno`.
    #[must_use]
    pub fn last_committed(&self) -> Seqno {
        self.last_committed.load(Ordering::Acquire)
    }

    /// Drop entries below `horizon` (the oldest outstanding `last_seen`).
    /// Returns how many entries were removed.
    pub fn purge_below(&self, horizon: Seqno) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, &mut s| s >= horizon);
        before - entries.len()
    }

    /// Number of live footprint entries.
    #[must_use]
    pub fn footprint_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use lockstep_types::{RowAction, RowKey};

    use super::*;

    fn fp(table: &str, key: &[u8]) -> Footprint {
        Footprint::of(
            &RowKey::single(table.as_bytes().to_vec(), key.to_vec()),
            RowAction::Update,
        )
    }

    #[test]
    fn test_empty_index_passes() {
        let index = CertIndex::new();
        assert_eq!(index.certify(1, 0, &[fp("t", b"k")]), CertVerdict::Pass);
        assert_eq!(index.footprint_count(), 1);
    }

    #[test]
    fn test_conflict_inside_gap_fails() {
        let index = CertIndex::new();
        // A commits key k at 11; B with last_seen 10 overlaps.
        assert!(index.certify(11, 10, &[fp("t", b"k")]).passed());
        let verdict = index.certify(12, 10, &[fp("t", b"k")]);
        assert_eq!(
            verdict,
            CertVerdict::Fail {
                footprint: fp("t", b"k"),
                committed_at: 11
            }
        );
        // Failed candidates leave no trace: index still says 11.
        assert!(index.certify(13, 11, &[fp("t", b"k")]).passed());
    }

    #[test]
    fn test_horizon_covers_conflict() {
        let index = CertIndex::new();
        assert!(index.certify(11, 10, &[fp("t", b"k")]).passed());
        // B observed 11 before building: no conflict.
        assert!(index.certify(12, 11, &[fp("t", b"k")]).passed());
    }

    #[test]
    fn test_disjoint_keys_pass() {
        let index = CertIndex::new();
        assert!(index.certify(11, 10, &[fp("t", b"a")]).passed());
        assert!(index.certify(12, 10, &[fp("t", b"b")]).passed());
    }

    #[test]
    fn test_pass_overwrites_older_entry() {
        let index = CertIndex::new();
        assert!(index.certify(5, 0, &[fp("t", b"k")]).passed());
        assert!(index.certify(9, 5, &[fp("t", b"k")]).passed());
        // Entry now at 9: a candidate that saw 5 but not 9 must fail.
        let verdict = index.certify(12, 5, &[fp("t", b"k")]);
        assert_eq!(
            verdict,
            CertVerdict::Fail {
                footprint: fp("t", b"k"),
                committed_at: 9
            }
        );
        assert_eq!(index.footprint_count(), 1);
    }

    #[test]
    fn test_last_committed_is_monotonic() {
        let index = CertIndex::new();
        assert_eq!(index.last_committed(), 0);
        index.note_committed(7);
        index.note_committed(3);
        assert_eq!(index.last_committed(), 7);
        index.note_committed(9);
        assert_eq!(index.last_committed(), 9);
    }

    #[test]
    fn test_purge_below() {
        let index = CertIndex::new();
        assert!(index.certify(3, 0, &[fp("t", b"a")]).passed());
        assert!(index.certify(5, 3, &[fp("t", b"b")]).passed());
        assert!(index.certify(8, 5, &[fp("t", b"c")]).passed());
        assert_eq!(index.purge_below(5), 1);
        assert_eq!(index.footprint_count(), 2);
        // Purged entries are gone; a stale-horizon candidate on "a" passes.
        assert!(index.certify(9, 0, &[fp("t", b"a")]).passed());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        /// A replicated stream: per step, a horizon lag and a handful of
        /// key ids. Seqnos are the step indices.
        fn arb_stream() -> impl Strategy<Value = Vec<(u64, Vec<u8>)>> {
            proptest::collection::vec(
                (0u64..8, proptest::collection::vec(0u8..12, 1..4)),
                1..40,
            )
        }

        proptest! {
            /// Verdicts are a pure function of the stream: independent
            /// replays agree.
            #[test]
            fn prop_verdicts_replay_identically(stream in arb_stream()) {
                let run = |stream: &[(u64, Vec<u8>)]| -> Vec<bool> {
                    let index = CertIndex::new();
                    stream
                        .iter()
                        .enumerate()
                        .map(|(i, (lag, keys))| {
                            let seqno = i as Seqno + 1;
                            let fps: Vec<Footprint> =
                                keys.iter().map(|k| fp("t", &[*k])).collect();
                            index
                                .certify(seqno, seqno.saturating_sub(1 + lag), &fps)
                                .passed()
                        })
                        .collect()
                };
                prop_assert_eq!(run(&stream), run(&stream));
            }

            /// Serializability: a passing write-set observed every earlier
            /// commit of every key it touches, i.e. its horizon is at or
            /// past each key's previous committer.
            #[test]
            fn prop_pass_implies_horizon_covers_prior_commits(stream in arb_stream()) {
                let index = CertIndex::new();
                let mut mirror: std::collections::HashMap<Footprint, Seqno> =
                    std::collections::HashMap::new();

                for (i, (lag, keys)) in stream.iter().enumerate() {
                    let seqno = i as Seqno + 1;
                    let last_seen = seqno.saturating_sub(1 + lag);
                    let fps: Vec<Footprint> = keys.iter().map(|k| fp("t", &[*k])).collect();

                    if index.certify(seqno, last_seen, &fps).passed() {
                        for f in &fps {
                            if let Some(&prior) = mirror.get(f) {
                                prop_assert!(
                                    last_seen >= prior,
                                    "pass at {seqno} but key committed at {prior} > horizon {last_seen}"
                                );
                            }
                        }
                        for f in &fps {
                            mirror.insert(*f, seqno);
                        }
                    }
                }
            }
        }
    }

    /// Replaying the same sequence of write-sets yields identical verdicts.
    #[test]
    fn test_certification_is_deterministic() {
        let sequence: Vec<(Seqno, Seqno, Vec<Footprint>)> = vec![
            (11, 10, vec![fp("t", b"k")]),
            (12, 10, vec![fp("t", b"k")]),
            (13, 11, vec![fp("t", b"m"), fp("t", b"k")]),
            (14, 12, vec![fp("t", b"m")]),
            (15, 0, vec![fp("t", b"z")]),
        ];

        let run = || -> Vec<bool> {
            let index = CertIndex::new();
            sequence
                .iter()
                .map(|(sg, seen, fps)| index.certify(*sg, *seen, fps).passed())
                .collect()
        };

        let first = run();
        for _ in 0..3 {
            assert_eq!(run(), first);
        }
    }
}
