//! Engine configuration.

use std::path::PathBuf;

use lockstep_wire::DEFAULT_MAX_WRITE_SET;

/// Which group-communication backend `enable` opens.
///
/// Anything beyond the in-process backend is the embedder's business: it
/// implements [`GroupComm`](crate::group::GroupComm) over its substrate of
/// choice and hands it to `enable_with`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// In-process single-node backend.
    #[default]
    Loopback,
}

/// Configuration for a [`Replicator`](crate::Replicator).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the write-set store.
    pub data_dir: PathBuf,

    /// Symbolic group name; doubles as the unique group id.
    pub group_name: String,

    /// Backend-specific dial address. Unused by the loopback backend.
    pub address: Option<String>,

    /// Backend opened by `enable`.
    pub backend: BackendKind,

    /// Gate ring capacity: must cover the maximum number of in-flight
    /// seqnos, and is rounded up to a power of two.
    ///
    /// Default: 16,384.
    pub gate_capacity: usize,

    /// Apply worker threads draining remote write-sets. Typically 2–8.
    pub apply_workers: usize,

    /// Bound on one serialized write-set; larger local commits fail with
    /// `TrxFail` instead of fragmenting.
    pub max_write_set: usize,

    /// Attempts at applying one remote write-set before the node declares
    /// itself divergent and aborts.
    pub apply_retry_limit: usize,

    /// Depth of the loopback delivery queue.
    pub recv_queue_depth: usize,
}

impl Config {
    /// Configuration with defaults for everything but the data directory.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            group_name: "lockstep".to_owned(),
            address: None,
            backend: BackendKind::Loopback,
            gate_capacity: 16_384,
            apply_workers: 2,
            max_write_set: DEFAULT_MAX_WRITE_SET,
            apply_retry_limit: 8,
            recv_queue_depth: 1024,
        }
    }

    /// Clamp nonsensical values into their working ranges.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.gate_capacity = self.gate_capacity.max(2);
        self.apply_workers = self.apply_workers.max(1);
        self.apply_retry_limit = self.apply_retry_limit.max(1);
        self.recv_queue_depth = self.recv_queue_depth.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("/tmp/ls");
        assert_eq!(config.backend, BackendKind::Loopback);
        assert_eq!(config.gate_capacity, 16_384);
        assert_eq!(config.max_write_set, DEFAULT_MAX_WRITE_SET);
    }

    #[test]
    fn test_validated_clamps_zeroes() {
        let config = Config {
            gate_capacity: 0,
            apply_workers: 0,
            apply_retry_limit: 0,
            recv_queue_depth: 0,
            ..Config::new("/tmp/ls")
        }
        .validated();
        assert_eq!(config.gate_capacity, 2);
        assert_eq!(config.apply_workers, 1);
        assert_eq!(config.apply_retry_limit, 1);
        assert_eq!(config.recv_queue_depth, 1);
    }
}
