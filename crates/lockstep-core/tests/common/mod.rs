//! Shared fixtures for the replication scenario tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use lockstep_core::{Applier, ApplyResult, Config, LoopbackGroup, Replicator};
use lockstep_types::{
    ItemData, RowAction, RowKey, Seqno, TrxId, TrxPhase, WriteSet, WsItem, WsKind, WsLevel,
};
use lockstep_wire::{encode_write_set, DEFAULT_MAX_WRITE_SET};

/// Statement marker that makes [`TestApplier`] sleep, holding a worker busy.
pub const STALL: &[u8] = b"stall";

/// Records everything the engine drives through the callbacks.
#[derive(Default)]
pub struct TestApplier {
    pub statements: Mutex<Vec<Vec<u8>>>,
    pub rows: Mutex<Vec<Vec<u8>>>,
    pub ws_starts: Mutex<Vec<Seqno>>,
    /// How long to sleep on a [`STALL`] statement.
    pub stall: Duration,
}

impl TestApplier {
    pub fn stalling(stall: Duration) -> Self {
        Self {
            stall,
            ..Self::default()
        }
    }

    /// Applied statements, commits filtered out.
    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.statements
            .lock()
            .iter()
            .filter(|s| s.as_slice() != b"commit")
            .cloned()
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|s| s.as_slice() == b"commit")
            .count()
    }
}

impl Applier for TestApplier {
    fn execute(&self, sql: &[u8]) -> ApplyResult {
        if sql == STALL && !self.stall.is_zero() {
            std::thread::sleep(self.stall);
        }
        self.statements.lock().push(sql.to_vec());
        Ok(())
    }

    fn apply_row(&self, row: &[u8]) -> ApplyResult {
        self.rows.lock().push(row.to_vec());
        Ok(())
    }

    fn ws_start(&self, seqno: Seqno) {
        self.ws_starts.lock().push(seqno);
    }
}

/// A running single-node engine over a loopback group.
pub struct TestNode {
    pub engine: Arc<Replicator>,
    pub group: Arc<LoopbackGroup>,
    pub applier: Arc<TestApplier>,
    pub recv_thread: Option<JoinHandle<lockstep_error::Result<()>>>,
    _data_dir: TempDir,
}

impl TestNode {
    /// Engine + loopback + receive thread, with the primary component
    /// latched before returning.
    pub fn start(applier: TestApplier) -> Self {
        let data_dir = TempDir::new().expect("tempdir");
        let engine =
            Arc::new(Replicator::new(Config::new(data_dir.path())).expect("open engine"));
        let group = LoopbackGroup::open("test", 1024);
        engine
            .enable_with(group.clone() as Arc<dyn lockstep_core::GroupComm>)
            .expect("enable");

        let applier = Arc::new(applier);
        let recv_thread = {
            let engine = Arc::clone(&engine);
            let applier = Arc::clone(&applier) as Arc<dyn Applier>;
            std::thread::spawn(move || engine.recv(applier))
        };

        assert!(
            wait_until(Duration::from_secs(5), || engine.is_primary()),
            "primary component must be latched"
        );

        Self {
            engine,
            group,
            applier,
            recv_thread: Some(recv_thread),
            _data_dir: data_dir,
        }
    }

    /// Run one local single-statement transaction to completion.
    pub fn commit_one(&self, trx_id: TrxId, key: &[u8], body: &[u8]) {
        self.engine.append_query(trx_id, body.to_vec()).expect("append");
        self.engine
            .append_row_key(
                trx_id,
                RowKey::single(b"db.t".to_vec(), key.to_vec()),
                RowAction::Update,
            )
            .expect("append key");
        self.engine.commit(trx_id, 0).expect("commit");
        self.engine.committed(trx_id).expect("committed");
    }

    /// Disable and join the receive thread.
    pub fn stop(mut self) {
        self.engine.disable().expect("disable");
        if let Some(handle) = self.recv_thread.take() {
            handle
                .join()
                .expect("recv thread join")
                .expect("graceful recv shutdown");
        }
    }
}

/// Encode a transactional write-set the way a remote node would.
pub fn remote_trx_ws(trx_id: TrxId, last_seen: Seqno, keys: &[&[u8]], body: &[u8]) -> Vec<u8> {
    let ws = WriteSet {
        local_trx_id: trx_id,
        last_seen_seqno: last_seen,
        kind: WsKind::Trx,
        level: WsLevel::Query,
        phase: TrxPhase::Replicating,
        queries: vec![body.to_vec()],
        conn_queries: vec![],
        items: keys
            .iter()
            .map(|k| WsItem {
                action: RowAction::Update,
                key: RowKey::single(b"db.t".to_vec(), k.to_vec()),
                data: ItemData::None,
            })
            .collect(),
    };
    encode_write_set(&ws, DEFAULT_MAX_WRITE_SET).expect("encode")
}

/// Encode a connection-level write-set.
pub fn remote_conn_ws(conn_id: u64, last_seen: Seqno, body: &[u8]) -> Vec<u8> {
    let ws = WriteSet {
        local_trx_id: conn_id,
        last_seen_seqno: last_seen,
        kind: WsKind::Conn,
        level: WsLevel::Query,
        phase: TrxPhase::Local,
        queries: vec![body.to_vec()],
        conn_queries: vec![],
        items: vec![],
    };
    encode_write_set(&ws, DEFAULT_MAX_WRITE_SET).expect("encode")
}

/// Poll `pred` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}
