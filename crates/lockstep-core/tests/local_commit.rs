//! Local commit path scenarios: autocommit, empty write-sets, total-order
//! DDL execution, and serialization bounds.

mod common;

use std::sync::Arc;
use std::time::Duration;

use lockstep_core::{Applier, Config, LoopbackGroup, Replicator};
use lockstep_error::LockstepError;
use tempfile::TempDir;

use common::{wait_until, TestApplier, TestNode};

#[test]
fn test_single_node_autocommit() {
    let node = TestNode::start(TestApplier::default());

    // First local commit takes gate slot 1, certifies against an empty
    // store, and the post-commit hook advances the gate.
    node.engine
        .append_query(1, b"INSERT INTO t VALUES(1)".to_vec())
        .unwrap();
    node.engine.commit(1, 0).unwrap();
    assert_eq!(node.engine.gate_seqno(), 1, "slot 1 admitted");
    node.engine.committed(1).unwrap();
    assert_eq!(node.engine.last_committed(), 1);

    // The next commit flows through slot 2: the gate advanced.
    node.commit_one(2, b"k2", b"INSERT INTO t VALUES(2)");
    assert_eq!(node.engine.gate_seqno(), 2);
    assert_eq!(node.engine.last_committed(), 2);

    let metrics = node.engine.metrics();
    assert_eq!(metrics.replicated, 2);
    assert_eq!(metrics.cert_pass, 2);
    assert_eq!(metrics.cert_fail, 0);

    // Local commits never go through the applier.
    assert!(node.applier.bodies().is_empty());

    node.stop();
}

#[test]
fn test_empty_write_set_commits_immediately() {
    let node = TestNode::start(TestApplier::default());

    // Autocommit that changed nothing: no append happened.
    node.engine.commit(42, 0).unwrap();
    assert_eq!(node.engine.gate_seqno(), 0, "no gate slot consumed");
    assert_eq!(node.engine.metrics().replicated, 0);

    // The embedder still reports committed; the engine shrugs.
    node.engine.committed(42).unwrap();

    node.stop();
}

#[test]
fn test_to_execute_holds_the_gate_until_end() {
    let node = TestNode::start(TestApplier::default());

    node.engine.set_database(9, b"USE shop".to_vec()).unwrap();
    node.engine
        .to_execute_start(9, b"CREATE TABLE t2 (k INT)".to_vec())
        .unwrap();
    assert_eq!(node.engine.gate_seqno(), 1, "DDL holds slot 1");

    node.engine.to_execute_end(9).unwrap();

    // The stream continues normally after the DDL's slot.
    node.commit_one(1, b"k", b"INSERT INTO t2 VALUES(1)");
    assert_eq!(node.engine.gate_seqno(), 2);

    node.stop();
}

#[test]
fn test_oversized_write_set_fails_commit() {
    let data_dir = TempDir::new().unwrap();
    let config = Config {
        max_write_set: 64,
        ..Config::new(data_dir.path())
    };
    let engine = Arc::new(Replicator::new(config).unwrap());
    let group = LoopbackGroup::open("test", 64);
    engine
        .enable_with(group as Arc<dyn lockstep_core::GroupComm>)
        .unwrap();

    let applier = Arc::new(TestApplier::default()) as Arc<dyn Applier>;
    let recv_thread = {
        let engine = Arc::clone(&engine);
        std::thread::spawn(move || engine.recv(applier))
    };
    assert!(wait_until(Duration::from_secs(5), || engine.is_primary()));

    engine.append_query(1, vec![b'x'; 500]).unwrap();
    let err = engine.commit(1, 0).unwrap_err();
    assert!(matches!(err, LockstepError::WriteSetOverflow { max: 64, .. }));

    // Nothing was replicated; the gate is untouched.
    assert_eq!(engine.metrics().replicated, 0);
    assert_eq!(engine.gate_seqno(), 0);

    engine.disable().unwrap();
    recv_thread.join().unwrap().unwrap();
}

#[test]
fn test_committed_high_water_feeds_next_horizon() {
    let node = TestNode::start(TestApplier::default());

    for (trx, key) in [(1u64, b"a" as &[u8]), (2, b"b"), (3, b"c")] {
        node.commit_one(trx, key, b"UPDATE t");
    }
    assert_eq!(node.engine.last_committed(), 3);

    // A rolled-back transaction releases its slot without moving the
    // high-water mark.
    node.engine.append_query(4, b"UPDATE t SET v = 9".to_vec()).unwrap();
    node.engine.commit(4, 0).unwrap();
    node.engine.rolled_back(4).unwrap();
    assert_eq!(node.engine.last_committed(), 3);
    assert_eq!(node.engine.gate_seqno(), 4, "slot released by rollback");

    node.commit_one(5, b"d", b"UPDATE t");
    assert_eq!(node.engine.last_committed(), 5);

    node.stop();
}
