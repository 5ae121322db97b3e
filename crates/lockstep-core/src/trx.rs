//! Local transaction table.
//!
//! Tracks every local transaction from its first append until the embedder
//! reports committed or rolled back, and the per-connection context
//! (session variables, default database, in-flight total-order execution).
//! The table owns the write-set builder state: appends accumulate here and
//! `take_write_set` drains them into an immutable [`WriteSet`].
//!
//! Mutated from application threads (appends, commit) and from the receive
//! loop (committed / rolled-back housekeeping); one coarse mutex covers
//! both maps. Phases only move forward, `Aborted` is terminal.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use lockstep_error::{LockstepError, Result};
use lockstep_types::writeset::MAX_KEY_LEN;
use lockstep_types::{
    ConnId, ItemData, Query, RowAction, RowKey, Seqno, TrxId, TrxPhase, WriteSet, WsItem, WsKind,
    WsLevel, SEQNO_ABORTED, SEQNO_NONE,
};

#[derive(Debug)]
struct TrxRecord {
    phase: TrxPhase,
    seqno_local: Seqno,
    seqno_global: Seqno,
    queries: Vec<Query>,
    keys: Vec<(RowKey, RowAction)>,
    rows: Vec<Vec<u8>>,
}

impl TrxRecord {
    fn new() -> Self {
        Self {
            phase: TrxPhase::Local,
            seqno_local: SEQNO_NONE,
            seqno_global: SEQNO_NONE,
            queries: Vec::new(),
            keys: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.keys.is_empty() && self.rows.is_empty()
    }
}

#[derive(Debug, Default)]
struct ConnRecord {
    /// Session-variable statements, keyed by variable name; a re-set
    /// replaces the previous statement for that name.
    variables: Vec<(Vec<u8>, Query)>,
    /// The `USE` statement selecting the default database, if any.
    database: Option<Query>,
    /// Gate slot and global seqno of an in-flight total-order execution.
    exec_seqno: Option<(Seqno, Seqno)>,
}

/// The table of local transactions and connection contexts.
#[derive(Debug, Default)]
pub struct TrxTable {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    trxs: HashMap<TrxId, TrxRecord>,
    conns: HashMap<ConnId, ConnRecord>,
}

impl TrxTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Write-set building ──

    /// Append an SQL statement to the transaction's write-set, creating the
    /// record on first touch.
    pub fn append_query(&self, trx_id: TrxId, query: impl Into<Query>) {
        let mut tables = self.inner.lock();
        tables
            .trxs
            .entry(trx_id)
            .or_insert_with(TrxRecord::new)
            .queries
            .push(query.into());
    }

    /// Append a binary row image to the transaction's write-set.
    pub fn append_row(&self, trx_id: TrxId, row: impl Into<Vec<u8>>) {
        let mut tables = self.inner.lock();
        tables
            .trxs
            .entry(trx_id)
            .or_insert_with(TrxRecord::new)
            .rows
            .push(row.into());
    }

    /// Append a row-key footprint to the transaction's write-set.
    ///
    /// # Errors
    ///
    /// `KeyTooLong` when the key parts exceed [`MAX_KEY_LEN`] bytes.
    pub fn append_row_key(&self, trx_id: TrxId, key: RowKey, action: RowAction) -> Result<()> {
        let len = key.key_len();
        if len > MAX_KEY_LEN {
            return Err(LockstepError::KeyTooLong {
                len,
                max: MAX_KEY_LEN,
            });
        }
        let mut tables = self.inner.lock();
        tables
            .trxs
            .entry(trx_id)
            .or_insert_with(TrxRecord::new)
            .keys
            .push((key, action));
        Ok(())
    }

    /// Drain the transaction's builder state into an immutable write-set.
    ///
    /// Returns `None` for an unknown or empty transaction (an autocommit
    /// statement that changed nothing replicates nothing). The write-set is
    /// stamped with `last_seen` as its certification horizon and carries
    /// the connection's context statements.
    ///
    /// # Errors
    ///
    /// `RowWithoutKey` when more row images than row keys were appended:
    /// every body row needs a matching certification footprint.
    pub fn take_write_set(
        &self,
        trx_id: TrxId,
        conn_id: ConnId,
        last_seen: Seqno,
    ) -> Result<Option<WriteSet>> {
        let mut tables = self.inner.lock();

        let conn_queries = tables
            .conns
            .get(&conn_id)
            .map(ConnRecord::context_queries)
            .unwrap_or_default();

        let Some(record) = tables.trxs.get_mut(&trx_id) else {
            return Ok(None);
        };
        if record.is_empty() {
            return Ok(None);
        }
        if record.rows.len() > record.keys.len() {
            return Err(LockstepError::RowWithoutKey {
                trx_id,
                rows: record.rows.len(),
                keys: record.keys.len(),
            });
        }

        let queries = std::mem::take(&mut record.queries);
        let keys = std::mem::take(&mut record.keys);
        let rows = std::mem::take(&mut record.rows);

        let level = if rows.is_empty() {
            WsLevel::Query
        } else {
            WsLevel::Row
        };

        // Row images pair with keys positionally; key-only items carry no
        // payload.
        let mut rows = rows.into_iter();
        let items = keys
            .into_iter()
            .map(|(key, action)| WsItem {
                action,
                key,
                data: rows.next().map_or(ItemData::None, ItemData::Row),
            })
            .collect();

        trace!(
            target: "lockstep_core::trx",
            trx_id,
            last_seen,
            "write-set taken"
        );

        Ok(Some(WriteSet {
            local_trx_id: trx_id,
            last_seen_seqno: last_seen,
            kind: WsKind::Trx,
            level,
            phase: record.phase,
            queries,
            conn_queries,
            items,
        }))
    }

    // ── Seqno bookkeeping ──

    /// Record the assigned seqnos, creating the record if needed.
    ///
    /// Assigning `SEQNO_ABORTED` marks the transaction cancelled; the
    /// commit path observes the marker at its next check. Assigning real
    /// seqnos to an already-aborted transaction records them (so the
    /// rollback path can release the gate slot) without resurrecting it.
    pub fn assign(&self, trx_id: TrxId, seqno_local: Seqno, seqno_global: Seqno) {
        let mut tables = self.inner.lock();
        let record = tables.trxs.entry(trx_id).or_insert_with(TrxRecord::new);
        record.seqno_local = seqno_local;
        record.seqno_global = seqno_global;
        if seqno_local == SEQNO_ABORTED {
            record.phase = TrxPhase::Aborted;
        } else if record.phase == TrxPhase::Local {
            record.phase = TrxPhase::Replicating;
        }
    }

    /// The transaction's local seqno: `None` for an unknown transaction,
    /// `SEQNO_NONE` before assignment, `SEQNO_ABORTED` after a cancel.
    #[must_use]
    pub fn seqno_local_of(&self, trx_id: TrxId) -> Option<Seqno> {
        self.inner.lock().trxs.get(&trx_id).map(|r| r.seqno_local)
    }

    /// Both seqnos of the transaction, if it is known.
    #[must_use]
    pub fn seqnos_of(&self, trx_id: TrxId) -> Option<(Seqno, Seqno)> {
        self.inner
            .lock()
            .trxs
            .get(&trx_id)
            .map(|r| (r.seqno_local, r.seqno_global))
    }

    /// Mark the transaction aborted, creating the record if needed. Used
    /// by the cancel path before a seqno exists; terminal.
    pub fn mark_aborted(&self, trx_id: TrxId) {
        self.assign(trx_id, SEQNO_ABORTED, SEQNO_ABORTED);
    }

    /// Advance the transaction into `Committing` (its gate slot is held).
    /// Returns false for an unknown transaction or a forbidden transition.
    pub fn mark_committing(&self, trx_id: TrxId) -> bool {
        self.advance(trx_id, TrxPhase::Committing)
    }

    /// Advance the transaction into `Committed`.
    /// Returns false for an unknown transaction or a forbidden transition.
    pub fn mark_committed(&self, trx_id: TrxId) -> bool {
        self.advance(trx_id, TrxPhase::Committed)
    }

    fn advance(&self, trx_id: TrxId, next: TrxPhase) -> bool {
        let mut tables = self.inner.lock();
        match tables.trxs.get_mut(&trx_id) {
            Some(record) if record.phase.can_advance_to(next) => {
                record.phase = next;
                true
            }
            _ => false,
        }
    }

    /// Current phase of the transaction, if known.
    #[must_use]
    pub fn phase_of(&self, trx_id: TrxId) -> Option<TrxPhase> {
        self.inner.lock().trxs.get(&trx_id).map(|r| r.phase)
    }

    /// Remove the transaction record.
    pub fn erase(&self, trx_id: TrxId) {
        self.inner.lock().trxs.remove(&trx_id);
    }

    /// Number of live transaction records.
    #[must_use]
    pub fn trx_count(&self) -> usize {
        self.inner.lock().trxs.len()
    }

    // ── Connection context ──

    /// Record a session-variable statement for the connection. A later
    /// statement for the same variable name replaces the earlier one.
    pub fn set_variable(
        &self,
        conn_id: ConnId,
        name: impl Into<Vec<u8>>,
        query: impl Into<Query>,
    ) {
        let name = name.into();
        let query = query.into();
        let mut tables = self.inner.lock();
        let conn = tables.conns.entry(conn_id).or_default();
        if let Some(entry) = conn.variables.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = query;
        } else {
            conn.variables.push((name, query));
        }
    }

    /// Record the connection's default-database statement.
    pub fn set_database(&self, conn_id: ConnId, query: impl Into<Query>) {
        let mut tables = self.inner.lock();
        tables.conns.entry(conn_id).or_default().database = Some(query.into());
    }

    /// Build a connection-level write-set carrying the context statements
    /// and one statement for direct total-order execution.
    #[must_use]
    pub fn conn_write_set(
        &self,
        conn_id: ConnId,
        query: impl Into<Query>,
        last_seen: Seqno,
    ) -> WriteSet {
        let tables = self.inner.lock();
        let conn_queries = tables
            .conns
            .get(&conn_id)
            .map(ConnRecord::context_queries)
            .unwrap_or_default();
        WriteSet {
            local_trx_id: conn_id,
            last_seen_seqno: last_seen,
            kind: WsKind::Conn,
            level: WsLevel::Query,
            phase: TrxPhase::Local,
            queries: vec![query.into()],
            conn_queries,
            items: Vec::new(),
        }
    }

    /// Record the gate slot of the connection's in-flight total-order
    /// execution.
    pub fn set_exec_seqno(&self, conn_id: ConnId, seqno_local: Seqno, seqno_global: Seqno) {
        let mut tables = self.inner.lock();
        tables.conns.entry(conn_id).or_default().exec_seqno =
            Some((seqno_local, seqno_global));
    }

    /// Take the in-flight execution seqnos, clearing them.
    #[must_use]
    pub fn take_exec_seqno(&self, conn_id: ConnId) -> Option<(Seqno, Seqno)> {
        self.inner
            .lock()
            .conns
            .get_mut(&conn_id)
            .and_then(|c| c.exec_seqno.take())
    }
}

impl ConnRecord {
    /// Context statements in apply order: default database first, then the
    /// session variables in the order they were first set.
    fn context_queries(&self) -> Vec<Query> {
        let mut queries = Vec::with_capacity(self.variables.len() + 1);
        if let Some(db) = &self.database {
            queries.push(db.clone());
        }
        queries.extend(self.variables.iter().map(|(_, q)| q.clone()));
        queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_creates_record_lazily() {
        let table = TrxTable::new();
        assert_eq!(table.trx_count(), 0);
        table.append_query(1, b"INSERT INTO t VALUES(1)".to_vec());
        assert_eq!(table.trx_count(), 1);
        assert_eq!(table.phase_of(1), Some(TrxPhase::Local));
        assert_eq!(table.seqno_local_of(1), Some(SEQNO_NONE));
    }

    #[test]
    fn test_take_write_set_drains_builder() {
        let table = TrxTable::new();
        table.append_query(1, b"UPDATE t SET v = 2 WHERE k = 5".to_vec());
        table
            .append_row_key(1, RowKey::single(b"db.t".to_vec(), b"5".to_vec()), RowAction::Update)
            .unwrap();

        let ws = table.take_write_set(1, 0, 17).unwrap().unwrap();
        assert_eq!(ws.last_seen_seqno, 17);
        assert_eq!(ws.kind, WsKind::Trx);
        assert_eq!(ws.level, WsLevel::Query);
        assert_eq!(ws.queries.len(), 1);
        assert_eq!(ws.items.len(), 1);
        assert_eq!(ws.items[0].action, RowAction::Update);

        // Drained: a second take finds an empty builder.
        assert!(table.take_write_set(1, 0, 18).unwrap().is_none());
    }

    #[test]
    fn test_take_write_set_unknown_or_empty_is_none() {
        let table = TrxTable::new();
        assert!(table.take_write_set(9, 0, 0).unwrap().is_none());
    }

    #[test]
    fn test_row_level_pairs_rows_with_keys() {
        let table = TrxTable::new();
        table
            .append_row_key(1, RowKey::single(b"db.t".to_vec(), b"a".to_vec()), RowAction::Insert)
            .unwrap();
        table.append_row(1, vec![1, 2, 3]);
        table
            .append_row_key(1, RowKey::single(b"db.t".to_vec(), b"b".to_vec()), RowAction::Delete)
            .unwrap();

        let ws = table.take_write_set(1, 0, 0).unwrap().unwrap();
        assert_eq!(ws.level, WsLevel::Row);
        assert_eq!(ws.items.len(), 2);
        assert_eq!(ws.items[0].data, ItemData::Row(vec![1, 2, 3]));
        assert_eq!(ws.items[1].data, ItemData::None);
    }

    #[test]
    fn test_row_without_key_rejected() {
        let table = TrxTable::new();
        table.append_row(1, vec![1]);
        let err = table.take_write_set(1, 0, 0).unwrap_err();
        assert!(matches!(err, LockstepError::RowWithoutKey { trx_id: 1, .. }));
    }

    #[test]
    fn test_too_long_key_rejected() {
        let table = TrxTable::new();
        let key = RowKey::single(b"db.t".to_vec(), vec![0u8; MAX_KEY_LEN + 1]);
        let err = table.append_row_key(1, key, RowAction::Insert).unwrap_err();
        assert!(matches!(err, LockstepError::KeyTooLong { .. }));
    }

    #[test]
    fn test_assign_and_phases() {
        let table = TrxTable::new();
        table.append_query(1, b"q".to_vec());
        table.assign(1, 4, 19);
        assert_eq!(table.seqnos_of(1), Some((4, 19)));
        assert_eq!(table.phase_of(1), Some(TrxPhase::Replicating));

        assert!(table.mark_committing(1));
        assert!(table.mark_committed(1));
        // Terminal: no further transitions.
        assert!(!table.mark_committing(1));
        table.erase(1);
        assert_eq!(table.phase_of(1), None);
    }

    #[test]
    fn test_abort_marker_is_terminal() {
        let table = TrxTable::new();
        // cancel_commit on a transaction with no record yet creates the
        // marker.
        table.assign(7, SEQNO_ABORTED, SEQNO_ABORTED);
        assert_eq!(table.seqno_local_of(7), Some(SEQNO_ABORTED));
        assert_eq!(table.phase_of(7), Some(TrxPhase::Aborted));

        // Late seqno assignment records the slots but stays aborted.
        table.assign(7, 4, 19);
        assert_eq!(table.seqnos_of(7), Some((4, 19)));
        assert_eq!(table.phase_of(7), Some(TrxPhase::Aborted));
        assert!(!table.mark_committing(7));
    }

    #[test]
    fn test_conn_context_ordering_and_replacement() {
        let table = TrxTable::new();
        table.set_variable(3, b"sql_mode".to_vec(), b"SET sql_mode = 'ANSI'".to_vec());
        table.set_variable(3, b"tz".to_vec(), b"SET time_zone = '+00:00'".to_vec());
        table.set_database(3, b"USE shop".to_vec());
        // Re-set replaces in place.
        table.set_variable(3, b"sql_mode".to_vec(), b"SET sql_mode = ''".to_vec());

        let ws = table.conn_write_set(3, b"TRUNCATE t".to_vec(), 9);
        assert_eq!(ws.kind, WsKind::Conn);
        assert_eq!(ws.last_seen_seqno, 9);
        assert_eq!(ws.queries, vec![b"TRUNCATE t".to_vec()]);
        assert_eq!(
            ws.conn_queries,
            vec![
                b"USE shop".to_vec(),
                b"SET sql_mode = ''".to_vec(),
                b"SET time_zone = '+00:00'".to_vec(),
            ]
        );
    }

    #[test]
    fn test_trx_write_set_carries_conn_context() {
        let table = TrxTable::new();
        table.set_database(3, b"USE shop".to_vec());
        table.append_query(1, b"INSERT INTO t VALUES(1)".to_vec());
        let ws = table.take_write_set(1, 3, 0).unwrap().unwrap();
        assert_eq!(ws.conn_queries, vec![b"USE shop".to_vec()]);
    }

    #[test]
    fn test_exec_seqno_round_trip() {
        let table = TrxTable::new();
        assert_eq!(table.take_exec_seqno(3), None);
        table.set_exec_seqno(3, 5, 21);
        assert_eq!(table.take_exec_seqno(3), Some((5, 21)));
        assert_eq!(table.take_exec_seqno(3), None);
    }
}
