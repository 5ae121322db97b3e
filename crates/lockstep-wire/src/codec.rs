//! Deterministic write-set serialization.
//!
//! Little-endian fixed-width integers, length-prefixed variable fields,
//! fields in a fixed order. The encoding carries no self-description: both
//! sides agree on the layout, and every tag byte is validated on decode.
//!
//! Layout:
//!
//! ```text
//! local_trx_id     u64
//! last_seen_seqno  u64
//! kind             u8
//! level            u8
//! phase            u8
//! query_count      u16   then per query:      u32 len + bytes
//! conn_query_count u16   then per query:      u32 len + bytes
//! item_count       u16   then per item:
//!     action       u8
//!     table_len    u16 + table bytes
//!     part_count   u16   then per part:       kind u8 + u16 len + bytes
//!     data_mode    u8    (0 none, 1 cols, 2 row)
//!     row:         u32 len + bytes
//!     cols:        u16 count, per col: u16 column + kind u8 + u16 len + bytes
//! ```

use lockstep_error::{LockstepError, Result};
use lockstep_types::{
    ColData, ItemData, KeyKind, KeyPart, Query, RowAction, RowKey, TrxPhase, WriteSet, WsItem,
    WsKind, WsLevel,
};

/// Default bound on one encoded write-set.
///
/// A local commit whose encoding exceeds the configured bound fails with
/// `WriteSetOverflow` rather than fragmenting.
pub const DEFAULT_MAX_WRITE_SET: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Bounded writer
// ---------------------------------------------------------------------------

struct WsWriter {
    buf: Vec<u8>,
    max: usize,
}

impl WsWriter {
    fn new(max: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max,
        }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > self.max {
            return Err(LockstepError::WriteSetOverflow {
                size: self.buf.len() + bytes.len(),
                max: self.max,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }
}

fn count_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| LockstepError::codec(format!("{what} count {len} exceeds u16")))
}

fn len_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len)
        .map_err(|_| LockstepError::codec(format!("{what} length {len} exceeds u16")))
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| LockstepError::codec(format!("{what} length {len} exceeds u32")))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a write-set into its wire form, bounded by `max` bytes.
///
/// # Errors
///
/// `WriteSetOverflow` when the encoding exceeds `max`; `Codec` when a field
/// exceeds its width (e.g. more than 65,535 queries).
pub fn encode_write_set(ws: &WriteSet, max: usize) -> Result<Vec<u8>> {
    let mut w = WsWriter::new(max);

    w.put_u64(ws.local_trx_id)?;
    w.put_u64(ws.last_seen_seqno)?;
    w.put_u8(ws.kind.code())?;
    w.put_u8(ws.level.code())?;
    w.put_u8(ws.phase.code())?;

    encode_queries(&mut w, &ws.queries, "query")?;
    encode_queries(&mut w, &ws.conn_queries, "conn query")?;

    w.put_u16(count_u16(ws.items.len(), "item")?)?;
    for item in &ws.items {
        encode_item(&mut w, item)?;
    }

    Ok(w.buf)
}

fn encode_queries(w: &mut WsWriter, queries: &[Query], what: &str) -> Result<()> {
    w.put_u16(count_u16(queries.len(), what)?)?;
    for q in queries {
        w.put_u32(len_u32(q.len(), what)?)?;
        w.put(q)?;
    }
    Ok(())
}

fn encode_item(w: &mut WsWriter, item: &WsItem) -> Result<()> {
    w.put_u8(item.action.code())?;

    w.put_u16(len_u16(item.key.table.len(), "table name")?)?;
    w.put(&item.key.table)?;
    w.put_u16(count_u16(item.key.parts.len(), "key part")?)?;
    for part in &item.key.parts {
        w.put_u8(part.kind.code())?;
        w.put_u16(len_u16(part.data.len(), "key part")?)?;
        w.put(&part.data)?;
    }

    w.put_u8(item.data.mode_code())?;
    match &item.data {
        ItemData::None => {}
        ItemData::Row(row) => {
            w.put_u32(len_u32(row.len(), "row data")?)?;
            w.put(row)?;
        }
        ItemData::Cols(cols) => {
            w.put_u16(count_u16(cols.len(), "column")?)?;
            for col in cols {
                w.put_u16(col.column)?;
                w.put_u8(col.kind.code())?;
                w.put_u16(len_u16(col.data.len(), "column data")?)?;
                w.put(&col.data)?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

struct WsReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WsReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                LockstepError::codec(format!(
                    "short read: need {n} bytes at offset {} of {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

/// Decode a write-set from its wire form.
///
/// # Errors
///
/// `Codec` on any truncation, unknown tag byte, or trailing garbage.
pub fn decode_write_set(buf: &[u8]) -> Result<WriteSet> {
    let mut r = WsReader::new(buf);

    let local_trx_id = r.u64()?;
    let last_seen_seqno = r.u64()?;

    let kind_code = r.u8()?;
    let kind = WsKind::from_code(kind_code)
        .ok_or_else(|| LockstepError::codec(format!("unknown write-set kind: {kind_code}")))?;
    let level_code = r.u8()?;
    let level = WsLevel::from_code(level_code)
        .ok_or_else(|| LockstepError::codec(format!("unknown write-set level: {level_code}")))?;
    let phase_code = r.u8()?;
    let phase = TrxPhase::from_code(phase_code)
        .ok_or_else(|| LockstepError::codec(format!("unknown trx phase: {phase_code}")))?;

    let queries = decode_queries(&mut r)?;
    let conn_queries = decode_queries(&mut r)?;

    let item_count = r.u16()?;
    let mut items = Vec::with_capacity(usize::from(item_count));
    for _ in 0..item_count {
        items.push(decode_item(&mut r)?);
    }

    if !r.done() {
        return Err(LockstepError::codec(format!(
            "trailing bytes after write-set: {} of {}",
            r.buf.len() - r.pos,
            r.buf.len()
        )));
    }

    Ok(WriteSet {
        local_trx_id,
        last_seen_seqno,
        kind,
        level,
        phase,
        queries,
        conn_queries,
        items,
    })
}

fn decode_queries(r: &mut WsReader<'_>) -> Result<Vec<Query>> {
    let count = r.u16()?;
    let mut queries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = r.u32()? as usize;
        queries.push(r.take(len)?.to_vec());
    }
    Ok(queries)
}

fn decode_item(r: &mut WsReader<'_>) -> Result<WsItem> {
    let action_code = r.u8()?;
    let action = RowAction::from_code(action_code)
        .ok_or_else(|| LockstepError::codec(format!("unknown row action: {action_code}")))?;

    let table_len = usize::from(r.u16()?);
    let table = r.take(table_len)?.to_vec();
    let part_count = r.u16()?;
    let mut parts = Vec::with_capacity(usize::from(part_count));
    for _ in 0..part_count {
        let kind_code = r.u8()?;
        let kind = KeyKind::from_code(kind_code)
            .ok_or_else(|| LockstepError::codec(format!("unknown key kind: {kind_code}")))?;
        let len = usize::from(r.u16()?);
        parts.push(KeyPart {
            kind,
            data: r.take(len)?.to_vec(),
        });
    }
    let key = RowKey { table, parts };

    let mode = r.u8()?;
    let data = match mode {
        0 => ItemData::None,
        1 => {
            let count = r.u16()?;
            let mut cols = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let column = r.u16()?;
                let kind_code = r.u8()?;
                let kind = KeyKind::from_code(kind_code).ok_or_else(|| {
                    LockstepError::codec(format!("unknown column kind: {kind_code}"))
                })?;
                let len = usize::from(r.u16()?);
                cols.push(ColData {
                    column,
                    kind,
                    data: r.take(len)?.to_vec(),
                });
            }
            ItemData::Cols(cols)
        }
        2 => {
            let len = r.u32()? as usize;
            ItemData::Row(r.take(len)?.to_vec())
        }
        other => {
            return Err(LockstepError::codec(format!(
                "unknown item data mode: {other}"
            )))
        }
    };

    Ok(WsItem { action, key, data })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
