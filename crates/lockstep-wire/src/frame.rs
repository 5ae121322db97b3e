//! Transport framing.
//!
//! Each message on a byte stream is a 4-byte big-endian length `L` followed
//! by `L` payload bytes. The reader enforces a caller-supplied bound so a
//! corrupt or hostile peer cannot force an unbounded allocation.

use std::io::{Read, Write};

use lockstep_error::{LockstepError, Result};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Write one framed message.
///
/// # Errors
///
/// `Codec` if the payload does not fit a u32 length; otherwise I/O errors
/// from the underlying writer.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| LockstepError::codec(format!("frame too large: {} bytes", payload.len())))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Read one framed message, rejecting frames longer than `max_len`.
///
/// # Errors
///
/// `Codec` when the advertised length exceeds `max_len`; I/O errors
/// (including unexpected EOF) from the underlying reader.
pub fn read_frame<R: Read>(r: &mut R, max_len: usize) -> Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(LockstepError::codec(format!(
            "frame length {len} exceeds limit {max_len}"
        )));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}
