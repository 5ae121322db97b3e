//! Append-only write-set log.
//!
//! Every certified write-set is appended here before the engine reports
//! certification-pass. The log is the node's durable record of committed
//! replication traffic; the in-memory certification index is rebuilt from
//! it on bootstrap (bootstrap itself is handled elsewhere).
//!
//! Record layout (little-endian):
//!
//! ```text
//! magic        u32   "LWSL"
//! payload_len  u32
//! seqno_global u64
//! checksum     u64   xxh3 of payload
//! payload      [u8; payload_len]
//! ```
//!
//! An append failure is fatal to the node: a replica that cannot persist
//! certified write-sets has diverged from the cluster's durable history.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use lockstep_error::{LockstepError, Result};
use lockstep_types::Seqno;

/// File name of the write-set log inside the data directory.
pub const LOG_FILE_NAME: &str = "lockstep.wsl";

/// Record header magic.
const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"LWSL");

/// Size of the fixed record header.
const RECORD_HEADER_SIZE: usize = 4 + 4 + 8 + 8;

/// The append-only log file.
#[derive(Debug)]
pub struct WriteSetLog {
    file: File,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl WriteSetLog {
    /// Open (creating if needed) the log under `data_dir`.
    ///
    /// # Errors
    ///
    /// I/O errors creating the directory or opening the file.
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes = file.metadata()?.len();
        info!(
            target: "lockstep_store::log",
            path = %path.display(),
            bytes,
            "write-set log opened"
        );
        Ok(Self {
            file,
            path,
            records: 0,
            bytes,
        })
    }

    /// Append one certified write-set.
    ///
    /// # Errors
    ///
    /// Any I/O error; the caller must treat it as fatal.
    pub fn append(&mut self, seqno_global: Seqno, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            LockstepError::codec(format!("write-set of {} bytes exceeds log record", payload.len()))
        })?;

        let mut header = [0u8; RECORD_HEADER_SIZE];
        header[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&len.to_le_bytes());
        header[8..16].copy_from_slice(&seqno_global.to_le_bytes());
        header[16..24].copy_from_slice(&xxh3_64(payload).to_le_bytes());

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.file.sync_data()?;

        self.records += 1;
        self.bytes += (RECORD_HEADER_SIZE + payload.len()) as u64;
        debug!(
            target: "lockstep_store::log",
            seqno_global,
            payload = payload.len(),
            "write-set appended"
        );
        Ok(())
    }

    /// Records appended since this handle was opened.
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }

    /// Total size of the log file in bytes.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, verifying magic and checksum.
    ///
    /// # Errors
    ///
    /// I/O errors, a bad magic, a truncated record, or a checksum mismatch.
    pub fn read_all(path: &Path) -> Result<Vec<(Seqno, Vec<u8>)>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut header = [0u8; RECORD_HEADER_SIZE];

        loop {
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }

            let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
            if magic != RECORD_MAGIC {
                return Err(LockstepError::codec(format!(
                    "bad log record magic: {magic:#010x}"
                )));
            }
            let len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
            let seqno = u64::from_le_bytes(header[8..16].try_into().expect("8 bytes"));
            let checksum = u64::from_le_bytes(header[16..24].try_into().expect("8 bytes"));

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            if xxh3_64(&payload) != checksum {
                return Err(LockstepError::codec(format!(
                    "log record checksum mismatch at seqno {seqno}"
                )));
            }
            records.push((seqno, payload));
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut log = WriteSetLog::open(dir.path()).unwrap();

        log.append(11, b"first").unwrap();
        log.append(12, b"").unwrap();
        log.append(15, &[0xAA; 100]).unwrap();
        assert_eq!(log.records(), 3);

        let records = WriteSetLog::read_all(log.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], (11, b"first".to_vec()));
        assert_eq!(records[1], (12, Vec::new()));
        assert_eq!(records[2], (15, vec![0xAA; 100]));
    }

    #[test]
    fn test_reopen_appends_after_existing_records() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = WriteSetLog::open(dir.path()).unwrap();
            log.append(1, b"one").unwrap();
        }
        {
            let mut log = WriteSetLog::open(dir.path()).unwrap();
            assert!(log.bytes() > 0);
            log.append(2, b"two").unwrap();
        }
        let records = WriteSetLog::read_all(&dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], (2, b"two".to_vec()));
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = TempDir::new().unwrap();
        let mut log = WriteSetLog::open(dir.path()).unwrap();
        log.append(1, b"payload").unwrap();
        let path = log.path().to_path_buf();
        drop(log);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(WriteSetLog::read_all(&path).is_err());
    }

    #[test]
    fn test_truncated_record_detected() {
        let dir = TempDir::new().unwrap();
        let mut log = WriteSetLog::open(dir.path()).unwrap();
        log.append(1, b"payload").unwrap();
        let path = log.path().to_path_buf();
        drop(log);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        assert!(WriteSetLog::read_all(&path).is_err());
    }

    #[test]
    fn test_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let log = WriteSetLog::open(&nested).unwrap();
        assert!(log.path().exists());
    }
}
