//! Write-Ahead Log (WAL) for durability.
//!
//! Frame format: `[4-byte CRC32][4-byte length][JSON payload]\n`.
//! A frame cut short at the end of the file is a torn append and ends replay
//! quietly. A complete frame whose CRC does not match is corruption and is
//! reported as an error.

use crate::record::StorageRecord;
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("WAL CRC mismatch at entry {entry}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        entry: u64,
        expected: u32,
        actual: u32,
    },
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every append; an acknowledged write survives power loss.
    Always,
    /// Fsync when the caller asks (`StorageEngine::sync`).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    /// Parse a config value ("always", "batch", "none"; any case).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "batch" => Some(Self::Batch),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            entries_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Returns once the frame is flushed (and fsynced under
    /// `FsyncPolicy::Always`).
    pub fn append(&mut self, record: &StorageRecord) -> Result<(), WalError> {
        let payload = serde_json::to_vec(record)?;
        let crc = checksum(&payload);
        let len = payload.len() as u32;

        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries appended since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replay every complete entry from a WAL file, in append order.
    pub fn replay(path: &Path) -> Result<Vec<StorageRecord>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut entry = 0u64;

        loop {
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WalError::Io(e)),
            }
            let expected = u32::from_le_bytes(crc_buf);

            let mut len_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut len_buf, entry)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if !read_frame_part(&mut reader, &mut payload, entry)? {
                break;
            }
            let mut nl = [0u8; 1];
            if !read_frame_part(&mut reader, &mut nl, entry)? {
                break;
            }

            let actual = checksum(&payload);
            if actual != expected {
                return Err(WalError::CrcMismatch {
                    entry,
                    expected,
                    actual,
                });
            }

            records.push(serde_json::from_slice(&payload)?);
            entry += 1;
        }

        Ok(records)
    }
}

/// Read one part of a frame. `Ok(false)` means the file ended mid-frame.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8], entry: u64) -> Result<bool, WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::warn!(entry, "WAL truncated mid-entry; stopping replay");
            Ok(false)
        }
        Err(e) => Err(WalError::Io(e)),
    }
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringkv_common::{VersionVector, VersionedValue};
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn record(key: &str, value: &str) -> StorageRecord {
        let mut vclock = VersionVector::new();
        vclock.increment(&"n1".into());
        StorageRecord::new(
            key.to_string(),
            vec![VersionedValue::new(value.as_bytes().to_vec(), vclock, 1)],
        )
    }

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&record("k1", "v1")).unwrap();
            wal.append(&record("k2", "v2")).unwrap();
            wal.append(&record("k3", "v3")).unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let records = Wal::replay(&wal_path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, "k1");
        assert_eq!(records[2].key, "k3");
        assert_eq!(records[0].versions[0].value, b"v1");
    }

    #[test]
    fn test_wal_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        let records = Wal::replay(&dir.path().join("absent.wal")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_wal_replay_torn_tail() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("torn.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&record("k1", "v1")).unwrap();
            wal.append(&record("k2", "v2")).unwrap();
            wal.append(&record("k3", "v3")).unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        let records = Wal::replay(&wal_path).unwrap();
        assert_eq!(records.len(), 2, "torn final entry is dropped");
        assert_eq!(records[1].key, "k2");
    }

    #[test]
    fn test_wal_replay_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("corrupt.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&record("k1", "v1")).unwrap();
            wal.append(&record("k2", "v2")).unwrap();
        }
        {
            // Flip a payload byte inside the first frame.
            let mut file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            file.seek(SeekFrom::Start(10)).unwrap();
            file.write_all(b"#").unwrap();
        }

        let err = Wal::replay(&wal_path).unwrap_err();
        assert!(matches!(err, WalError::CrcMismatch { entry: 0, .. }));
    }

    #[test]
    fn test_wal_removal_record() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("removal.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&StorageRecord::removal("k1".to_string()))
                .unwrap();
        }

        let records = Wal::replay(&wal_path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_removal());
    }

    #[test]
    fn test_fsync_policy_from_config() {
        assert_eq!(FsyncPolicy::parse("ALWAYS"), Some(FsyncPolicy::Always));
        assert_eq!(FsyncPolicy::parse("none"), Some(FsyncPolicy::None));
        assert_eq!(FsyncPolicy::parse("batch"), Some(FsyncPolicy::Batch));
        assert_eq!(FsyncPolicy::parse("weird"), None);
    }
}
