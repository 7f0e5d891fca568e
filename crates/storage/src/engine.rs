//! Storage engine: combines WAL + Memtable.
//!
//! Durable engines log every mutation to the WAL before applying it to the
//! memtable, so a successful return implies the write is on disk (subject to
//! the fsync policy). In-memory engines skip the WAL.

use crate::memtable::Memtable;
use crate::record::StorageRecord;
use crate::wal::{FsyncPolicy, Wal, WalError};
use ringkv_common::VersionedValue;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The storage engine. All operations are synchronous; the async boundary
/// is at the caller.
#[derive(Debug)]
pub struct StorageEngine {
    memtable: Memtable,
    wal: Option<Wal>,
}

impl StorageEngine {
    /// Open or create a durable engine in `data_dir`, replaying its WAL.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("wal.log");

        let mut memtable = Memtable::new();
        for record in Wal::replay(&wal_path)? {
            memtable.apply(record);
        }

        let wal = Wal::open(&wal_path, fsync)?;

        tracing::info!(
            keys = memtable.len(),
            path = ?wal_path,
            "storage engine opened"
        );

        Ok(Self {
            memtable,
            wal: Some(wal),
        })
    }

    /// A volatile engine with no WAL.
    pub fn in_memory() -> Self {
        Self {
            memtable: Memtable::new(),
            wal: None,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Sibling set for a key.
    pub fn get(&self, key: &str) -> Option<Vec<VersionedValue>> {
        self.memtable.get(key)
    }

    /// Replace a key's sibling set: WAL first, then memtable.
    pub fn replace(&mut self, key: &str, versions: Vec<VersionedValue>) -> Result<(), StorageError> {
        let record = StorageRecord::new(key.to_string(), versions);
        if let Some(wal) = self.wal.as_mut() {
            wal.append(&record)?;
        }
        self.memtable.apply(record);
        Ok(())
    }

    /// Remove a key entirely.
    pub fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        if let Some(wal) = self.wal.as_mut() {
            wal.append(&StorageRecord::removal(key.to_string()))?;
        }
        self.memtable.remove(key);
        Ok(())
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.memtable.len()
    }

    /// Total versions across all keys.
    pub fn version_count(&self) -> usize {
        self.memtable.total_versions()
    }

    pub fn keys(&self) -> Vec<String> {
        self.memtable.keys()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.memtable.keys_with_prefix(prefix)
    }

    /// Sync the WAL to disk (for batch fsync mode). No-op in memory.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        if let Some(wal) = self.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }
}
