//! Storage engine for ringkv: WAL + in-memory memtable.
//!
//! Each key maps to its current sibling set of `VersionedValue`s. Every
//! mutation logs the complete new sibling set to the WAL before it becomes
//! visible in the memtable; replay rebuilds the memtable on open.

pub mod engine;
pub mod memtable;
pub mod record;
pub mod wal;

pub use engine::{StorageEngine, StorageError};
pub use record::StorageRecord;
pub use wal::FsyncPolicy;
