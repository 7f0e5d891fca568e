//! Per-node replica storage.
//!
//! [`ReplicaStore`] is the seam between the replication layer and a node's
//! local data. Stores hold, per key, the set of non-dominated versions.
//! They do no locking of their own: callers serialize mutations per key.

use ringkv_common::{reconcile_versions, VersionedValue};
use ringkv_storage::{FsyncPolicy, StorageEngine, StorageError};
use std::path::Path;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("corrupt entry for key {key:?}")]
    Corrupt { key: String },
}

/// Result of [`ReplicaStore::merge_siblings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The key's version set after the merge.
    pub versions: Vec<VersionedValue>,
    /// Whether the store was written.
    pub changed: bool,
}

#[async_trait::async_trait]
pub trait ReplicaStore: Send + Sync + std::fmt::Debug + 'static {
    /// The version set for a key, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<VersionedValue>>, StoreError>;

    /// Replace the whole version set. An empty set removes the key.
    async fn replace(&self, key: &str, versions: Vec<VersionedValue>) -> Result<(), StoreError>;

    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Number of keys held.
    async fn len(&self) -> Result<usize, StoreError>;

    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Force buffered writes to disk. No-op for volatile stores.
    async fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Overwrite the entry with a single version.
    async fn put(&self, key: &str, value: VersionedValue) -> Result<(), StoreError> {
        self.replace(key, vec![value]).await
    }

    /// Fold `incoming` into the existing set, keeping only non-dominated
    /// versions. Writes only when the set changes, so replaying the same
    /// versions is a no-op.
    async fn merge_siblings(
        &self,
        key: &str,
        incoming: Vec<VersionedValue>,
    ) -> Result<MergeOutcome, StoreError> {
        let existing = self.get(key).await?.unwrap_or_default();
        let mut all = existing.clone();
        all.extend(incoming);
        let versions = reconcile_versions(all);

        if versions == existing {
            return Ok(MergeOutcome {
                versions,
                changed: false,
            });
        }
        self.replace(key, versions.clone()).await?;
        Ok(MergeOutcome {
            versions,
            changed: true,
        })
    }
}

// ---------------------------------------------------------------------------
// EngineStore
// ---------------------------------------------------------------------------

/// A [`ReplicaStore`] backed by a [`StorageEngine`] (WAL-backed or in-memory).
#[derive(Debug)]
pub struct EngineStore {
    engine: RwLock<StorageEngine>,
}

impl EngineStore {
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine: RwLock::new(engine),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageEngine::in_memory())
    }

    /// Open a durable store in `dir`, replaying its WAL.
    pub fn open(dir: &Path, fsync: FsyncPolicy) -> Result<Self, StoreError> {
        Ok(Self::new(StorageEngine::open(dir, fsync)?))
    }
}

#[async_trait::async_trait]
impl ReplicaStore for EngineStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<VersionedValue>>, StoreError> {
        Ok(self.engine.read().await.get(key))
    }

    async fn replace(&self, key: &str, versions: Vec<VersionedValue>) -> Result<(), StoreError> {
        let mut engine = self.engine.write().await;
        if versions.is_empty() {
            engine.remove(key)?;
        } else {
            engine.replace(key, versions)?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.engine.read().await.keys())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.engine.read().await.key_count())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.engine.write().await.sync()?;
        Ok(())
    }
}
