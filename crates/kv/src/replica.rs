//! Replica-side request handling.
//!
//! A [`ReplicaNode`] owns one node's store and hint store and answers the
//! requests of [`ReplicaRequest`]. Mutations of a key are serialized through
//! a striped lock table; nothing is locked across nodes.

use crate::clock::Clock;
use crate::hint_store::{Hint, HintStore, HintStoreError};
use crate::merkle::{bucket_of, version_set_hash, Hash, MerkleDigest};
use crate::placement::PlacementOracle;
use crate::store::{ReplicaStore, StoreError};
use crate::transport::{ReplicaRequest, ReplicaResponse};
use ringkv_common::{key_token, reconcile_versions, NodeId, VersionedValue};
use ringkv_config::MAX_DIGEST_DEPTH;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("hint store error: {0}")]
    Hints(#[from] HintStoreError),
}

// ---------------------------------------------------------------------------
// KeyLocks
// ---------------------------------------------------------------------------

/// Striped per-key mutexes. Keys hashing to the same stripe share a lock.
#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub const DEFAULT_STRIPES: usize = 64;

    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(key)].lock().await
    }

    fn stripe_of(&self, key: &str) -> usize {
        (key_token(key) % self.stripes.len() as u64) as usize
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STRIPES)
    }
}

// ---------------------------------------------------------------------------
// ReplicaNode
// ---------------------------------------------------------------------------

pub struct ReplicaNode {
    id: NodeId,
    store: Arc<dyn ReplicaStore>,
    hints: RwLock<HintStore>,
    locks: KeyLocks,
    placement: Arc<dyn PlacementOracle>,
    /// Replication factor, used to decide which keys a digest covers.
    n: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaNode")
            .field("id", &self.id)
            .field("n", &self.n)
            .finish_non_exhaustive()
    }
}

impl ReplicaNode {
    pub fn new(
        id: NodeId,
        store: Arc<dyn ReplicaStore>,
        hints: HintStore,
        placement: Arc<dyn PlacementOracle>,
        n: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            id,
            store,
            hints: RwLock::new(hints),
            locks: KeyLocks::default(),
            placement,
            n,
            clock,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.store
    }

    /// Pending hints for `target`.
    pub async fn hints_for(&self, target: &NodeId) -> Vec<Hint> {
        self.hints.read().await.hints_for_node(target)
    }

    pub async fn hint_targets(&self) -> Vec<NodeId> {
        self.hints.read().await.all_target_nodes().into_iter().collect()
    }

    pub async fn hint_count(&self) -> usize {
        self.hints.read().await.hint_count()
    }

    /// Clear the hinted versions that were handed off (or given up on).
    /// Hints stored for the key in the meantime stay pending.
    pub async fn settle_hint(
        &self,
        target: &NodeId,
        key: &str,
        versions: &[VersionedValue],
    ) -> Result<bool, HintStoreError> {
        self.hints.write().await.remove_versions(target, key, versions)
    }

    /// Fsync the store and hint WALs.
    pub async fn sync(&self) -> Result<(), ReplicaError> {
        self.store.sync().await?;
        self.hints.write().await.sync()?;
        Ok(())
    }

    /// Count a failed handoff; returns the new attempt count.
    pub async fn record_hint_failure(
        &self,
        target: &NodeId,
        key: &str,
    ) -> Result<Option<u32>, HintStoreError> {
        self.hints.write().await.record_failure(target, key)
    }

    /// Answer one replica request.
    pub async fn handle(&self, request: ReplicaRequest) -> Result<ReplicaResponse, ReplicaError> {
        match request {
            ReplicaRequest::Get { key } => {
                let mut versions = self.store.get(&key).await?.unwrap_or_default();
                versions.extend(self.hints.read().await.hinted_versions(&key));
                Ok(ReplicaResponse::Versions(reconcile_versions(versions)))
            }
            ReplicaRequest::Put {
                key,
                value,
                hint_for: None,
            } => {
                let _guard = self.locks.lock(&key).await;
                self.store.merge_siblings(&key, vec![value]).await?;
                Ok(ReplicaResponse::Ack)
            }
            ReplicaRequest::Put {
                key,
                value,
                hint_for: Some(target),
            } => {
                let now = self.clock.now_ms();
                self.hints
                    .write()
                    .await
                    .store_hint(&target, &key, value, now)?;
                ringkv_metrics::metrics().hints_stored.inc();
                tracing::debug!(node = %self.id, %target, key, "stored hint");
                Ok(ReplicaResponse::Ack)
            }
            ReplicaRequest::RepairPush { key, versions }
            | ReplicaRequest::Handoff { key, versions } => {
                let _guard = self.locks.lock(&key).await;
                let outcome = self.store.merge_siblings(&key, versions).await?;
                Ok(ReplicaResponse::Merged {
                    changed: outcome.changed,
                })
            }
            ReplicaRequest::Digest { peer, depth } => {
                let depth = depth.min(MAX_DIGEST_DEPTH);
                let entries: Vec<(String, Hash)> =
                    self.shared_entries(&peer, depth, None).await?.into_iter().collect();
                Ok(ReplicaResponse::Digest(MerkleDigest::build(depth, &entries)))
            }
            ReplicaRequest::BucketKeys {
                peer,
                depth,
                buckets,
            } => {
                let depth = depth.min(MAX_DIGEST_DEPTH);
                let wanted: HashSet<usize> = buckets.into_iter().collect();
                let entries = self.shared_entries(&peer, depth, Some(&wanted)).await?;
                Ok(ReplicaResponse::BucketKeys(entries))
            }
        }
    }

    /// `(key, version_set_hash)` for every stored key whose replica set
    /// contains both this node and `peer`, optionally limited to `buckets`.
    async fn shared_entries(
        &self,
        peer: &NodeId,
        depth: u8,
        buckets: Option<&HashSet<usize>>,
    ) -> Result<BTreeMap<String, Hash>, ReplicaError> {
        let mut out = BTreeMap::new();
        for key in self.store.keys().await? {
            if let Some(wanted) = buckets {
                if !wanted.contains(&bucket_of(&key, depth)) {
                    continue;
                }
            }
            if !self.shares_key_with(&key, peer) {
                continue;
            }
            if let Some(versions) = self.store.get(&key).await? {
                out.insert(key, version_set_hash(&versions));
            }
        }
        Ok(out)
    }

    fn shares_key_with(&self, key: &str, peer: &NodeId) -> bool {
        let owners: Vec<NodeId> = self
            .placement
            .preference_list(key)
            .into_iter()
            .take(self.n)
            .collect();
        owners.contains(&self.id) && owners.contains(peer)
    }
}

/// Versions held by a replica, from a `Get` response.
pub(crate) fn expect_versions(response: ReplicaResponse) -> Option<Vec<VersionedValue>> {
    match response {
        ReplicaResponse::Versions(v) => Some(v),
        _ => None,
    }
}
