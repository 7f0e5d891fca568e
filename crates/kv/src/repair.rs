//! Replica repair.
//!
//! Active repair pushes a resolved version set to replicas observed holding
//! something else. Passive repair (anti-entropy) compares two nodes' Merkle
//! digests over the keys they share, descends into the diverging buckets and
//! reconciles only the keys that differ.

use crate::conflict::differs;
use crate::merkle::{Hash, MerkleDigest};
use crate::placement::PlacementOracle;
use crate::replica::expect_versions;
use crate::transport::{ReplicaRequest, ReplicaResponse, Transport, TransportError};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::seq::SliceRandom;
use ringkv_common::{reconcile_versions, NodeId, VersionedValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("node {0} unreachable during repair")]
    Unreachable(NodeId),
    #[error("unexpected response from {node} to {request} request")]
    UnexpectedResponse { node: NodeId, request: &'static str },
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for RepairError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(node) | TransportError::Timeout(node) => {
                RepairError::Unreachable(node)
            }
            other => RepairError::Transport(other),
        }
    }
}

/// Counts from one passive repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub buckets_diverged: usize,
    /// Keys listed in the diverging buckets on either side.
    pub keys_compared: usize,
    /// Keys that needed a push to at least one side.
    pub keys_repaired: usize,
    /// Pushes that changed a replica's store.
    pub writes: usize,
}

pub struct RepairEngine {
    transport: Arc<dyn Transport>,
    placement: Arc<dyn PlacementOracle>,
    depth: u8,
}

impl std::fmt::Debug for RepairEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairEngine")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl RepairEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        placement: Arc<dyn PlacementOracle>,
        depth: u8,
    ) -> Self {
        Self {
            transport,
            placement,
            depth,
        }
    }

    // -----------------------------------------------------------------------
    // Active repair
    // -----------------------------------------------------------------------

    /// Push `canonical` to every observed replica whose set differs from it.
    /// Returns the number of replicas that accepted the push.
    pub async fn push_resolved(
        &self,
        key: &str,
        canonical: &[VersionedValue],
        observations: &[(NodeId, Vec<VersionedValue>)],
    ) -> usize {
        if canonical.is_empty() {
            return 0;
        }
        let mut futs: FuturesUnordered<_> = observations
            .iter()
            .filter(|(_, held)| differs(held, canonical))
            .map(|(node, _)| async move { (node, self.push(node, key, canonical.to_vec()).await) })
            .collect();

        let mut pushed = 0usize;
        while let Some((node, result)) = futs.next().await {
            match result {
                Ok(_) => {
                    pushed += 1;
                    ringkv_metrics::metrics().read_repairs.inc();
                    tracing::debug!(key, %node, "read repair pushed");
                }
                Err(e) => tracing::debug!(key, %node, error = %e, "read repair push failed"),
            }
        }
        pushed
    }

    // -----------------------------------------------------------------------
    // Passive repair
    // -----------------------------------------------------------------------

    /// One anti-entropy pass between `a` and `b`.
    pub async fn sync_pair(&self, a: &NodeId, b: &NodeId) -> Result<RepairReport, RepairError> {
        let m = ringkv_metrics::metrics();
        m.anti_entropy_runs.inc();
        let mut report = RepairReport::default();

        let (da, db) = tokio::join!(self.digest(a, b), self.digest(b, a));
        let (da, db) = (da?, db?);
        if da.root_hash() == db.root_hash() {
            tracing::debug!(%a, %b, "replicas in sync");
            return Ok(report);
        }

        let buckets = da.diff_buckets(&db);
        report.buckets_diverged = buckets.len();

        let (ka, kb) = tokio::join!(
            self.bucket_keys(a, b, buckets.clone()),
            self.bucket_keys(b, a, buckets)
        );
        let (ka, kb) = (ka?, kb?);

        let all_keys: BTreeSet<&String> = ka.keys().chain(kb.keys()).collect();
        report.keys_compared = all_keys.len();

        for key in all_keys {
            if ka.get(key) == kb.get(key) {
                continue;
            }
            let (va, vb) = tokio::join!(self.versions(a, key), self.versions(b, key));
            let (va, vb) = (va?, vb?);

            let mut all = va.clone();
            all.extend(vb.iter().cloned());
            let reconciled = reconcile_versions(all);

            let mut repaired = false;
            for (node, held) in [(a, &va), (b, &vb)] {
                if differs(held, &reconciled) {
                    repaired = true;
                    if self.push(node, key, reconciled.clone()).await? {
                        report.writes += 1;
                    }
                }
            }
            if repaired {
                report.keys_repaired += 1;
            }
        }

        m.anti_entropy_keys_repaired
            .inc_by(report.keys_repaired as u64);
        tracing::info!(
            %a,
            %b,
            buckets = report.buckets_diverged,
            compared = report.keys_compared,
            repaired = report.keys_repaired,
            writes = report.writes,
            "anti-entropy pass"
        );
        Ok(report)
    }

    /// Run [`Self::sync_pair`] on a random pair of ring nodes. `None` when the
    /// ring has fewer than two nodes.
    pub async fn sync_random_pair(&self) -> Option<Result<RepairReport, RepairError>> {
        let pair: Vec<NodeId> = {
            let nodes = self.placement.nodes();
            let mut rng = rand::thread_rng();
            nodes.choose_multiple(&mut rng, 2).cloned().collect()
        };
        match pair.as_slice() {
            [a, b] => Some(self.sync_pair(a, b).await),
            _ => None,
        }
    }

    /// Spawn periodic anti-entropy between random node pairs. Failed passes
    /// are logged and retried on the next tick.
    pub fn spawn_anti_entropy_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            // The first tick fires immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Some(Err(e)) = self.sync_random_pair().await {
                    tracing::warn!(error = %e, "anti-entropy pass failed");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    async fn digest(&self, node: &NodeId, peer: &NodeId) -> Result<MerkleDigest, RepairError> {
        let request = ReplicaRequest::Digest {
            peer: peer.clone(),
            depth: self.depth,
        };
        match self.transport.send(node, request).await? {
            ReplicaResponse::Digest(d) => Ok(d),
            _ => Err(unexpected(node, "digest")),
        }
    }

    async fn bucket_keys(
        &self,
        node: &NodeId,
        peer: &NodeId,
        buckets: Vec<usize>,
    ) -> Result<BTreeMap<String, Hash>, RepairError> {
        let request = ReplicaRequest::BucketKeys {
            peer: peer.clone(),
            depth: self.depth,
            buckets,
        };
        match self.transport.send(node, request).await? {
            ReplicaResponse::BucketKeys(keys) => Ok(keys),
            _ => Err(unexpected(node, "bucket_keys")),
        }
    }

    async fn versions(&self, node: &NodeId, key: &str) -> Result<Vec<VersionedValue>, RepairError> {
        let request = ReplicaRequest::Get {
            key: key.to_string(),
        };
        let response = self.transport.send(node, request).await?;
        expect_versions(response).ok_or_else(|| unexpected(node, "get"))
    }

    /// Returns whether the replica's store changed.
    async fn push(
        &self,
        node: &NodeId,
        key: &str,
        versions: Vec<VersionedValue>,
    ) -> Result<bool, RepairError> {
        let request = ReplicaRequest::RepairPush {
            key: key.to_string(),
            versions,
        };
        match self.transport.send(node, request).await? {
            ReplicaResponse::Merged { changed } => Ok(changed),
            _ => Err(unexpected(node, "repair_push")),
        }
    }
}

fn unexpected(node: &NodeId, request: &'static str) -> RepairError {
    RepairError::UnexpectedResponse {
        node: node.clone(),
        request,
    }
}
