//! Abstraction over replica-to-replica messages.
//!
//! The coordinator, repair engine and hint delivery only ever talk to
//! replicas through [`Transport`], including the coordinator's own node.
//! [`LocalTransport`] dispatches to in-process [`ReplicaNode`]s; a network
//! transport would implement the same trait.

use crate::merkle::{Hash, MerkleDigest};
use crate::replica::ReplicaNode;
use ringkv_common::{NodeId, VersionedValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// A message sent to one replica.
#[derive(Debug, Clone)]
pub enum ReplicaRequest {
    /// Read the key's version set (local data plus any hinted copies).
    Get { key: String },
    /// Store a coordinator write. With `hint_for`, the receiver is a
    /// stand-in and keeps the write as a hint for that node.
    Put {
        key: String,
        value: VersionedValue,
        hint_for: Option<NodeId>,
    },
    /// Merge a resolved version set pushed by repair.
    RepairPush {
        key: String,
        versions: Vec<VersionedValue>,
    },
    /// Merge versions handed back by a stand-in.
    Handoff {
        key: String,
        versions: Vec<VersionedValue>,
    },
    /// Digest over the keys the receiver shares with `peer`.
    Digest { peer: NodeId, depth: u8 },
    /// Version-set hashes of shared keys in the given buckets.
    BucketKeys {
        peer: NodeId,
        depth: u8,
        buckets: Vec<usize>,
    },
}

impl ReplicaRequest {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaRequest::Get { .. } => "get",
            ReplicaRequest::Put { hint_for: None, .. } => "put",
            ReplicaRequest::Put { .. } => "put_hinted",
            ReplicaRequest::RepairPush { .. } => "repair_push",
            ReplicaRequest::Handoff { .. } => "handoff",
            ReplicaRequest::Digest { .. } => "digest",
            ReplicaRequest::BucketKeys { .. } => "bucket_keys",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReplicaResponse {
    Versions(Vec<VersionedValue>),
    Ack,
    Merged { changed: bool },
    Digest(MerkleDigest),
    BucketKeys(BTreeMap<String, Hash>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("node {0} unreachable")]
    Unreachable(NodeId),
    #[error("request to {0} timed out")]
    Timeout(NodeId),
    #[error("node {node} failed request: {message}")]
    Remote { node: NodeId, message: String },
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        (**self).send(target, request).await
    }
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

/// In-process transport: a registry of replica nodes with up/down switches
/// and a per-call timeout.
pub struct LocalTransport {
    nodes: RwLock<HashMap<NodeId, Arc<ReplicaNode>>>,
    down: RwLock<HashSet<NodeId>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl LocalTransport {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
            call_timeout,
        }
    }

    pub async fn register(&self, node: Arc<ReplicaNode>) {
        self.nodes.write().await.insert(node.id().clone(), node);
    }

    pub async fn unregister(&self, id: &NodeId) -> Option<Arc<ReplicaNode>> {
        self.nodes.write().await.remove(id)
    }

    /// Make every request to `id` fail as unreachable.
    pub async fn set_down(&self, id: &NodeId) {
        self.down.write().await.insert(id.clone());
    }

    pub async fn set_up(&self, id: &NodeId) {
        self.down.write().await.remove(id);
    }

    pub async fn is_up(&self, id: &NodeId) -> bool {
        !self.down.read().await.contains(id)
    }

    async fn dispatch(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        if self.down.read().await.contains(target) {
            return Err(TransportError::Unreachable(target.clone()));
        }
        let node = self
            .nodes
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(target.clone()))?;

        match tokio::time::timeout(self.call_timeout, node.handle(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(TransportError::Remote {
                node: target.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(TransportError::Timeout(target.clone())),
        }
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        let kind = request.kind();
        let m = ringkv_metrics::metrics();
        m.rpcs_sent_by_type.with_label_values(&[kind]).inc();

        let result = self.dispatch(target, request).await;
        if let Err(e) = &result {
            m.rpc_failures_by_type.with_label_values(&[kind]).inc();
            tracing::debug!(%target, rpc = kind, error = %e, "replica call failed");
        }
        result
    }
}
