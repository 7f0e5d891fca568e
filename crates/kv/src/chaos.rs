//! Fault injection for tests.
//!
//! [`ChaosTransport`] wraps any `T: Transport` and injects random errors,
//! per-node failures and latency. [`ChaosStore`] wraps any store and reports
//! marked keys as corrupt.

use crate::store::{ReplicaStore, StoreError};
use crate::transport::{ReplicaRequest, ReplicaResponse, Transport, TransportError};
use rand::Rng;
use ringkv_common::{NodeId, VersionedValue};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for transport chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`Transport`] wrapper that injects chaos (failures, latency, per-node blocks).
pub struct ChaosTransport<T: Transport> {
    inner: Arc<T>,
    config: Arc<RwLock<ChaosConfig>>,
    /// Nodes that are explicitly marked as failed.
    failed_nodes: Arc<RwLock<HashSet<NodeId>>>,
}

impl<T: Transport> std::fmt::Debug for ChaosTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosTransport").finish_non_exhaustive()
    }
}

impl<T: Transport> ChaosTransport<T> {
    pub fn new(inner: Arc<T>, config: ChaosConfig) -> Self {
        Self {
            inner,
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    /// Mark a node as failed (until recovered).
    pub async fn fail_node(&self, node_id: NodeId) {
        self.failed_nodes.write().await.insert(node_id);
    }

    /// Remove a node from the failed set.
    pub async fn recover_node(&self, node_id: &NodeId) {
        self.failed_nodes.write().await.remove(node_id);
    }

    /// Dynamically update the random failure rate.
    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration, jitter: Duration) {
        let mut config = self.config.write().await;
        config.latency = latency;
        config.jitter = jitter;
    }

    /// Apply chaos checks: returns Err if the request should fail.
    async fn maybe_fail(&self, target: &NodeId) -> Result<(), TransportError> {
        if self.failed_nodes.read().await.contains(target) {
            return Err(TransportError::Unreachable(target.clone()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            let delay = config.latency + Duration::from_millis(jitter_ms);
            (delay, config.failure_rate)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(TransportError::Remote {
                node: target.clone(),
                message: "chaos: random failure".into(),
            });
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Transport> Transport for ChaosTransport<T> {
    async fn send(
        &self,
        target: &NodeId,
        request: ReplicaRequest,
    ) -> Result<ReplicaResponse, TransportError> {
        self.maybe_fail(target).await?;
        self.inner.send(target, request).await
    }
}

// ---------------------------------------------------------------------------
// ChaosStore
// ---------------------------------------------------------------------------

/// A store wrapper that fails reads and writes of marked keys with
/// [`StoreError::Corrupt`].
#[derive(Debug)]
pub struct ChaosStore<S: ReplicaStore> {
    inner: S,
    corrupt: RwLock<HashSet<String>>,
}

impl<S: ReplicaStore> ChaosStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            corrupt: RwLock::new(HashSet::new()),
        }
    }

    pub async fn mark_corrupt(&self, key: &str) {
        self.corrupt.write().await.insert(key.to_string());
    }

    pub async fn clear_corrupt(&self, key: &str) {
        self.corrupt.write().await.remove(key);
    }

    async fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.corrupt.read().await.contains(key) {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: ReplicaStore> ReplicaStore for ChaosStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<VersionedValue>>, StoreError> {
        self.check(key).await?;
        self.inner.get(key).await
    }

    async fn replace(&self, key: &str, versions: Vec<VersionedValue>) -> Result<(), StoreError> {
        self.check(key).await?;
        self.inner.replace(key, versions).await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys().await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.inner.sync().await
    }
}

// ────────────────────────── Tests ──────────────────────────
