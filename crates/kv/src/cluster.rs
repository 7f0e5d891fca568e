//! In-process cluster assembled from a [`ClusterConfig`].
//!
//! Wires one [`ReplicaNode`] and one [`Coordinator`] per configured node over
//! a shared [`LocalTransport`] and [`HashRing`], and owns the background hint
//! delivery and anti-entropy tasks.

use crate::clock::{Clock, SystemClock};
use crate::coordinator::{Coordinator, KvError, QuorumConfig};
use crate::hint_delivery::{deliver_hints, spawn_hint_delivery_task, DeliveryReport, HintDeliveryConfig};
use crate::hint_store::{HintStore, HintStoreError};
use crate::placement::HashRing;
use crate::repair::RepairEngine;
use crate::replica::ReplicaNode;
use crate::store::{EngineStore, StoreError};
use crate::transport::LocalTransport;
use ringkv_common::NodeId;
use ringkv_config::{ClusterConfig, ConfigError};
use ringkv_storage::FsyncPolicy;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("hint store error: {0}")]
    Hints(#[from] HintStoreError),
    #[error("kv error: {0}")]
    Kv(#[from] KvError),
}

pub struct LocalCluster {
    config: ClusterConfig,
    local: NodeId,
    ring: Arc<HashRing>,
    transport: Arc<LocalTransport>,
    nodes: BTreeMap<NodeId, Arc<ReplicaNode>>,
    coordinators: BTreeMap<NodeId, Coordinator>,
    repair: Arc<RepairEngine>,
    fsync: FsyncPolicy,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("local", &self.local)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl LocalCluster {
    pub async fn from_config(config: ClusterConfig) -> Result<Self, ClusterError> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build the cluster with an explicit clock (tests pass a `ManualClock`).
    pub async fn with_clock(
        config: ClusterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;

        let ring = Arc::new(HashRing::with_nodes(
            config.ring.virtual_nodes,
            config.nodes.iter().map(String::as_str),
        ));
        let call_timeout = Duration::from_millis(
            config.kv.read_timeout_ms.max(config.kv.write_timeout_ms),
        );
        let transport = Arc::new(LocalTransport::new(call_timeout));
        let fsync = FsyncPolicy::parse(&config.storage.fsync).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown fsync policy {:?}", config.storage.fsync))
        })?;

        let mut nodes = BTreeMap::new();
        for name in &config.nodes {
            let id = NodeId::from(name.as_str());
            let (store, hints) = if config.storage.durable {
                let dir = config.storage.data_dir.join(name);
                (
                    EngineStore::open(&dir.join("store"), fsync)?,
                    HintStore::open(&dir.join("hints"), fsync)?,
                )
            } else {
                (EngineStore::in_memory(), HintStore::in_memory())
            };
            let node = Arc::new(ReplicaNode::new(
                id.clone(),
                Arc::new(store),
                hints,
                ring.clone(),
                config.kv.n,
                clock.clone(),
            ));
            transport.register(node.clone()).await;
            nodes.insert(id, node);
        }

        let repair = Arc::new(RepairEngine::new(
            transport.clone(),
            ring.clone(),
            config.repair.digest_depth,
        ));

        let quorum = QuorumConfig::from(&config.kv);
        let mut coordinators = BTreeMap::new();
        for id in nodes.keys() {
            let coordinator = Coordinator::new(
                id.clone(),
                quorum.clone(),
                ring.clone(),
                transport.clone(),
                repair.clone(),
                clock.clone(),
            )?;
            coordinators.insert(id.clone(), coordinator);
        }

        let local = NodeId::from(config.node_id.as_str());
        tracing::info!(
            %local,
            nodes = nodes.len(),
            n = config.kv.n,
            w = config.kv.w,
            r = config.kv.r,
            durable = config.storage.durable,
            "local cluster ready"
        );

        Ok(Self {
            config,
            local,
            ring,
            transport,
            nodes,
            coordinators,
            repair,
            fsync,
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Coordinator for the configured `node_id`.
    pub fn local(&self) -> &Coordinator {
        &self.coordinators[&self.local]
    }

    pub fn coordinator(&self, id: &NodeId) -> Option<&Coordinator> {
        self.coordinators.get(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<ReplicaNode>> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn repair_engine(&self) -> &Arc<RepairEngine> {
        &self.repair
    }

    /// Spawn hint delivery for every node (when enabled), the anti-entropy
    /// task (when its interval is non-zero) and, for durable clusters under
    /// batch fsync, the periodic WAL sync.
    pub fn start_background_tasks(&mut self) {
        if self.config.storage.durable && self.fsync == FsyncPolicy::Batch {
            let every = Duration::from_millis(self.config.storage.batch_sync_interval_ms.max(1));
            self.tasks.push(spawn_batch_sync_task(
                self.nodes.values().cloned().collect(),
                every,
            ));
        }
        if self.config.hints.enabled {
            let delivery = HintDeliveryConfig::from(&self.config.hints);
            for node in self.nodes.values() {
                self.tasks.push(spawn_hint_delivery_task(
                    node.clone(),
                    self.transport.clone(),
                    delivery.clone(),
                ));
            }
        }
        let every = self.config.repair.anti_entropy_interval_secs;
        if every > 0 {
            self.tasks.push(
                self.repair
                    .clone()
                    .spawn_anti_entropy_task(Duration::from_secs(every)),
            );
        }
        tracing::info!(tasks = self.tasks.len(), "background tasks started");
    }

    /// Run one hint delivery cycle on every node.
    pub async fn deliver_all_hints(&self) -> DeliveryReport {
        let config = HintDeliveryConfig::from(&self.config.hints);
        let mut total = DeliveryReport::default();
        for node in self.nodes.values() {
            let report = deliver_hints(node, self.transport.as_ref(), &config).await;
            total.delivered += report.delivered;
            total.failed += report.failed;
            total.dropped += report.dropped;
        }
        total
    }

    /// Abort background tasks. Stores are left as they are.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Fsync every node's WALs on a fixed interval.
fn spawn_batch_sync_task(nodes: Vec<Arc<ReplicaNode>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            for node in &nodes {
                if let Err(e) = node.sync().await {
                    tracing::warn!(node = %node.id(), error = %e, "batch WAL sync failed");
                }
            }
        }
    })
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
