//! KV coordinator: handles client PUT/GET/DELETE by fanning out to replicas.
//!
//! The coordinator:
//! 1. Maps a key to its N replicas (via placement)
//! 2. Reads the current versions from a write quorum and derives a vector
//!    that dominates everything it saw
//! 3. Sends the write to all N in parallel and waits for W acks, handing
//!    failed replicas' writes to stand-ins as hints
//! 4. For reads, waits for R responses, reconciles by dominance and applies
//!    the conflict policy
//! 5. Pushes the resolved versions to stale replicas (read repair)

use crate::clock::Clock;
use crate::conflict::{self, merged_context, ConflictPolicy, ReadValue};
use crate::placement::{PlacementError, PlacementOracle};
use crate::repair::{RepairEngine, RepairError, RepairReport};
use crate::replica::expect_versions;
use crate::sloppy::{SloppyQuorumHandler, WriteFuts};
use crate::transport::{ReplicaRequest, Transport, TransportError};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use ringkv_common::{reconcile_versions, NodeId, VersionVector, VersionedValue};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

pub use ringkv_config::ReadRepair;

/// Quorum and replication configuration.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Replication factor (N).
    pub n: usize,
    /// Write quorum (W).
    pub w: usize,
    /// Read quorum (R).
    pub r: usize,
    /// Write deadline.
    pub write_timeout: Duration,
    /// Read deadline.
    pub read_timeout: Duration,
    pub read_repair: ReadRepair,
    pub conflict_policy: ConflictPolicy,
    /// Substitute unreachable replicas with stand-ins.
    pub sloppy_quorum: bool,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self::from(&ringkv_config::KvConfig::default())
    }
}

impl From<&ringkv_config::KvConfig> for QuorumConfig {
    fn from(c: &ringkv_config::KvConfig) -> Self {
        Self {
            n: c.n,
            w: c.w,
            r: c.r,
            write_timeout: Duration::from_millis(c.write_timeout_ms),
            read_timeout: Duration::from_millis(c.read_timeout_ms),
            read_repair: c.read_repair,
            conflict_policy: c.conflict_policy,
            sloppy_quorum: c.sloppy_quorum,
        }
    }
}

impl QuorumConfig {
    /// Require `1 <= W, R <= N`. `W + R > N` is not required.
    pub fn validate(&self) -> Result<(), KvError> {
        if self.n == 0 {
            return Err(KvError::InvalidQuorum("n must be > 0".into()));
        }
        if self.w == 0 || self.w > self.n {
            return Err(KvError::InvalidQuorum(format!(
                "w ({}) must be in 1..={}",
                self.w, self.n
            )));
        }
        if self.r == 0 || self.r > self.n {
            return Err(KvError::InvalidQuorum(format!(
                "r ({}) must be in 1..={}",
                self.r, self.n
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("quorum not reached: need {needed}, got {got}")]
    QuorumUnavailable { needed: usize, got: usize },
    #[error("not enough nodes for placement: need {needed}, have {available}")]
    PlacementUnavailable { needed: usize, available: usize },
    #[error("key not found")]
    NotFound,
    #[error("invalid quorum config: {0}")]
    InvalidQuorum(String),
    #[error("repair failed: {0}")]
    Repair(#[from] RepairError),
}

impl From<PlacementError> for KvError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::Unavailable { needed, available } => {
                KvError::PlacementUnavailable { needed, available }
            }
        }
    }
}

/// Acknowledgement of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAck {
    /// Vector stamped on the written version.
    pub version: VersionVector,
    /// Coordinator clock reading stamped on the written version.
    pub timestamp_ms: u64,
    /// Replicas (including stand-ins) that acknowledged before returning.
    pub acks: usize,
    /// How many of those acks were hints held by stand-ins.
    pub hinted: usize,
}

struct ReadOutcome {
    node: NodeId,
    stand_in: bool,
    result: Result<Vec<VersionedValue>, TransportError>,
}

type ReadFuts = FuturesUnordered<JoinHandle<ReadOutcome>>;

/// Responses gathered from a read fan-out.
struct Gathered {
    successes: usize,
    /// `(replica, versions)` from primary replicas.
    primaries: Vec<(NodeId, Vec<VersionedValue>)>,
    /// Versions reported by stand-ins (hinted copies).
    hinted: Vec<VersionedValue>,
    /// Reads still in flight when the quorum was met.
    pending: ReadFuts,
}

impl Gathered {
    fn all_versions(&self) -> Vec<VersionedValue> {
        self.primaries
            .iter()
            .flat_map(|(_, v)| v.iter().cloned())
            .chain(self.hinted.iter().cloned())
            .collect()
    }
}

/// Distributed KV coordinator.
///
/// Every replica call, including to the coordinator's own node, goes through
/// the [`Transport`].
pub struct Coordinator {
    id: NodeId,
    config: QuorumConfig,
    placement: Arc<dyn PlacementOracle>,
    transport: Arc<dyn Transport>,
    sloppy: SloppyQuorumHandler,
    repair: Arc<RepairEngine>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        id: NodeId,
        config: QuorumConfig,
        placement: Arc<dyn PlacementOracle>,
        transport: Arc<dyn Transport>,
        repair: Arc<RepairEngine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KvError> {
        config.validate()?;
        if config.w + config.r <= config.n {
            tracing::warn!(
                n = config.n,
                w = config.w,
                r = config.r,
                "W + R <= N: reads may miss acknowledged writes"
            );
        }
        let sloppy =
            SloppyQuorumHandler::new(placement.clone(), transport.clone(), config.sloppy_quorum);
        Ok(Self {
            id,
            config,
            placement,
            transport,
            sloppy,
            repair,
            clock,
        })
    }

    /// Node id used as this coordinator's version-vector component.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // PUT / DELETE
    // -----------------------------------------------------------------------

    /// Write a value. Succeeds once W replicas (or their stand-ins) ack.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<PutAck, KvError> {
        ringkv_metrics::metrics().kv_puts.inc();
        let _timer = ringkv_metrics::start_kv_timer("put");
        self.write(key, Some(value), None).await
    }

    /// Write a value that descends from `context` (the vector of a previous
    /// read or write by the same client) as well as whatever W replicas hold.
    pub async fn put_with_context(
        &self,
        key: &str,
        value: Vec<u8>,
        context: &VersionVector,
    ) -> Result<PutAck, KvError> {
        ringkv_metrics::metrics().kv_puts.inc();
        let _timer = ringkv_metrics::start_kv_timer("put");
        self.write(key, Some(value), Some(context)).await
    }

    /// Delete a key by writing a tombstone through the same quorum path.
    pub async fn delete(&self, key: &str) -> Result<PutAck, KvError> {
        ringkv_metrics::metrics().kv_deletes.inc();
        let _timer = ringkv_metrics::start_kv_timer("delete");
        self.write(key, None, None).await
    }

    /// Delete a key, descending from `context` as in [`Self::put_with_context`].
    pub async fn delete_with_context(
        &self,
        key: &str,
        context: &VersionVector,
    ) -> Result<PutAck, KvError> {
        ringkv_metrics::metrics().kv_deletes.inc();
        let _timer = ringkv_metrics::start_kv_timer("delete");
        self.write(key, None, Some(context)).await
    }

    async fn write(
        &self,
        key: &str,
        value: Option<Vec<u8>>,
        context: Option<&VersionVector>,
    ) -> Result<PutAck, KvError> {
        let replicas = self.placement.replicas_for(key, self.config.n)?;
        let w = self.config.w;
        let deadline = Instant::now() + self.config.write_timeout;
        let write_id = uuid::Uuid::new_v4();

        // Read phase: the new vector must dominate whatever the replicas hold.
        let observed = self.gather(key, &replicas, w, deadline).await;
        let mut version = merged_context(&observed.all_versions());
        if let Some(context) = context {
            version = version.merge(context);
        }
        version.increment(&self.id);

        let now = self.clock.now_ms();
        let versioned = match value {
            Some(v) => VersionedValue::new(v, version.clone(), now),
            None => VersionedValue::tombstone(version.clone(), now),
        };

        // Write phase.
        let mut used: HashSet<NodeId> = replicas.iter().cloned().collect();
        let mut futs = WriteFuts::new();
        for replica in &replicas {
            futs.push(self.sloppy.spawn_write(replica.clone(), None, key, &versioned));
        }

        let mut acks = 0usize;
        let mut hinted = 0usize;
        while acks < w {
            let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
                .await
                .ok()
                .flatten()
            else {
                break;
            };
            let Ok(outcome) = joined else { continue };
            match &outcome.result {
                Ok(()) => {
                    acks += 1;
                    if outcome.stand_in.is_some() {
                        hinted += 1;
                    }
                    tracing::debug!(%write_id, key, node = %outcome.receiver(), "replica ack");
                }
                Err(e) => {
                    tracing::debug!(%write_id, key, node = %outcome.receiver(), error = %e, "replica write failed");
                    self.sloppy
                        .substitute(&outcome, key, &versioned, &mut used, &mut futs);
                }
            }
        }

        if acks < w {
            ringkv_metrics::metrics().quorum_failures.inc();
            tracing::warn!(%write_id, key, needed = w, got = acks, "write quorum not reached");
            return Err(KvError::QuorumUnavailable {
                needed: w,
                got: acks,
            });
        }

        self.sloppy
            .spawn_drain(key.to_string(), versioned, futs, used);
        Ok(PutAck {
            version,
            timestamp_ms: now,
            acks,
            hinted,
        })
    }

    // -----------------------------------------------------------------------
    // GET
    // -----------------------------------------------------------------------

    /// Read a key from R replicas (stand-ins fill in for failed ones).
    pub async fn get(&self, key: &str) -> Result<ReadValue, KvError> {
        ringkv_metrics::metrics().kv_gets.inc();
        let _timer = ringkv_metrics::start_kv_timer("get");

        let replicas = self.placement.replicas_for(key, self.config.n)?;
        let r = self.config.r;
        let deadline = Instant::now() + self.config.read_timeout;

        let gathered = self.gather(key, &replicas, r, deadline).await;
        if gathered.successes < r {
            ringkv_metrics::metrics().quorum_failures.inc();
            tracing::warn!(key, needed = r, got = gathered.successes, "read quorum not reached");
            return Err(KvError::QuorumUnavailable {
                needed: r,
                got: gathered.successes,
            });
        }

        let reconciled = reconcile_versions(gathered.all_versions());
        if reconciled.is_empty() {
            return Err(KvError::NotFound);
        }

        let resolution = conflict::resolve(self.config.conflict_policy, reconciled);
        if matches!(resolution.read, Some(ReadValue::Conflict { .. })) {
            ringkv_metrics::metrics().conflicts_detected.inc();
            tracing::debug!(key, "read found concurrent siblings");
        }

        let Gathered {
            primaries, pending, ..
        } = gathered;
        match self.config.read_repair {
            ReadRepair::Disabled => {}
            ReadRepair::Background => {
                let repair = self.repair.clone();
                let key = key.to_string();
                let canonical = resolution.canonical.clone();
                tokio::spawn(async move {
                    repair_observed(&repair, &key, &canonical, primaries, pending, None).await;
                });
            }
            ReadRepair::Inline => {
                repair_observed(
                    &self.repair,
                    key,
                    &resolution.canonical,
                    primaries,
                    pending,
                    Some(deadline),
                )
                .await;
            }
        }

        resolution.read.ok_or(KvError::NotFound)
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Run one passive repair pass between two nodes.
    pub async fn force_repair(&self, a: &NodeId, b: &NodeId) -> Result<RepairReport, KvError> {
        Ok(self.repair.sync_pair(a, b).await?)
    }

    // -----------------------------------------------------------------------
    // Internal: read fan-out
    // -----------------------------------------------------------------------

    /// Send `Get` to every replica and collect until `quorum` succeed, all
    /// have answered, or the deadline passes. When failures make the quorum
    /// unreachable from the remaining replicas, stand-ins are queried too.
    async fn gather(
        &self,
        key: &str,
        replicas: &[NodeId],
        quorum: usize,
        deadline: Instant,
    ) -> Gathered {
        let mut futs = ReadFuts::new();
        for replica in replicas {
            futs.push(self.spawn_get(replica.clone(), false, key));
        }
        let mut used: HashSet<NodeId> = replicas.iter().cloned().collect();

        let mut successes = 0usize;
        let mut primaries = Vec::new();
        let mut hinted = Vec::new();

        while successes < quorum {
            let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
                .await
                .ok()
                .flatten()
            else {
                break;
            };
            let Ok(outcome) = joined else { continue };
            match outcome.result {
                Ok(versions) => {
                    successes += 1;
                    if outcome.stand_in {
                        hinted.extend(versions);
                    } else {
                        primaries.push((outcome.node, versions));
                    }
                }
                Err(e) => {
                    tracing::debug!(key, node = %outcome.node, error = %e, "replica read failed");
                    if self.sloppy.is_enabled() && successes + futs.len() < quorum {
                        if let Some(next) = self.sloppy.stand_ins(key, &used, 1).pop() {
                            used.insert(next.clone());
                            futs.push(self.spawn_get(next, true, key));
                        }
                    }
                }
            }
        }

        Gathered {
            successes,
            primaries,
            hinted,
            pending: futs,
        }
    }

    fn spawn_get(&self, node: NodeId, stand_in: bool, key: &str) -> JoinHandle<ReadOutcome> {
        let transport = self.transport.clone();
        let request = ReplicaRequest::Get {
            key: key.to_string(),
        };
        tokio::spawn(async move {
            let result = match transport.send(&node, request).await {
                Ok(response) => expect_versions(response).ok_or_else(|| TransportError::Remote {
                    node: node.clone(),
                    message: "unexpected response to get".into(),
                }),
                Err(e) => Err(e),
            };
            ReadOutcome {
                node,
                stand_in,
                result,
            }
        })
    }
}

/// Push `canonical` to stale replicas among `observed`, then to any stale
/// replica whose answer arrives late (until `deadline`, if given).
async fn repair_observed(
    repair: &RepairEngine,
    key: &str,
    canonical: &[VersionedValue],
    observed: Vec<(NodeId, Vec<VersionedValue>)>,
    mut pending: ReadFuts,
    deadline: Option<Instant>,
) {
    repair.push_resolved(key, canonical, &observed).await;

    let mut late = Vec::new();
    loop {
        let next = match deadline {
            Some(d) => tokio::time::timeout_at(d, pending.next()).await.ok().flatten(),
            None => pending.next().await,
        };
        let Some(joined) = next else { break };
        if let Ok(ReadOutcome {
            node,
            stand_in: false,
            result: Ok(versions),
        }) = joined
        {
            late.push((node, versions));
        }
    }
    if !late.is_empty() {
        repair.push_resolved(key, canonical, &late).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use ringkv_config::{ClusterConfig, ConflictPolicy};

    fn config(nodes: &[&str], n: usize, w: usize, r: usize) -> ClusterConfig {
        let mut cfg = ringkv_config::load_from_str(&format!(
            "node_id: {}\nnodes: [{}]\n",
            nodes[0],
            nodes.join(", ")
        ))
        .unwrap();
        cfg.ring.virtual_nodes = 16;
        cfg.kv.n = n;
        cfg.kv.w = w;
        cfg.kv.r = r;
        cfg.kv.read_timeout_ms = 500;
        cfg.kv.write_timeout_ms = 500;
        cfg.kv.read_repair = ReadRepair::Inline;
        cfg
    }

    async fn cluster(cfg: ClusterConfig) -> LocalCluster {
        LocalCluster::from_config(cfg).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let c = cluster(config(&["A", "B", "C"], 3, 2, 2)).await;
        let coord = c.local();

        let ack = coord.put("k1", b"v1".to_vec()).await.unwrap();
        assert_eq!(ack.version.get(coord.id()), 1);
        assert!(ack.acks >= 2);
        assert_eq!(ack.hinted, 0);

        let got = coord.get("k1").await.unwrap();
        assert_eq!(got.value(), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn test_overwrite_dominates() {
        let c = cluster(config(&["A", "B", "C"], 3, 2, 2)).await;
        let coord = c.local();

        let ack1 = coord.put("k1", b"v1".to_vec()).await.unwrap();
        let ack2 = coord.put("k1", b"v2".to_vec()).await.unwrap();
        assert!(ack2.version.dominates(&ack1.version));

        let got = coord.get("k1").await.unwrap();
        assert_eq!(got.value(), Some(&b"v2"[..]));
    }

    #[tokio::test]
    async fn test_writes_from_other_coordinator_descend() {
        let c = cluster(config(&["A", "B", "C"], 3, 3, 1)).await;
        let a = c.coordinator(&"A".into()).unwrap();
        let b = c.coordinator(&"B".into()).unwrap();

        let first = a.put("k", b"from-a".to_vec()).await.unwrap();
        let second = b.put("k", b"from-b".to_vec()).await.unwrap();
        assert!(second.version.dominates(&first.version));
        assert_eq!(second.version.get(&"A".into()), 1);
        assert_eq!(second.version.get(&"B".into()), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let c = cluster(config(&["A", "B", "C"], 3, 2, 2)).await;
        let coord = c.local();

        let put = coord.put("k1", b"v1".to_vec()).await.unwrap();
        let del = coord.delete("k1").await.unwrap();
        assert!(del.version.dominates(&put.version));

        assert!(matches!(coord.get("k1").await, Err(KvError::NotFound)));

        // Writing again after a delete resurrects the key.
        coord.put("k1", b"v2".to_vec()).await.unwrap();
        assert_eq!(coord.get("k1").await.unwrap().value(), Some(&b"v2"[..]));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let c = cluster(config(&["A", "B", "C"], 3, 2, 2)).await;
        let result = c.local().get("nonexistent").await;
        assert!(matches!(result, Err(KvError::NotFound)));
    }

    #[tokio::test]
    async fn test_quorum_unavailable_without_sloppy() {
        let mut cfg = config(&["A", "B", "C", "D"], 3, 2, 2);
        cfg.kv.sloppy_quorum = false;
        let c = cluster(cfg).await;
        let replicas = c.ring().replicas_for("k", 3).unwrap();
        c.transport().set_down(&replicas[1]).await;
        c.transport().set_down(&replicas[2]).await;

        let err = c.local().put("k", b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, KvError::QuorumUnavailable { needed: 2, got: 1 }));
        let err = c.local().get("k").await.unwrap_err();
        assert!(matches!(err, KvError::QuorumUnavailable { needed: 2, .. }));
    }

    #[tokio::test]
    async fn test_placement_unavailable() {
        let c = cluster(config(&["A", "B", "C"], 3, 2, 2)).await;
        c.ring().remove_node(&"C".into());
        let err = c.local().put("k", b"v".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            KvError::PlacementUnavailable {
                needed: 3,
                available: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_lww_policy_returns_single_value() {
        let mut cfg = config(&["A", "B", "C"], 3, 1, 3);
        cfg.kv.conflict_policy = ConflictPolicy::LastWriterWins;
        cfg.kv.sloppy_quorum = false;
        let c = cluster(cfg).await;
        let replicas = c.ring().replicas_for("k", 3).unwrap();

        // Partition so each side writes without seeing the other.
        c.transport().set_down(&replicas[1]).await;
        c.transport().set_down(&replicas[2]).await;
        c.coordinator(&"A".into())
            .unwrap()
            .put("k", b"first".to_vec())
            .await
            .unwrap();
        // Let the failed background writes settle before healing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.transport().set_up(&replicas[1]).await;
        c.transport().set_up(&replicas[2]).await;
        c.transport().set_down(&replicas[0]).await;
        c.coordinator(&"B".into())
            .unwrap()
            .put("k", b"second".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.transport().set_up(&replicas[0]).await;

        let got = c.local().get("k").await.unwrap();
        match got {
            ReadValue::Value(v) => assert_eq!(v.value, b"second"),
            other => panic!("expected a single value, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_with_context_descends_from_client_vector() {
        let c = cluster(config(&["A", "B", "C"], 3, 2, 2)).await;
        let coord = c.local();
        let client = VersionVector::from_entries([("Z", 5)]);

        let ack = coord.put_with_context("k", b"v".to_vec(), &client).await.unwrap();
        assert!(ack.version.dominates(&client));
        assert_eq!(ack.version.get(coord.id()), 1);

        let del = coord.delete_with_context("k", &ack.version).await.unwrap();
        assert!(del.version.dominates(&ack.version));
        assert!(matches!(coord.get("k").await, Err(KvError::NotFound)));
    }

    #[test]
    fn test_quorum_validation() {
        let mut q = QuorumConfig::default();
        assert!(q.validate().is_ok());
        q.w = 4;
        assert!(matches!(q.validate(), Err(KvError::InvalidQuorum(_))));
        q.w = 2;
        q.r = 0;
        assert!(matches!(q.validate(), Err(KvError::InvalidQuorum(_))));
    }
}
