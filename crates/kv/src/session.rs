//! Client sessions with read-your-own-writes.
//!
//! A [`Session`] wraps a [`Coordinator`] and remembers, per key, the last
//! version it wrote and the newest context it has seen. Reads that come back
//! without the session's own write (weak quorums, or a write acked through
//! stand-ins whose hints have not been handed off yet) are patched with the
//! remembered write. Writes carry the remembered context so they descend from
//! everything the session has observed.

use crate::conflict::{self, ReadValue};
use crate::coordinator::{Coordinator, KvError, PutAck};
use ringkv_common::{reconcile_versions, VersionOrder, VersionVector, VersionedValue};
use std::collections::HashMap;

#[derive(Debug)]
pub struct Session<'a> {
    coordinator: &'a Coordinator,
    /// Newest context read or written, per key.
    seen: HashMap<String, VersionVector>,
    /// Last write per key (a tombstone for deletes).
    written: HashMap<String, VersionedValue>,
}

impl<'a> Session<'a> {
    pub fn new(coordinator: &'a Coordinator) -> Self {
        Self {
            coordinator,
            seen: HashMap::new(),
            written: HashMap::new(),
        }
    }

    /// Context the session's next write to `key` will descend from.
    pub fn context(&self, key: &str) -> Option<&VersionVector> {
        self.seen.get(key)
    }

    pub async fn put(&mut self, key: &str, value: Vec<u8>) -> Result<PutAck, KvError> {
        let context = self.seen.get(key).cloned().unwrap_or_default();
        let ack = self
            .coordinator
            .put_with_context(key, value.clone(), &context)
            .await?;
        self.remember(
            key,
            VersionedValue::new(value, ack.version.clone(), ack.timestamp_ms),
        );
        Ok(ack)
    }

    pub async fn delete(&mut self, key: &str) -> Result<PutAck, KvError> {
        let context = self.seen.get(key).cloned().unwrap_or_default();
        let ack = self.coordinator.delete_with_context(key, &context).await?;
        self.remember(
            key,
            VersionedValue::tombstone(ack.version.clone(), ack.timestamp_ms),
        );
        Ok(ack)
    }

    /// Quorum read that never returns state older than this session's last
    /// write to `key`.
    pub async fn get(&mut self, key: &str) -> Result<ReadValue, KvError> {
        let read = match self.coordinator.get(key).await {
            Ok(read) => Some(read),
            Err(KvError::NotFound) => None,
            Err(e) => return Err(e),
        };

        let read = match self.written.get(key) {
            Some(own) if !covers(read.as_ref(), &own.vclock) => {
                tracing::debug!(
                    coordinator = %self.coordinator.id(),
                    key,
                    "read missed the session's own write; serving it from the session"
                );
                let mut versions = read.map(into_versions).unwrap_or_default();
                versions.push(own.clone());
                conflict::resolve(
                    self.coordinator.config().conflict_policy,
                    reconcile_versions(versions),
                )
                .read
            }
            _ => read,
        };

        let read = read.ok_or(KvError::NotFound)?;
        self.observe(key, read.context());
        Ok(read)
    }

    fn remember(&mut self, key: &str, own: VersionedValue) {
        self.observe(key, &own.vclock);
        self.written.insert(key.to_string(), own);
    }

    fn observe(&mut self, key: &str, context: &VersionVector) {
        let merged = match self.seen.get(key) {
            Some(seen) => seen.merge(context),
            None => context.clone(),
        };
        self.seen.insert(key.to_string(), merged);
    }
}

/// Whether `read` already reflects the version stamped `own`.
fn covers(read: Option<&ReadValue>, own: &VersionVector) -> bool {
    read.is_some_and(|r| {
        matches!(
            r.context().compare(own),
            VersionOrder::Dominates | VersionOrder::Equal
        )
    })
}

fn into_versions(read: ReadValue) -> Vec<VersionedValue> {
    match read {
        ReadValue::Value(v) => vec![v],
        ReadValue::Conflict { siblings, .. } => siblings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use ringkv_common::NodeId;
    use ringkv_config::{ClusterConfig, ReadRepair};
    use tokio::time::{sleep, Duration};

    fn config() -> ClusterConfig {
        let mut cfg = ringkv_config::load_from_str("node_id: A\nnodes: [A, B, C]\n").unwrap();
        cfg.ring.virtual_nodes = 16;
        cfg.kv.w = 1;
        cfg.kv.r = 1;
        cfg.kv.read_timeout_ms = 300;
        cfg.kv.write_timeout_ms = 300;
        cfg.kv.read_repair = ReadRepair::Disabled;
        cfg
    }

    async fn settle() {
        sleep(Duration::from_millis(20)).await;
    }

    /// Leaves `only` as the single replica holding the next write, then
    /// flips availability so reads can only reach the other two.
    async fn isolate(c: &LocalCluster, only: &NodeId, up: bool) {
        for id in c.node_ids() {
            if id == only {
                continue;
            }
            if up {
                c.transport().set_up(id).await;
            } else {
                c.transport().set_down(id).await;
            }
        }
    }

    #[tokio::test]
    async fn test_stale_read_returns_own_write() {
        let c = LocalCluster::from_config(config()).await.unwrap();
        let a = NodeId::from("A");
        let coord = c.local();
        coord.put("k", b"v0".to_vec()).await.unwrap();
        settle().await;

        let mut session = Session::new(coord);
        isolate(&c, &a, false).await;
        let ack = session.put("k", b"v1".to_vec()).await.unwrap();
        assert_eq!(ack.acks, 1);
        settle().await;
        isolate(&c, &a, true).await;
        c.transport().set_down(&a).await;

        let plain = coord.get("k").await.unwrap();
        assert_eq!(plain.value(), Some(&b"v0"[..]), "weak quorum misses the write");

        let got = session.get("k").await.unwrap();
        assert_eq!(got.value(), Some(&b"v1"[..]));
        assert!(session.context("k").unwrap().dominates(plain.context()));
    }

    #[tokio::test]
    async fn test_own_write_visible_before_any_replica_has_key() {
        let c = LocalCluster::from_config(config()).await.unwrap();
        let a = NodeId::from("A");
        let mut session = Session::new(c.local());

        isolate(&c, &a, false).await;
        session.put("fresh", b"mine".to_vec()).await.unwrap();
        settle().await;
        isolate(&c, &a, true).await;
        c.transport().set_down(&a).await;

        assert!(matches!(c.local().get("fresh").await, Err(KvError::NotFound)));
        let got = session.get("fresh").await.unwrap();
        assert_eq!(got.value(), Some(&b"mine"[..]));
    }

    #[tokio::test]
    async fn test_own_delete_hides_stale_value() {
        let c = LocalCluster::from_config(config()).await.unwrap();
        let a = NodeId::from("A");
        c.local().put("k", b"old".to_vec()).await.unwrap();
        settle().await;

        let mut session = Session::new(c.local());
        isolate(&c, &a, false).await;
        session.delete("k").await.unwrap();
        settle().await;
        isolate(&c, &a, true).await;
        c.transport().set_down(&a).await;

        assert!(matches!(session.get("k").await, Err(KvError::NotFound)));
    }

    #[tokio::test]
    async fn test_fresh_read_passes_through() {
        let c = LocalCluster::from_config(config()).await.unwrap();
        let mut session = Session::new(c.local());
        session.put("k", b"v1".to_vec()).await.unwrap();
        settle().await;

        // A newer write by another client supersedes the session's.
        let other = c.coordinator(&"B".into()).unwrap();
        other.put("k", b"v2".to_vec()).await.unwrap();
        settle().await;

        let got = session.get("k").await.unwrap();
        assert_eq!(got.value(), Some(&b"v2"[..]));
    }

    #[tokio::test]
    async fn test_writes_descend_from_session_context() {
        let c = LocalCluster::from_config(config()).await.unwrap();
        let a = NodeId::from("A");
        let mut session = Session::new(c.local());

        isolate(&c, &a, false).await;
        let first = session.put("k", b"v1".to_vec()).await.unwrap();
        settle().await;
        isolate(&c, &a, true).await;
        c.transport().set_down(&a).await;

        // The write's read phase cannot see v1, but the session context can.
        let second = session.put("k", b"v2".to_vec()).await.unwrap();
        assert!(second.version.dominates(&first.version));
        assert!(session.context("k").unwrap().dominates(&first.version));
    }
}
