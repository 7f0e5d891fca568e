//! Sloppy quorum: substitute unreachable replicas with stand-ins.
//!
//! When a primary replica cannot take a write, the next node in the key's
//! preference list that is not already involved accepts it as a hint for the
//! primary. The hint is handed off later by [`crate::hint_delivery`].

use crate::placement::PlacementOracle;
use crate::transport::{ReplicaRequest, Transport, TransportError};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use ringkv_common::{NodeId, VersionedValue};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Result of one replica write, primary or hinted.
#[derive(Debug)]
pub struct WriteOutcome {
    /// The replica the write is meant for.
    pub target: NodeId,
    /// The node that actually received it, when not `target`.
    pub stand_in: Option<NodeId>,
    pub result: Result<(), TransportError>,
}

impl WriteOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The node the write was sent to.
    pub fn receiver(&self) -> &NodeId {
        self.stand_in.as_ref().unwrap_or(&self.target)
    }
}

pub(crate) type WriteFuts = FuturesUnordered<JoinHandle<WriteOutcome>>;

#[derive(Clone)]
pub struct SloppyQuorumHandler {
    placement: Arc<dyn PlacementOracle>,
    transport: Arc<dyn Transport>,
    enabled: bool,
}

impl std::fmt::Debug for SloppyQuorumHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SloppyQuorumHandler")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl SloppyQuorumHandler {
    pub fn new(
        placement: Arc<dyn PlacementOracle>,
        transport: Arc<dyn Transport>,
        enabled: bool,
    ) -> Self {
        Self {
            placement,
            transport,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Up to `count` nodes from the key's preference list, in ring order,
    /// skipping `excluded`.
    pub fn stand_ins(&self, key: &str, excluded: &HashSet<NodeId>, count: usize) -> Vec<NodeId> {
        self.placement
            .preference_list(key)
            .into_iter()
            .filter(|n| !excluded.contains(n))
            .take(count)
            .collect()
    }

    /// Ask `stand_in` to hold `value` as a hint for `target`.
    pub async fn write_hinted(
        &self,
        target: &NodeId,
        stand_in: &NodeId,
        key: &str,
        value: &VersionedValue,
    ) -> Result<(), TransportError> {
        let request = ReplicaRequest::Put {
            key: key.to_string(),
            value: value.clone(),
            hint_for: Some(target.clone()),
        };
        self.transport.send(stand_in, request).await?;
        Ok(())
    }

    /// Spawn one replica write: to `target` directly, or to `stand_in` as a
    /// hint for `target`.
    pub(crate) fn spawn_write(
        &self,
        target: NodeId,
        stand_in: Option<NodeId>,
        key: &str,
        value: &VersionedValue,
    ) -> JoinHandle<WriteOutcome> {
        let handler = self.clone();
        let key = key.to_string();
        let value = value.clone();
        tokio::spawn(async move {
            let result = match &stand_in {
                Some(s) => handler.write_hinted(&target, s, &key, &value).await,
                None => {
                    let request = ReplicaRequest::Put {
                        key,
                        value,
                        hint_for: None,
                    };
                    handler.transport.send(&target, request).await.map(|_| ())
                }
            };
            WriteOutcome {
                target,
                stand_in,
                result,
            }
        })
    }

    /// Re-route a failed write to the next unused stand-in. Returns `false`
    /// when sloppy quorum is off or the preference list is exhausted.
    pub(crate) fn substitute(
        &self,
        failed: &WriteOutcome,
        key: &str,
        value: &VersionedValue,
        used: &mut HashSet<NodeId>,
        futs: &mut WriteFuts,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(next) = self.stand_ins(key, used, 1).pop() else {
            tracing::debug!(key, target = %failed.target, "no stand-in left for write");
            return false;
        };
        tracing::debug!(key, target = %failed.target, stand_in = %next, "substituting failed replica");
        used.insert(next.clone());
        futs.push(self.spawn_write(failed.target.clone(), Some(next), key, value));
        true
    }

    /// Let writes still in flight after the quorum was met finish in the
    /// background, substituting late failures.
    pub(crate) fn spawn_drain(
        &self,
        key: String,
        value: VersionedValue,
        mut futs: WriteFuts,
        mut used: HashSet<NodeId>,
    ) {
        if futs.is_empty() {
            return;
        }
        let handler = self.clone();
        tokio::spawn(async move {
            while let Some(joined) = futs.next().await {
                let Ok(outcome) = joined else { continue };
                if let Err(e) = &outcome.result {
                    tracing::debug!(key, node = %outcome.receiver(), error = %e, "late replica write failed");
                    handler.substitute(&outcome, &key, &value, &mut used, &mut futs);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::HashRing;
    use crate::transport::ReplicaResponse;
    use ringkv_common::VersionVector;
    use tokio::sync::Mutex;

    /// Records every request; fails sends to nodes in `down`.
    #[derive(Default)]
    struct RecordingTransport {
        down: HashSet<NodeId>,
        sent: Mutex<Vec<(NodeId, ReplicaRequest)>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            target: &NodeId,
            request: ReplicaRequest,
        ) -> Result<ReplicaResponse, TransportError> {
            self.sent.lock().await.push((target.clone(), request));
            if self.down.contains(target) {
                return Err(TransportError::Unreachable(target.clone()));
            }
            Ok(ReplicaResponse::Ack)
        }
    }

    fn value() -> VersionedValue {
        VersionedValue::new(b"v".to_vec(), VersionVector::from_entries([("A", 1)]), 1)
    }

    #[test]
    fn test_stand_ins_follow_preference_list() {
        let ring = Arc::new(HashRing::with_nodes(8, ["A", "B", "C", "D", "E"]));
        let handler = SloppyQuorumHandler::new(
            ring.clone(),
            Arc::new(RecordingTransport::default()),
            true,
        );
        let prefs = ring.preference_list("k");
        let primaries: HashSet<NodeId> = prefs[..3].iter().cloned().collect();
        assert_eq!(handler.stand_ins("k", &primaries, 5), prefs[3..].to_vec());
        assert_eq!(handler.stand_ins("k", &primaries, 1), prefs[3..4].to_vec());
    }

    #[tokio::test]
    async fn test_write_hinted_sends_hint_for() {
        let ring = Arc::new(HashRing::with_nodes(8, ["A", "B", "C", "D"]));
        let transport = Arc::new(RecordingTransport::default());
        let handler = SloppyQuorumHandler::new(ring, transport.clone(), true);

        handler
            .write_hinted(&"C".into(), &"D".into(), "k", &value())
            .await
            .unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_str(), "D");
        assert!(matches!(
            &sent[0].1,
            ReplicaRequest::Put { hint_for: Some(t), .. } if t.as_str() == "C"
        ));
    }

    #[tokio::test]
    async fn test_substitute_skips_used_and_failed() {
        let ring = Arc::new(HashRing::with_nodes(8, ["A", "B", "C", "D", "E"]));
        let prefs = ring.preference_list("k");
        let transport = Arc::new(RecordingTransport {
            down: [prefs[2].clone(), prefs[3].clone()].into_iter().collect(),
            ..Default::default()
        });
        let handler = SloppyQuorumHandler::new(ring, transport, true);

        let mut used: HashSet<NodeId> = prefs[..3].iter().cloned().collect();
        let mut futs = WriteFuts::new();
        for target in &prefs[..3] {
            futs.push(handler.spawn_write(target.clone(), None, "k", &value()));
        }

        let mut ok = Vec::new();
        while let Some(joined) = futs.next().await {
            let outcome = joined.unwrap();
            if outcome.is_ok() {
                ok.push(outcome);
            } else {
                handler.substitute(&outcome, "k", &value(), &mut used, &mut futs);
            }
        }

        // prefs[2] failed, prefs[3] failed as its stand-in, prefs[4] took the hint.
        assert_eq!(ok.len(), 3);
        let hinted: Vec<&WriteOutcome> = ok.iter().filter(|o| o.stand_in.is_some()).collect();
        assert_eq!(hinted.len(), 1);
        assert_eq!(hinted[0].target, prefs[2]);
        assert_eq!(hinted[0].stand_in.as_ref(), Some(&prefs[4]));
    }

    #[tokio::test]
    async fn test_disabled_never_substitutes() {
        let ring = Arc::new(HashRing::with_nodes(8, ["A", "B", "C", "D"]));
        let handler =
            SloppyQuorumHandler::new(ring, Arc::new(RecordingTransport::default()), false);
        let failed = WriteOutcome {
            target: "A".into(),
            stand_in: None,
            result: Err(TransportError::Unreachable("A".into())),
        };
        let mut used = HashSet::new();
        let mut futs = WriteFuts::new();
        assert!(!handler.substitute(&failed, "k", &value(), &mut used, &mut futs));
        assert!(futs.is_empty());
    }
}
