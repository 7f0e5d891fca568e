//! Background task for delivering hinted-handoff hints.
//!
//! Periodically walks a stand-in node's hint store and hands each hint to
//! its target with a `Handoff` request. Delivered hints are deleted; failed
//! ones count an attempt and are dropped once `max_attempts` is exceeded.

use crate::replica::ReplicaNode;
use crate::transport::{ReplicaRequest, Transport};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Configuration for the hint delivery background task.
#[derive(Debug, Clone)]
pub struct HintDeliveryConfig {
    /// How often to check for undelivered hints.
    pub check_interval: Duration,
    /// Maximum hints to attempt per delivery cycle.
    pub max_hints_per_cycle: usize,
    /// Drop a hint after this many failed deliveries.
    pub max_attempts: Option<u32>,
}

impl Default for HintDeliveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_hints_per_cycle: 100,
            max_attempts: None,
        }
    }
}

impl From<&ringkv_config::HintsConfig> for HintDeliveryConfig {
    fn from(c: &ringkv_config::HintsConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(c.delivery_interval_secs.max(1)),
            max_hints_per_cycle: c.max_hints_per_cycle,
            max_attempts: c.max_attempts,
        }
    }
}

/// Counts from one delivery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Spawn the background hint delivery task for one node.
#[allow(clippy::needless_pass_by_value)] // config is moved into the spawned task
pub fn spawn_hint_delivery_task(
    node: Arc<ReplicaNode>,
    transport: Arc<dyn Transport>,
    config: HintDeliveryConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(config.check_interval);
        loop {
            tick.tick().await;
            deliver_hints(&node, transport.as_ref(), &config).await;
        }
    })
}

/// One cycle of hint delivery.
pub async fn deliver_hints(
    node: &ReplicaNode,
    transport: &dyn Transport,
    config: &HintDeliveryConfig,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let targets = node.hint_targets().await;
    if targets.is_empty() {
        return report;
    }

    let m = ringkv_metrics::metrics();
    let mut attempted = 0usize;

    'targets: for target in targets {
        for hint in node.hints_for(&target).await {
            if attempted >= config.max_hints_per_cycle {
                break 'targets;
            }
            attempted += 1;

            let request = ReplicaRequest::Handoff {
                key: hint.key.clone(),
                versions: hint.versions.clone(),
            };
            match transport.send(&target, request).await {
                Ok(_) => {
                    match node.settle_hint(&target, &hint.key, &hint.versions).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(key = %hint.key, %target, "newer hint arrived during handoff")
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to clear delivered hint"),
                    }
                    report.delivered += 1;
                    m.hints_delivered.inc();
                    tracing::debug!(key = %hint.key, %target, "delivered hint");
                }
                Err(e) => {
                    report.failed += 1;
                    let attempts = match node.record_hint_failure(&target, &hint.key).await {
                        Ok(a) => a.unwrap_or(hint.attempts + 1),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to record hint attempt");
                            hint.attempts + 1
                        }
                    };
                    if config.max_attempts.is_some_and(|max| attempts >= max) {
                        tracing::warn!(
                            key = %hint.key,
                            %target,
                            attempts,
                            "dropping hint after repeated delivery failures"
                        );
                        if let Err(e) = node.settle_hint(&target, &hint.key, &hint.versions).await {
                            tracing::warn!(error = %e, "failed to clear expired hint");
                        }
                        report.dropped += 1;
                        m.hints_dropped.inc();
                    } else {
                        tracing::debug!(%target, error = %e, "hint delivery failed, will retry later");
                    }
                    // Skip remaining hints for this target
                    continue 'targets;
                }
            }
        }
    }

    if report.delivered > 0 || report.dropped > 0 {
        tracing::info!(
            node = %node.id(),
            delivered = report.delivered,
            failed = report.failed,
            dropped = report.dropped,
            "hint delivery cycle"
        );
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
