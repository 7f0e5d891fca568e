//! Tracing setup and Prometheus metrics for ringkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate. Exposition is left to the embedding process via [`encode_metrics`].

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a ringkv process.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Replica RPCs ──
    pub rpcs_sent_by_type: IntCounterVec,
    pub rpc_failures_by_type: IntCounterVec,

    // ── Client operations ──
    pub kv_puts: IntCounter,
    pub kv_gets: IntCounter,
    pub kv_deletes: IntCounter,
    pub kv_latency_secs: HistogramVec,
    pub quorum_failures: IntCounter,
    pub conflicts_detected: IntCounter,

    // ── Hinted handoff ──
    pub hints_stored: IntCounter,
    pub hints_delivered: IntCounter,
    pub hints_dropped: IntCounter,

    // ── Repair ──
    pub read_repairs: IntCounter,
    pub anti_entropy_runs: IntCounter,
    pub anti_entropy_keys_repaired: IntCounter,
}

// prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for KV latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("unique counter name");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
    registry
        .register(Box::new(c.clone()))
        .expect("unique counter vec name");
    c
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let kv_latency_secs = HistogramVec::new(
            HistogramOpts::new("ringkv_kv_latency_seconds", "KV operation latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("kv_latency_secs histogram");
        registry
            .register(Box::new(kv_latency_secs.clone()))
            .expect("register kv_latency_secs");

        Self {
            rpcs_sent_by_type: counter_vec(
                &registry,
                "ringkv_rpcs_sent_by_type_total",
                "Replica RPCs sent, by type",
                &["rpc_type"],
            ),
            rpc_failures_by_type: counter_vec(
                &registry,
                "ringkv_rpc_failures_by_type_total",
                "Replica RPCs that failed or timed out, by type",
                &["rpc_type"],
            ),
            kv_puts: counter(&registry, "ringkv_kv_puts_total", "KV PUT operations"),
            kv_gets: counter(&registry, "ringkv_kv_gets_total", "KV GET operations"),
            kv_deletes: counter(&registry, "ringkv_kv_deletes_total", "KV DELETE operations"),
            kv_latency_secs,
            quorum_failures: counter(
                &registry,
                "ringkv_quorum_failures_total",
                "Operations that could not reach their quorum",
            ),
            conflicts_detected: counter(
                &registry,
                "ringkv_conflicts_detected_total",
                "Reads that observed concurrent sibling versions",
            ),
            hints_stored: counter(
                &registry,
                "ringkv_hints_stored_total",
                "Hints recorded by stand-in nodes",
            ),
            hints_delivered: counter(
                &registry,
                "ringkv_hints_delivered_total",
                "Hints handed off to their target node",
            ),
            hints_dropped: counter(
                &registry,
                "ringkv_hints_dropped_total",
                "Hints discarded after exhausting delivery attempts",
            ),
            read_repairs: counter(
                &registry,
                "ringkv_read_repairs_total",
                "Replica pushes issued by read repair",
            ),
            anti_entropy_runs: counter(
                &registry,
                "ringkv_anti_entropy_runs_total",
                "Passive repair passes between replica pairs",
            ),
            anti_entropy_keys_repaired: counter(
                &registry,
                "ringkv_anti_entropy_keys_repaired_total",
                "Keys reconciled by passive repair",
            ),
            registry,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&metrics().registry.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Start a KV operation latency timer; records elapsed time on drop.
pub fn start_kv_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Histogram;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.kv_puts.get();
        m.kv_puts.inc();
        m.kv_puts.inc();
        assert_eq!(m.kv_puts.get(), before + 2);

        m.rpcs_sent_by_type.with_label_values(&["get"]).inc();
        m.rpcs_sent_by_type.with_label_values(&["put"]).inc();
        assert!(m.rpcs_sent_by_type.with_label_values(&["get"]).get() >= 1);
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().hints_stored.inc();

        let output = encode_metrics();
        assert!(output.contains("ringkv_hints_stored_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_init_tracing_is_repeatable() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn test_kv_timer_records() {
        {
            let _timer = start_kv_timer("test_op");
        }
        let h: Histogram = metrics().kv_latency_secs.with_label_values(&["test_op"]);
        assert_eq!(h.get_sample_count(), 1);
    }
}
