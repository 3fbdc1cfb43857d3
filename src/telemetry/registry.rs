//! Global metrics registry and metric handle definitions.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use std::sync::LazyLock;

/// Global metrics instance. Initialized once, accessed from any call site.
static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// All Prometheus metric handles for the hivecore process.
///
/// Access via `Metrics::global()`. Metric handles are cheap to clone (Arc
/// internally) so call sites can grab references without threading state.
pub struct Metrics {
    pub(crate) registry: Registry,

    // -- Gauges --
    /// Instances currently registered (any non-closed state).
    pub active_instances: IntGauge,

    /// Tasks submitted but not yet processed by a bot worker.
    pub task_queue_depth: IntGauge,

    // -- Counters --
    /// Envelopes crossing the session boundary.
    /// Labels: kind, outcome ("received" / "sent").
    pub envelopes_total: IntCounterVec,

    /// Handshake attempts by outcome.
    /// Labels: outcome (success/auth_failed/bad_handshake/timeout/conflict).
    pub handshakes_total: IntCounterVec,

    /// Sessions torn down because the heartbeat window elapsed.
    pub heartbeat_miss_total: IntCounter,

    // -- Histograms --
    /// Dispatch round-trip latency in seconds.
    /// Label: command_name.
    pub command_latency_seconds: HistogramVec,

    /// Time a connection spends in the handshake.
    pub handshake_duration_seconds: Histogram,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let active_instances = IntGauge::new(
            "hivecore_active_instances",
            "Instances currently registered",
        )
        .expect("hardcoded metric descriptor");

        let task_queue_depth = IntGauge::new(
            "hivecore_task_queue_depth",
            "Tasks waiting for a bot worker",
        )
        .expect("hardcoded metric descriptor");

        let envelopes_total = IntCounterVec::new(
            Opts::new(
                "hivecore_envelopes_total",
                "Envelopes crossing the session boundary",
            ),
            &["kind", "outcome"],
        )
        .expect("hardcoded metric descriptor");

        let handshakes_total = IntCounterVec::new(
            Opts::new("hivecore_handshakes_total", "Handshake attempts by outcome"),
            &["outcome"],
        )
        .expect("hardcoded metric descriptor");

        let heartbeat_miss_total = IntCounter::new(
            "hivecore_heartbeat_miss_total",
            "Sessions closed for missing heartbeats",
        )
        .expect("hardcoded metric descriptor");

        let command_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "hivecore_command_latency_seconds",
                "Dispatch round-trip latency in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["command_name"],
        )
        .expect("hardcoded metric descriptor");

        let handshake_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "hivecore_handshake_duration_seconds",
                "Time spent in the handshake",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )
        .expect("hardcoded metric descriptor");

        registry
            .register(Box::new(active_instances.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(task_queue_depth.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(envelopes_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(handshakes_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(heartbeat_miss_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(command_latency_seconds.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(handshake_duration_seconds.clone()))
            .expect("hardcoded metric");

        Self {
            registry,
            active_instances,
            task_queue_depth,
            envelopes_total,
            handshakes_total,
            heartbeat_miss_total,
            command_latency_seconds,
            handshake_duration_seconds,
        }
    }

    /// Access the global metrics instance.
    pub fn global() -> &'static Self {
        &METRICS
    }
}
