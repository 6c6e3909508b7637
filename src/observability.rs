//! Logging setup and Prometheus counters for the offline layer.

use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_level`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Counters shared by every component of one layer instance.
///
/// Each instance owns its own registry so tests and multiple layers in one
/// process never collide on metric names.
pub struct Metrics {
    registry: Registry,
    cache_lookups: IntCounterVec,
    detections: IntCounterVec,
    health_probes: IntCounterVec,
    sync_tasks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let cache_lookups = counter_vec(
            &registry,
            "ecoscan_cache_lookups_total",
            "Cache resolutions by partition and outcome",
            &["partition", "outcome"],
        )?;
        let detections = counter_vec(
            &registry,
            "ecoscan_detections_total",
            "Detection calls by serving backend",
            &["backend"],
        )?;
        let health_probes = counter_vec(
            &registry,
            "ecoscan_health_probes_total",
            "Health probes by outcome",
            &["outcome"],
        )?;
        let sync_tasks = counter_vec(
            &registry,
            "ecoscan_sync_tasks_total",
            "Sync queue task transitions",
            &["outcome"],
        )?;
        Ok(Self {
            registry,
            cache_lookups,
            detections,
            health_probes,
            sync_tasks,
        })
    }

    pub fn cache_lookup(&self, partition: &str, outcome: &str) {
        self.cache_lookups
            .with_label_values(&[partition, outcome])
            .inc();
    }

    pub fn detection(&self, backend: &str) {
        self.detections.with_label_values(&[backend]).inc();
    }

    pub fn health_probe(&self, outcome: &str) {
        self.health_probes.with_label_values(&[outcome]).inc();
    }

    pub fn sync_task(&self, outcome: &str) {
        self.sync_tasks.with_label_values(&[outcome]).inc();
    }

    /// Current value of a cache lookup counter.
    pub fn cache_lookup_count(&self, partition: &str, outcome: &str) -> u64 {
        self.cache_lookups
            .with_label_values(&[partition, outcome])
            .get()
    }

    pub fn detection_count(&self, backend: &str) -> u64 {
        self.detections.with_label_values(&[backend]).get()
    }

    pub fn sync_task_count(&self, outcome: &str) -> u64 {
        self.sync_tasks.with_label_values(&[outcome]).get()
    }

    /// Text exposition format of every registered counter.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoded = TextEncoder::new().encode_to_string(&self.registry.gather())?;
        Ok(encoded)
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}
