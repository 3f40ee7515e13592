//! Prometheus metrics for partition lifecycle and lease handling.
//!
//! All metrics are registered to a custom registry with the "pbs" prefix.
//! Registration never panics: if a metric fails to register, an unregistered
//! fallback is returned and a warning is logged. Recording is fire-and-forget.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

use crate::types::{LeaseTransitionType, PartitionId, PartitionType};

/// Custom Prometheus registry for partition metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("pbs".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Lease metrics
// =============================================================================

define_counter_vec!(
    PARTITION_LEASE_RENEWED,
    "partition_lease_renewed_total",
    "Lease renewals observed per partition",
    ["partition_id"]
);
define_counter_vec!(
    LEASE_TRANSITIONS,
    "lease_transitions_total",
    "Lease transitions handled by the partition lease event sink",
    ["transition"]
);
define_counter_vec!(
    PROCESS_ABORT_REQUESTS,
    "process_abort_requests_total",
    "Process aborts requested by the partition lease event sink",
    ["reason"]
);
define_counter_vec!(
    LEASE_PREFERENCE_UPDATES,
    "lease_preference_updates_total",
    "Lease acquisition preference updates pushed to the lease manager",
    ["status"]
);

// =============================================================================
// Partition lifecycle metrics
// =============================================================================

define_counter_vec!(
    PARTITION_LOADED,
    "partition_loaded_total",
    "Successful local partition loads",
    ["partition_id"]
);
define_counter_vec!(
    PARTITION_UNLOADED,
    "partition_unloaded_total",
    "Successful local partition unloads",
    ["partition_id"]
);
define_histogram_vec!(
    PARTITION_LOAD_DURATION,
    "partition_load_duration_seconds",
    "Time spent loading a local partition",
    ["partition_id"],
    [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
);
define_histogram_vec!(
    PARTITION_UNLOAD_DURATION,
    "partition_unload_duration_seconds",
    "Time spent unloading a local partition",
    ["partition_id"],
    [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
);
define_gauge_vec!(
    LOADED_PARTITIONS,
    "loaded_partitions",
    "Partitions currently registered with the partition manager",
    ["partition_type"]
);
define_counter_vec!(
    PARTITION_REQUESTS,
    "partition_requests_total",
    "Requests accepted by loaded local partitions",
    ["partition_id"]
);

// =============================================================================
// Safe registration
// =============================================================================

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they appear in the first scrape.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*PARTITION_LEASE_RENEWED;
    let _ = &*LEASE_TRANSITIONS;
    let _ = &*PROCESS_ABORT_REQUESTS;
    let _ = &*LEASE_PREFERENCE_UPDATES;
    let _ = &*PARTITION_LOADED;
    let _ = &*PARTITION_UNLOADED;
    let _ = &*PARTITION_LOAD_DURATION;
    let _ = &*PARTITION_UNLOAD_DURATION;
    let _ = &*LOADED_PARTITIONS;
    let _ = &*PARTITION_REQUESTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording helpers
// =============================================================================

pub fn record_lease_transition(transition: LeaseTransitionType) {
    LEASE_TRANSITIONS
        .with_label_values(&[transition.as_str()])
        .inc();
}

pub fn record_lease_renewed(partition_id: PartitionId) {
    PARTITION_LEASE_RENEWED
        .with_label_values(&[&partition_id.to_string()])
        .inc();
}

pub fn record_abort_request(reason: &str) {
    PROCESS_ABORT_REQUESTS.with_label_values(&[reason]).inc();
}

pub fn record_preference_update(status: &str) {
    LEASE_PREFERENCE_UPDATES.with_label_values(&[status]).inc();
}

pub fn record_partition_loaded(partition_id: PartitionId, duration_secs: f64) {
    let label = partition_id.to_string();
    PARTITION_LOADED.with_label_values(&[&label]).inc();
    PARTITION_LOAD_DURATION
        .with_label_values(&[&label])
        .observe(duration_secs);
}

pub fn record_partition_unloaded(partition_id: PartitionId, duration_secs: f64) {
    let label = partition_id.to_string();
    PARTITION_UNLOADED.with_label_values(&[&label]).inc();
    PARTITION_UNLOAD_DURATION
        .with_label_values(&[&label])
        .observe(duration_secs);
}

pub fn record_partition_registered(partition_type: PartitionType) {
    LOADED_PARTITIONS
        .with_label_values(&[partition_type.as_str()])
        .inc();
}

pub fn record_partition_deregistered(partition_type: PartitionType) {
    LOADED_PARTITIONS
        .with_label_values(&[partition_type.as_str()])
        .dec();
}

pub fn record_partition_request(partition_id: PartitionId) {
    PARTITION_REQUESTS
        .with_label_values(&[&partition_id.to_string()])
        .inc();
}
