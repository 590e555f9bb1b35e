//! Prometheus metrics for the coordinator and workers
//!
//! This module tracks:
//! - Coordinator: claims, dispatches, no-capacity back-offs, recoveries,
//!   evictions, queue partition sizes
//! - Worker: completions, failures, refusals, task duration, in-flight tasks
//!
//! # Usage
//!
//! Call `init_metrics()` at startup. Until it succeeds every recording
//! function is a no-op.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

use crate::queue::QueueStats;

// ============================================================================
// Metrics Storage
// ============================================================================

struct CoordinatorMetrics {
    claims: Counter,
    dispatches: CounterVec,
    dispatch_failures: Counter,
    no_capacity: Counter,
    recoveries: CounterVec,
    evictions: Counter,
    queue_tasks: GaugeVec,
    active_nodes: Gauge,
}

struct WorkerMetrics {
    completions: CounterVec,
    failures: CounterVec,
    refusals: CounterVec,
    task_duration: HistogramVec,
    in_flight: GaugeVec,
}

static COORDINATOR_METRICS: OnceLock<CoordinatorMetrics> = OnceLock::new();

static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Register all metrics with the default Prometheus registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let coordinator = CoordinatorMetrics {
        claims: register_counter!(
            "fleetcrawl_coordinator_claims_total",
            "Tasks claimed from the queue by the assignment loop"
        )?,
        dispatches: register_counter_vec!(
            "fleetcrawl_coordinator_dispatches_total",
            "Tasks dispatched, by node",
            &["node"]
        )?,
        dispatch_failures: register_counter!(
            "fleetcrawl_coordinator_dispatch_failures_total",
            "Dispatches that failed and were released"
        )?,
        no_capacity: register_counter!(
            "fleetcrawl_coordinator_no_capacity_total",
            "Claims released because no node had spare capacity"
        )?,
        recoveries: register_counter_vec!(
            "fleetcrawl_coordinator_recoveries_total",
            "Assigned tasks failed back by the monitor, by reason",
            &["reason"]
        )?,
        evictions: register_counter!(
            "fleetcrawl_coordinator_evictions_total",
            "Nodes evicted for stale heartbeats"
        )?,
        queue_tasks: register_gauge_vec!(
            "fleetcrawl_queue_tasks",
            "Tasks per queue partition",
            &["partition"]
        )?,
        active_nodes: register_gauge!(
            "fleetcrawl_coordinator_active_nodes",
            "Active crawler nodes seen by the last monitor pass"
        )?,
    };

    let worker = WorkerMetrics {
        completions: register_counter_vec!(
            "fleetcrawl_worker_completions_total",
            "Tasks completed, by node",
            &["node"]
        )?,
        failures: register_counter_vec!(
            "fleetcrawl_worker_failures_total",
            "Task executions that failed, by node",
            &["node"]
        )?,
        refusals: register_counter_vec!(
            "fleetcrawl_worker_refusals_total",
            "Assignments returned to the queue because the node was full",
            &["node"]
        )?,
        task_duration: register_histogram_vec!(
            "fleetcrawl_worker_task_duration_seconds",
            "Task execution time in seconds",
            &["node"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
        in_flight: register_gauge_vec!(
            "fleetcrawl_worker_in_flight_tasks",
            "Tasks currently executing, by node",
            &["node"]
        )?,
    };

    COORDINATOR_METRICS
        .set(coordinator)
        .map_err(|_| "Coordinator metrics already initialized")?;
    WORKER_METRICS
        .set(worker)
        .map_err(|_| "Worker metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

pub fn metrics_initialized() -> bool {
    COORDINATOR_METRICS.get().is_some() && WORKER_METRICS.get().is_some()
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Coordinator
// ============================================================================

pub fn record_claim() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.claims.inc();
    }
}

pub fn record_dispatch(node: &str) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.dispatches.with_label_values(&[node]).inc();
    }
}

pub fn record_dispatch_failure() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.dispatch_failures.inc();
    }
}

pub fn record_no_capacity() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.no_capacity.inc();
    }
}

/// Record a task failed back by the monitor (`"stuck"` or `"evicted"`)
pub fn record_recovery(reason: &str) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.recoveries.with_label_values(&[reason]).inc();
    }
}

pub fn record_evictions(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.evictions.inc_by(count as f64);
    }
}

/// Publish a monitor snapshot
pub fn update_cluster_gauges(stats: &QueueStats, active_nodes: usize) {
    let Some(m) = COORDINATOR_METRICS.get() else {
        return;
    };

    for (partition, count) in [
        ("pending", stats.pending),
        ("assigned", stats.assigned),
        ("completed", stats.completed),
        ("failed", stats.failed),
    ] {
        m.queue_tasks
            .with_label_values(&[partition])
            .set(count as f64);
    }
    m.active_nodes.set(active_nodes as f64);
}

// ============================================================================
// Worker
// ============================================================================

/// Record the outcome of one task execution
pub fn record_task_outcome(node: &str, success: bool) {
    let Some(m) = WORKER_METRICS.get() else {
        return;
    };

    if success {
        m.completions.with_label_values(&[node]).inc();
    } else {
        m.failures.with_label_values(&[node]).inc();
    }
}

pub fn record_refusal(node: &str) {
    if let Some(m) = WORKER_METRICS.get() {
        m.refusals.with_label_values(&[node]).inc();
    }
}

pub fn set_in_flight(node: &str, in_flight: u32) {
    if let Some(m) = WORKER_METRICS.get() {
        m.in_flight
            .with_label_values(&[node])
            .set(f64::from(in_flight));
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start timing a task execution
pub fn start_task_timer(node: &str) -> MetricsTimer {
    match WORKER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.task_duration.with_label_values(&[node]).start_timer()),
        None => MetricsTimer::noop(),
    }
}
