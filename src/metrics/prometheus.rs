//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics published by the fleet and
//! provides functions for initializing, recording and exporting them.
//! Recording is a no-op until [`init_metrics`] has run, so library users that
//! never scrape pay nothing.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use super::MetricsSnapshot;

/// Global Prometheus registry for all fleet metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks finished by workers, labeled by terminal status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task processing duration in seconds, labeled by terminal status.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks waiting, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of workers with a fresh heartbeat.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Number of workers currently processing a task.
pub static BUSY_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Host resource usage in percent, labeled by resource (cpu/memory).
pub static HOST_USAGE: OnceLock<GaugeVec> = OnceLock::new();

/// Scaling decisions taken, labeled by action.
pub static SCALING_DECISIONS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once: later calls keep the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("filter_fleet_tasks_total", "Total number of tasks finished"),
        &["status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "filter_fleet_task_duration_seconds",
            "Task processing duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["status"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("filter_fleet_queue_depth", "Number of tasks waiting in queue"),
        &["queue_name"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "filter_fleet_active_workers",
        "Number of workers with a fresh heartbeat",
    )?;

    let busy_workers = Gauge::new(
        "filter_fleet_busy_workers",
        "Number of workers currently processing a task",
    )?;

    // Host metrics
    let host_usage = GaugeVec::new(
        Opts::new("filter_fleet_host_usage_percent", "Host resource usage"),
        &["resource"],
    )?;

    // Scaling metrics
    let scaling_decisions = CounterVec::new(
        Opts::new(
            "filter_fleet_scaling_decisions_total",
            "Scaling decisions taken by the autoscaler",
        ),
        &["action"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(busy_workers.clone()))?;
    registry.register(Box::new(host_usage.clone()))?;
    registry.register(Box::new(scaling_decisions.clone()))?;

    // If any of these fail, metrics were initialized concurrently
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = BUSY_WORKERS.set(busy_workers);
    let _ = HOST_USAGE.set(host_usage);
    let _ = SCALING_DECISIONS.set(scaling_decisions);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Record a task reaching a terminal status.
///
/// # Arguments
///
/// * `status` - Terminal status ("completed" or "failed")
/// * `duration_secs` - Time between pickup and completion
pub fn record_task(status: &str, duration_secs: f64) {
    if let Some(tasks_total) = TASKS_TOTAL.get() {
        tasks_total.with_label_values(&[status]).inc();
    }

    if let Some(task_duration) = TASK_DURATION.get() {
        task_duration
            .with_label_values(&[status])
            .observe(duration_secs);
    }

    tracing::trace!(
        status = status,
        duration_secs = duration_secs,
        "Recorded task metric"
    );
}

/// Publish the gauges carried by a metrics snapshot.
pub fn record_snapshot(queue_name: &str, snapshot: &MetricsSnapshot) {
    if let Some(queue_depth) = QUEUE_DEPTH.get() {
        queue_depth
            .with_label_values(&[queue_name])
            .set(snapshot.queue_length as f64);
    }

    if let Some(active) = ACTIVE_WORKERS.get() {
        active.set(snapshot.active_workers as f64);
    }

    if let Some(busy) = BUSY_WORKERS.get() {
        busy.set(snapshot.busy_workers as f64);
    }

    if let Some(host_usage) = HOST_USAGE.get() {
        host_usage
            .with_label_values(&["cpu"])
            .set(snapshot.cpu_usage);
        host_usage
            .with_label_values(&["memory"])
            .set(snapshot.memory_usage);
    }
}

/// Record a scaling decision.
pub fn record_scaling_decision(action: &str) {
    if let Some(decisions) = SCALING_DECISIONS.get() {
        decisions.with_label_values(&[action]).inc();
    }
}

/// Export all registered metrics in Prometheus text format.
///
/// # Returns
///
/// A string containing all metrics in Prometheus text format. If the registry
/// has not been initialized or encoding fails, returns a comment line
/// describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        init_metrics().expect("init");

        record_task("completed", 1.5);
        record_scaling_decision("scale_up");
        let snapshot = MetricsSnapshot {
            queue_length: 4,
            active_workers: 2,
            busy_workers: 1,
            ..MetricsSnapshot::fallback()
        };
        record_snapshot("image_tasks", &snapshot);

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("filter_fleet_tasks_total"));
        assert!(text.contains("filter_fleet_queue_depth{queue_name=\"image_tasks\"}"));
        assert!(text.contains("filter_fleet_scaling_decisions_total"));
    }
}
