//! Live fleet metrics for the scaling engine.
//!
//! The `MetricsCollector` reads the queue, the worker registry and the host,
//! and condenses them into an immutable [`MetricsSnapshot`]. Collection never
//! fails from the caller's point of view: when any source is unavailable the
//! collector logs the error and returns a zeroed, `degraded` snapshot.
//!
//! Successful snapshots are kept in a bounded history that can be read back
//! or exported as a JSON array.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::host::HostSampler;
use super::MetricsError;
use crate::registry::WorkerRegistry;
use crate::scheduler::queue::{completed_durations, TaskQueue};
use crate::scheduler::TaskStatus;

/// Number of snapshots kept in memory.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Point-in-time view of fleet load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Host CPU usage, in percent.
    pub cpu_usage: f64,
    /// Host memory usage, in percent.
    pub memory_usage: f64,
    /// Host memory available, in GiB.
    pub memory_available_gb: f64,
    /// Tasks waiting in the queue.
    pub queue_length: usize,
    /// Workers with a fresh heartbeat.
    pub active_workers: usize,
    /// Tasks in `processing`, capped at `active_workers`.
    pub busy_workers: usize,
    /// `busy_workers / active_workers`, or 0 without workers.
    pub worker_utilization: f64,
    /// `completed / (completed + failed)`, or 1.0 without finished tasks.
    pub success_rate: f64,
    /// Mean processing time of completed tasks, in seconds.
    pub avg_processing_time_secs: f64,
    /// Tasks in `completed`.
    pub total_completed: usize,
    /// Tasks in `failed`.
    pub total_failed: usize,
    /// Set when the snapshot is the fallback for a failed collection.
    pub degraded: bool,
}

impl MetricsSnapshot {
    /// The snapshot reported when collection fails.
    pub fn fallback() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            memory_available_gb: 0.0,
            queue_length: 0,
            active_workers: 0,
            busy_workers: 0,
            worker_utilization: 0.0,
            success_rate: 1.0,
            avg_processing_time_secs: 0.0,
            total_completed: 0,
            total_failed: 0,
            degraded: true,
        }
    }
}

/// Collects snapshots and keeps a bounded history of them.
pub struct MetricsCollector {
    queue: TaskQueue,
    registry: WorkerRegistry,
    host: Arc<dyn HostSampler>,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    history_limit: usize,
}

impl MetricsCollector {
    /// Creates a collector over the given sources.
    pub fn new(queue: TaskQueue, registry: WorkerRegistry, host: Arc<dyn HostSampler>) -> Self {
        Self {
            queue,
            registry,
            host,
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Sets how many snapshots are kept.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Takes a snapshot, falling back to a degraded one on failure.
    ///
    /// Successful snapshots are appended to the history and published to
    /// Prometheus; fallbacks are neither.
    pub async fn collect(&self) -> MetricsSnapshot {
        match self.try_collect().await {
            Ok(snapshot) => {
                self.remember(snapshot.clone());
                super::prometheus::record_snapshot(self.queue.name(), &snapshot);
                snapshot
            }
            Err(e) => {
                tracing::warn!(error = %e, "Metrics collection failed, using fallback snapshot");
                MetricsSnapshot::fallback()
            }
        }
    }

    /// Takes a snapshot, surfacing any source failure.
    pub async fn try_collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        let queue_length = self.queue.length().await?;
        let tasks = self.queue.tasks().await?;
        let active_workers = self.registry.active_workers().await?.len();
        let host = self.host.sample().await?;

        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let processing = count(TaskStatus::Processing);
        let total_completed = count(TaskStatus::Completed);
        let total_failed = count(TaskStatus::Failed);

        let busy_workers = processing.min(active_workers);
        let worker_utilization = if active_workers > 0 {
            busy_workers as f64 / active_workers as f64
        } else {
            0.0
        };

        let finished = total_completed + total_failed;
        let success_rate = if finished > 0 {
            total_completed as f64 / finished as f64
        } else {
            1.0
        };

        let durations = completed_durations(&tasks);
        let avg_processing_time_secs = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        let snapshot = MetricsSnapshot {
            timestamp: Utc::now(),
            cpu_usage: host.cpu_usage,
            memory_usage: host.memory_usage,
            memory_available_gb: host.memory_available_gb,
            queue_length,
            active_workers,
            busy_workers,
            worker_utilization,
            success_rate,
            avg_processing_time_secs,
            total_completed,
            total_failed,
            degraded: false,
        };

        tracing::debug!(
            queue_length = snapshot.queue_length,
            active_workers = snapshot.active_workers,
            busy_workers = snapshot.busy_workers,
            cpu_usage = snapshot.cpu_usage,
            "Collected metrics snapshot"
        );

        Ok(snapshot)
    }

    fn remember(&self, snapshot: MetricsSnapshot) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(snapshot);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }

    /// The most recent `last_n` snapshots, oldest first.
    pub fn history(&self, last_n: usize) -> Vec<MetricsSnapshot> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(last_n);
        history.iter().skip(skip).cloned().collect()
    }

    /// The most recent successful snapshot.
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// The whole history as a pretty-printed JSON array, oldest first.
    pub fn history_json(&self) -> Result<String, MetricsError> {
        Ok(serde_json::to_string_pretty(&self.history(self.history_limit))?)
    }

    /// Writes the whole history to `path` as a JSON array.
    ///
    /// # Returns
    ///
    /// The number of snapshots written.
    pub async fn export_json(&self, path: &Path) -> Result<usize, MetricsError> {
        let snapshots = self.history(self.history_limit);
        let json = serde_json::to_string_pretty(&snapshots)?;
        tokio::fs::write(path, json).await?;

        tracing::info!(
            path = %path.display(),
            snapshots = snapshots.len(),
            "Exported metrics history"
        );
        Ok(snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::host::{HostSample, StaticSampler};
    use crate::scheduler::TaskPayload;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn collector(store: Arc<MemoryStore>) -> (TaskQueue, WorkerRegistry, MetricsCollector) {
        let queue = TaskQueue::new(store.clone());
        let registry = WorkerRegistry::new(store);
        let host = StaticSampler(HostSample {
            cpu_usage: 30.0,
            memory_usage: 50.0,
            memory_available_gb: 8.0,
        });
        let collector = MetricsCollector::new(queue.clone(), registry.clone(), Arc::new(host));
        (queue, registry, collector)
    }

    #[tokio::test]
    async fn test_empty_fleet_snapshot() {
        let (_, _, collector) = collector(Arc::new(MemoryStore::new()));
        let snapshot = collector.collect().await;

        assert!(!snapshot.degraded);
        assert_eq!(snapshot.queue_length, 0);
        assert_eq!(snapshot.active_workers, 0);
        assert_eq!(snapshot.worker_utilization, 0.0);
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.cpu_usage, 30.0);
        assert_eq!(collector.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_busy_workers_capped_by_active() {
        let (queue, registry, collector) = collector(Arc::new(MemoryStore::new()));
        registry
            .register("w1", &["all".to_string()], "h", None)
            .await
            .expect("register");

        for _ in 0..4 {
            queue
                .enqueue(TaskPayload::new(["inspect"], ["x"]))
                .await
                .expect("enqueue");
        }
        // Three tasks in flight but only one live worker.
        for _ in 0..3 {
            queue
                .dequeue("w1", Duration::from_millis(20))
                .await
                .expect("dequeue");
        }

        let snapshot = collector.collect().await;
        assert_eq!(snapshot.queue_length, 1);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.busy_workers, 1);
        assert_eq!(snapshot.worker_utilization, 1.0);
    }

    #[tokio::test]
    async fn test_success_rate_and_average_time() {
        let (queue, _, collector) = collector(Arc::new(MemoryStore::new()));
        let ids = [
            queue.enqueue(TaskPayload::default()).await.expect("enqueue"),
            queue.enqueue(TaskPayload::default()).await.expect("enqueue"),
            queue.enqueue(TaskPayload::default()).await.expect("enqueue"),
        ];
        for _ in 0..3 {
            queue
                .dequeue("w", Duration::from_millis(20))
                .await
                .expect("dequeue");
        }
        queue
            .complete(ids[0], serde_json::json!({}))
            .await
            .expect("complete");
        queue
            .complete(ids[1], serde_json::json!({}))
            .await
            .expect("complete");
        queue.fail(ids[2], "bad").await.expect("fail");

        let snapshot = collector.collect().await;
        assert_eq!(snapshot.total_completed, 2);
        assert_eq!(snapshot.total_failed, 1);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(snapshot.avg_processing_time_secs >= 0.0);
    }

    #[tokio::test]
    async fn test_fallback_on_store_outage() {
        let store = Arc::new(MemoryStore::new());
        let (_, _, collector) = collector(store.clone());
        collector.collect().await;

        store.set_offline(true);
        let snapshot = collector.collect().await;
        assert!(snapshot.degraded);
        assert_eq!(snapshot.queue_length, 0);
        assert_eq!(snapshot.active_workers, 0);
        assert_eq!(snapshot.success_rate, 1.0);

        // Fallbacks stay out of the history.
        assert_eq!(collector.history(10).len(), 1);
        assert!(!collector.latest().expect("latest").degraded);

        assert!(matches!(
            collector.try_collect().await,
            Err(MetricsError::Queue(_))
        ));
    }

    #[tokio::test]
    async fn test_export_json_writes_history() {
        let (queue, _, collector) = collector(Arc::new(MemoryStore::new()));
        collector.collect().await;
        queue
            .enqueue(TaskPayload::new(["inspect"], ["x"]))
            .await
            .expect("enqueue");
        collector.collect().await;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics_export.json");
        let written = collector.export_json(&path).await.expect("export");
        assert_eq!(written, 2);

        let raw = tokio::fs::read_to_string(&path).await.expect("read");
        let exported: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let entries = exported.as_array().expect("array");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["queue_length"], 0);
        assert_eq!(entries[1]["queue_length"], 1);
        assert_eq!(entries[1]["cpu_usage"], 30.0);

        let inline: serde_json::Value =
            serde_json::from_str(&collector.history_json().expect("json")).expect("parse");
        assert_eq!(inline, exported);
    }

    #[tokio::test]
    async fn test_export_json_reports_write_failure() {
        let (_, _, collector) = collector(Arc::new(MemoryStore::new()));
        collector.collect().await;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("export.json");
        assert!(matches!(
            collector.export_json(&path).await,
            Err(MetricsError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (_, _, collector) = collector(Arc::new(MemoryStore::new()));
        let collector = collector.with_history_limit(3);
        for _ in 0..5 {
            collector.collect().await;
        }
        assert_eq!(collector.history(10).len(), 3);
        assert_eq!(collector.history(2).len(), 2);
    }
}
