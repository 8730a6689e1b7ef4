//! Store-backed task queue with per-task status tracking.
//!
//! This module provides the distributed task queue shared by every worker:
//!
//! - Enqueue writes the task record first, then pushes the id
//! - Dequeue is a blocking pop, so each id is handed to exactly one worker
//! - Terminal transitions (complete / fail) update the record in place
//! - Completed results are also published on a results list
//! - Sweeps remove old terminal records
//!
//! # Queue Structure
//!
//! - `{queue_name}`: list of pending task ids (LPUSH / BRPOP, FIFO)
//! - `task:{id}`: hash holding the task record
//! - `{results_list}`: JSON [`CompletedResult`] entries, oldest popped first
//!
//! # Reliability
//!
//! Delivery is at-least-once up to the pop and at-most-once after it: a worker
//! that dies while a task is `processing` leaves the task there. Nothing
//! re-queues such tasks.

use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::task::{
    encode_time, task_key, CompletedResult, Task, TaskPayload, TaskStatus, TASK_KEY_PREFIX,
};
use crate::store::{SharedStore, StoreError};

/// Record reads in flight while scanning tasks.
const SCAN_CONCURRENCY: usize = 16;

/// Default name of the pending-task list.
pub const DEFAULT_QUEUE_NAME: &str = "image_tasks";

/// Default name of the completed-results list.
pub const DEFAULT_RESULTS_LIST: &str = "image_results";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backing store failed.
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record or result entry could not be decoded.
    #[error("Malformed task record {key}: {reason}")]
    Malformed {
        /// Store key of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Counts of tasks known to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ids waiting in the pending list.
    pub queue_length: usize,
    /// Task records in the store.
    pub total_tasks: usize,
    /// Records with status `pending`.
    pub pending: usize,
    /// Records with status `processing`.
    pub processing: usize,
    /// Records with status `completed`.
    pub completed: usize,
    /// Records with status `failed`.
    pub failed: usize,
}

impl QueueStats {
    /// Returns the count for one status.
    pub fn count(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Processing => self.processing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    fn add(&mut self, status: TaskStatus) {
        self.total_tasks += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Task queue over a shared store.
///
/// Cheap to clone; clones share the same store handle.
#[derive(Clone)]
pub struct TaskQueue {
    /// Backing store.
    store: SharedStore,
    /// Name of the pending-task list.
    queue_name: String,
    /// Name of the list completed results are published on.
    results_list: String,
}

impl TaskQueue {
    /// Creates a queue using the default list name.
    pub fn new(store: SharedStore) -> Self {
        Self::with_name(store, DEFAULT_QUEUE_NAME)
    }

    /// Creates a queue over a custom list name.
    pub fn with_name(store: SharedStore, queue_name: &str) -> Self {
        Self {
            store,
            queue_name: queue_name.to_string(),
            results_list: DEFAULT_RESULTS_LIST.to_string(),
        }
    }

    /// Publishes completed results on `results_list` instead of the default.
    pub fn with_results_list(mut self, results_list: &str) -> Self {
        self.results_list = results_list.to_string();
        self
    }

    /// Returns the name of the pending-task list.
    pub fn name(&self) -> &str {
        &self.queue_name
    }

    /// Returns the name of the completed-results list.
    pub fn results_list(&self) -> &str {
        &self.results_list
    }

    /// Checks that the backing store is reachable.
    pub async fn ping(&self) -> Result<(), QueueError> {
        Ok(self.store.ping().await?)
    }

    /// Enqueues a new task.
    ///
    /// The record is written before the id is pushed, so a dequeuer never
    /// pops an id without a record behind it.
    ///
    /// # Arguments
    ///
    /// * `payload` - The job description
    ///
    /// # Returns
    ///
    /// The id of the new task.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Store` if either write fails. When the push fails
    /// after the record was written, the record stays behind as `pending`
    /// without being queued.
    pub async fn enqueue(&self, payload: TaskPayload) -> Result<Uuid, QueueError> {
        let task = Task::new(payload);
        let key = task_key(task.id);

        self.store.hash_set(&key, &task.to_fields()?).await?;
        self.store
            .push(&self.queue_name, &task.id.to_string())
            .await?;

        tracing::info!(
            task_id = %task.id,
            queue = %self.queue_name,
            images = task.payload.images.len(),
            filters = ?task.payload.filters,
            "Enqueued task"
        );

        Ok(task.id)
    }

    /// Dequeues the next task, waiting up to `timeout`.
    ///
    /// On success the task is marked `processing`, stamped with `worker_id`
    /// and `started_at`, and returned in its updated form.
    ///
    /// # Returns
    ///
    /// `Some(task)` if a task was dequeued, `None` on timeout or when the
    /// popped id had no record.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let Some(raw_id) = self.store.blocking_pop(&self.queue_name, timeout).await? else {
            return Ok(None);
        };

        let task_id = match Uuid::parse_str(&raw_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(raw_id = %raw_id, error = %e, "Dropping invalid task id from queue");
                return Ok(None);
            }
        };

        let Some(mut task) = self.load(task_id).await? else {
            tracing::warn!(task_id = %task_id, "Dequeued task has no record, skipping");
            return Ok(None);
        };

        if !task.status.can_transition_to(TaskStatus::Processing) {
            tracing::warn!(
                task_id = %task_id,
                status = %task.status,
                "Dequeued task is not pending, skipping"
            );
            return Ok(None);
        }

        let now = Utc::now();
        task.status = TaskStatus::Processing;
        task.worker_id = Some(worker_id.to_string());
        task.started_at = Some(now);

        self.store
            .hash_set(
                &task_key(task_id),
                &[
                    ("status".to_string(), task.status.to_string()),
                    ("worker_id".to_string(), worker_id.to_string()),
                    ("started_at".to_string(), encode_time(Some(now))),
                ],
            )
            .await?;

        tracing::debug!(task_id = %task_id, worker_id = %worker_id, "Dequeued task");

        Ok(Some(task))
    }

    /// Marks a task completed, stores its result and publishes it on the
    /// results list.
    ///
    /// A missing record is logged as an inconsistency and nothing is written.
    /// Nothing is published when the transition is rejected.
    pub async fn complete(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(&result)?;
        let Some(completed_at) = self
            .finish(
                task_id,
                TaskStatus::Completed,
                ("result".to_string(), encoded),
            )
            .await?
        else {
            return Ok(());
        };

        let entry = CompletedResult {
            task_id,
            result,
            completed_at,
        };
        self.store
            .push(&self.results_list, &serde_json::to_string(&entry)?)
            .await?;
        Ok(())
    }

    /// Takes the oldest published result, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Malformed` if the entry is not a valid result; the
    /// entry is consumed either way.
    pub async fn next_result(
        &self,
        timeout: Duration,
    ) -> Result<Option<CompletedResult>, QueueError> {
        let Some(raw) = self.store.blocking_pop(&self.results_list, timeout).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| QueueError::Malformed {
                key: self.results_list.clone(),
                reason: e.to_string(),
            })
    }

    /// Returns the number of results waiting on the results list.
    pub async fn results_length(&self) -> Result<usize, QueueError> {
        Ok(self.store.list_len(&self.results_list).await?)
    }

    /// Marks a task failed and stores the error message.
    ///
    /// A missing record is logged as an inconsistency and nothing is written.
    pub async fn fail(&self, task_id: Uuid, error: &str) -> Result<(), QueueError> {
        self.finish(
            task_id,
            TaskStatus::Failed,
            ("error".to_string(), error.to_string()),
        )
        .await?;
        Ok(())
    }

    /// Applies a terminal transition, returning the completion time when it
    /// was written.
    async fn finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        detail: (String, String),
    ) -> Result<Option<chrono::DateTime<Utc>>, QueueError> {
        let Some(task) = self.load(task_id).await? else {
            tracing::warn!(
                task_id = %task_id,
                status = %status,
                "Cannot finish task without a record"
            );
            return Ok(None);
        };

        if !task.status.can_transition_to(status) {
            tracing::warn!(
                task_id = %task_id,
                from = %task.status,
                to = %status,
                "Ignoring invalid task transition"
            );
            return Ok(None);
        }

        let now = Utc::now();
        self.store
            .hash_set(
                &task_key(task_id),
                &[
                    ("status".to_string(), status.to_string()),
                    ("completed_at".to_string(), encode_time(Some(now))),
                    detail,
                ],
            )
            .await?;

        let duration_secs = task
            .started_at
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        crate::metrics::prometheus::record_task(status.as_str(), duration_secs);

        tracing::info!(
            task_id = %task_id,
            status = %status,
            duration_secs = duration_secs,
            "Task finished"
        );

        Ok(Some(now))
    }

    /// Looks up a task.
    ///
    /// # Returns
    ///
    /// `None` if no record exists.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Malformed` if the record cannot be decoded.
    pub async fn status(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        self.load(task_id).await
    }

    async fn load(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        let key = task_key(task_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Task::from_fields(&fields)
            .map(Some)
            .map_err(|reason| QueueError::Malformed { key, reason })
    }

    /// Returns the number of ids waiting in the pending list.
    pub async fn length(&self) -> Result<usize, QueueError> {
        Ok(self.store.list_len(&self.queue_name).await?)
    }

    /// Loads every decodable task record.
    ///
    /// Records that disappear mid-scan are ignored; malformed ones are logged
    /// and skipped.
    pub async fn tasks(&self) -> Result<Vec<Task>, QueueError> {
        let keys = self.store.scan_prefix(TASK_KEY_PREFIX).await?;
        let mut tasks = Vec::with_capacity(keys.len());

        let mut records = stream::iter(keys)
            .map(|key| async move {
                let fields = self.store.hash_get_all(&key).await;
                (key, fields)
            })
            .buffered(SCAN_CONCURRENCY);

        while let Some((key, fields)) = records.next().await {
            let fields = fields?;
            if fields.is_empty() {
                continue;
            }
            match Task::from_fields(&fields) {
                Ok(task) => tasks.push(task),
                Err(reason) => {
                    tracing::warn!(key = %key, reason = %reason, "Skipping malformed task record");
                }
            }
        }

        Ok(tasks)
    }

    /// Returns queue length plus per-status record counts.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats {
            queue_length: self.length().await?,
            ..Default::default()
        };
        for task in self.tasks().await? {
            stats.add(task.status);
        }
        Ok(stats)
    }

    /// Processing times, in seconds, of every completed task.
    pub async fn processing_durations(&self) -> Result<Vec<f64>, QueueError> {
        Ok(completed_durations(&self.tasks().await?))
    }

    /// Deletes terminal tasks that finished more than `max_age` ago.
    ///
    /// Pending and processing tasks are never touched.
    ///
    /// # Returns
    ///
    /// The number of records deleted.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize, QueueError> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let mut removed = 0;
        for task in self.tasks().await? {
            if !task.status.is_terminal() {
                continue;
            }
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            if completed_at < cutoff && self.store.delete(&task_key(task.id)).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed = removed, "Swept finished tasks");
        }

        Ok(removed)
    }
}

/// Processing times, in seconds, of the completed tasks in `tasks`.
pub fn completed_durations(tasks: &[Task]) -> Vec<f64> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .filter_map(Task::processing_time)
        .map(|d| d.num_milliseconds() as f64 / 1000.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    fn queue() -> (Arc<MemoryStore>, TaskQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        (store, queue)
    }

    fn payload() -> TaskPayload {
        TaskPayload::new(["resize"], ["a.jpg"])
    }

    #[tokio::test]
    async fn test_enqueue_then_status_is_pending() {
        let (_, queue) = queue();
        let id = queue.enqueue(payload()).await.expect("enqueue");

        let task = queue.status(id).await.expect("status").expect("record");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.payload, payload());
        assert_eq!(queue.length().await.expect("len"), 1);
    }

    #[tokio::test]
    async fn test_dequeue_marks_processing() {
        let (_, queue) = queue();
        let id = queue.enqueue(payload()).await.expect("enqueue");

        let task = queue
            .dequeue("worker-1", Duration::from_millis(50))
            .await
            .expect("dequeue")
            .expect("task");
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Processing);

        let stored = queue.status(id).await.expect("status").expect("record");
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.worker_id.as_deref(), Some("worker-1"));
        assert!(stored.started_at.is_some());
        assert_eq!(queue.length().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_on_empty_queue() {
        let (_, queue) = queue();
        let task = queue
            .dequeue("worker-1", Duration::from_millis(20))
            .await
            .expect("dequeue");
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_skips_orphan_id() {
        let (store, queue) = queue();
        store
            .push(DEFAULT_QUEUE_NAME, &Uuid::new_v4().to_string())
            .await
            .expect("push");

        let task = queue
            .dequeue("worker-1", Duration::from_millis(20))
            .await
            .expect("dequeue");
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_complete_and_fail() {
        let (_, queue) = queue();
        let ok = queue.enqueue(payload()).await.expect("enqueue");
        let bad = queue.enqueue(payload()).await.expect("enqueue");
        for _ in 0..2 {
            queue
                .dequeue("w", Duration::from_millis(20))
                .await
                .expect("dequeue");
        }

        queue
            .complete(ok, serde_json::json!({"images_processed": 1}))
            .await
            .expect("complete");
        queue.fail(bad, "boom").await.expect("fail");

        let ok_task = queue.status(ok).await.expect("status").expect("record");
        assert_eq!(ok_task.status, TaskStatus::Completed);
        assert_eq!(ok_task.result, Some(serde_json::json!({"images_processed": 1})));
        assert!(ok_task.completed_at.is_some());

        let bad_task = queue.status(bad).await.expect("status").expect("record");
        assert_eq!(bad_task.status, TaskStatus::Failed);
        assert_eq!(bad_task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_complete_publishes_result() {
        let (_, queue) = queue();
        let id = queue.enqueue(payload()).await.expect("enqueue");
        queue
            .dequeue("w", Duration::from_millis(20))
            .await
            .expect("dequeue");
        queue
            .complete(id, serde_json::json!({"images_processed": 1}))
            .await
            .expect("complete");

        // A rejected second completion publishes nothing.
        queue
            .complete(id, serde_json::json!({"images_processed": 2}))
            .await
            .expect("complete is ignored");
        assert_eq!(queue.results_length().await.expect("len"), 1);

        let published = queue
            .next_result(Duration::from_millis(20))
            .await
            .expect("next result")
            .expect("entry");
        assert_eq!(published.task_id, id);
        assert_eq!(published.result, serde_json::json!({"images_processed": 1}));
        let task = queue.status(id).await.expect("status").expect("record");
        assert_eq!(task.completed_at, Some(published.completed_at));

        assert!(queue
            .next_result(Duration::from_millis(20))
            .await
            .expect("next result")
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_task_publishes_nothing() {
        let (store, queue) = queue();
        let queue = queue.with_results_list("custom_results");
        let id = queue.enqueue(payload()).await.expect("enqueue");
        queue
            .dequeue("w", Duration::from_millis(20))
            .await
            .expect("dequeue");
        queue.fail(id, "boom").await.expect("fail");

        assert_eq!(queue.results_list(), "custom_results");
        assert_eq!(queue.results_length().await.expect("len"), 0);

        store
            .push("custom_results", "not json")
            .await
            .expect("push");
        let err = queue
            .next_result(Duration::from_millis(20))
            .await
            .expect_err("malformed entry");
        assert!(matches!(err, QueueError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_terminal_task_is_not_revisited() {
        let (_, queue) = queue();
        let id = queue.enqueue(payload()).await.expect("enqueue");
        queue
            .dequeue("w", Duration::from_millis(20))
            .await
            .expect("dequeue");
        queue.fail(id, "first").await.expect("fail");

        queue
            .complete(id, serde_json::json!({}))
            .await
            .expect("complete is ignored");

        let task = queue.status(id).await.expect("status").expect("record");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("first"));
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_complete_missing_record_is_ok() {
        let (_, queue) = queue();
        queue
            .complete(Uuid::new_v4(), serde_json::json!({}))
            .await
            .expect("missing record tolerated");
        assert_eq!(queue.stats().await.expect("stats").total_tasks, 0);
    }

    #[tokio::test]
    async fn test_status_of_malformed_record() {
        let (store, queue) = queue();
        let id = Uuid::new_v4();
        store
            .hash_set(&task_key(id), &[("status".to_string(), "pending".to_string())])
            .await
            .expect("hset");

        let err = queue.status(id).await.expect_err("malformed");
        assert!(matches!(err, QueueError::Malformed { .. }));

        // Scans skip it instead of failing.
        assert_eq!(queue.stats().await.expect("stats").total_tasks, 0);
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let (_, queue) = queue();
        for _ in 0..3 {
            queue.enqueue(payload()).await.expect("enqueue");
        }
        let task = queue
            .dequeue("w", Duration::from_millis(20))
            .await
            .expect("dequeue")
            .expect("task");
        queue
            .complete(task.id, serde_json::json!({}))
            .await
            .expect("complete");

        let stats = queue.stats().await.expect("stats");
        assert_eq!(stats.queue_length, 2);
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.count(TaskStatus::Pending), 2);
        assert_eq!(stats.count(TaskStatus::Completed), 1);
        assert_eq!(stats.count(TaskStatus::Processing), 0);

        let durations = queue.processing_durations().await.expect("durations");
        assert_eq!(durations.len(), 1);
        assert!(durations[0] >= 0.0);
    }

    #[tokio::test]
    async fn test_sweep_with_zero_age_removes_only_terminal() {
        let (_, queue) = queue();
        let failed = queue.enqueue(payload()).await.expect("enqueue");
        let completed = queue.enqueue(payload()).await.expect("enqueue");
        let processing = queue.enqueue(payload()).await.expect("enqueue");
        let pending = queue.enqueue(payload()).await.expect("enqueue");

        for expected in [failed, completed, processing] {
            let task = queue
                .dequeue("w", Duration::from_millis(20))
                .await
                .expect("dequeue")
                .expect("task");
            assert_eq!(task.id, expected);
        }
        queue.fail(failed, "x").await.expect("fail");
        queue
            .complete(completed, serde_json::json!({}))
            .await
            .expect("complete");

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = queue.sweep(Duration::ZERO).await.expect("sweep");
        assert_eq!(removed, 2);

        assert!(queue.status(failed).await.expect("status").is_none());
        assert!(queue.status(completed).await.expect("status").is_none());
        let left = queue.status(processing).await.expect("status").expect("record");
        assert_eq!(left.status, TaskStatus::Processing);
        let left = queue.status(pending).await.expect("status").expect("record");
        assert_eq!(left.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_terminal_tasks() {
        let (_, queue) = queue();
        let id = queue.enqueue(payload()).await.expect("enqueue");
        queue
            .dequeue("w", Duration::from_millis(20))
            .await
            .expect("dequeue");
        queue
            .complete(id, serde_json::json!({}))
            .await
            .expect("complete");

        let removed = queue.sweep(Duration::from_secs(3600)).await.expect("sweep");
        assert_eq!(removed, 0);
        assert!(queue.status(id).await.expect("status").is_some());
    }
}
