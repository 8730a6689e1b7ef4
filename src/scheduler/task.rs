//! Task definitions for the scheduler.
//!
//! This module defines the core task types used by the queue and the workers:
//!
//! - `TaskPayload`: What a client submits (filters, parameters, inputs)
//! - `Task`: The tracked record of one submitted job
//! - `TaskStatus`: Lifecycle state of a task
//! - `TaskOutcome` / `ImageOutcome`: The result a worker stores on completion
//! - `CompletedResult`: The entry published on the results list
//!
//! Tasks are persisted as flat hashes (`task:{id}`), one field per attribute.
//! Structured fields are JSON-encoded, timestamps are RFC 3339 and absent
//! optional values are stored as empty strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key prefix for task records.
pub const TASK_KEY_PREFIX: &str = "task:";

/// Returns the store key of a task record.
pub fn task_key(task_id: Uuid) -> String {
    format!("{}{}", TASK_KEY_PREFIX, task_id)
}

/// Job description submitted by a client.
///
/// Unknown fields are preserved in `extra` so that producers can attach
/// metadata without the queue having to understand it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    /// Names of the filters to apply, in order.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Per-filter parameters, keyed by filter name.
    #[serde(default)]
    pub filter_params: serde_json::Map<String, serde_json::Value>,
    /// Input references (paths) of the images to process.
    #[serde(default)]
    pub images: Vec<String>,
    /// Any other producer-supplied fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskPayload {
    /// Creates a payload applying `filters` to `images`.
    pub fn new<F, I>(filters: F, images: I) -> Self
    where
        F: IntoIterator,
        F::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            filters: filters.into_iter().map(Into::into).collect(),
            images: images.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Sets the parameters of one filter.
    pub fn with_filter_params(mut self, filter: impl Into<String>, params: serde_json::Value) -> Self {
        self.filter_params.insert(filter.into(), params);
        self
    }

    /// Returns the parameters configured for `filter`, or `null`.
    pub fn params_for(&self, filter: &str) -> serde_json::Value {
        self.filter_params
            .get(filter)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Lifecycle state of a task.
///
/// Transitions are monotonic: `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Handed to a worker.
    Processing,
    /// Finished, at least partially successfully.
    Completed,
    /// Finished without any successful output.
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Returns whether the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Returns whether moving to `next` respects the lifecycle.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }

    /// Returns the stored string form.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// The tracked record of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// What to do.
    pub payload: TaskPayload,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// Worker that dequeued the task.
    pub worker_id: Option<String>,
    /// When a worker picked the task up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result stored on completion.
    pub result: Option<serde_json::Value>,
    /// Error stored on failure.
    pub error: Option<String>,
}

impl Task {
    /// Creates a pending task for `payload`.
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            worker_id: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Time spent processing, when both ends are known.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Encodes every attribute as hash fields.
    pub(crate) fn to_fields(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        Ok(vec![
            ("id".to_string(), self.id.to_string()),
            ("data".to_string(), serde_json::to_string(&self.payload)?),
            ("status".to_string(), self.status.to_string()),
            ("created_at".to_string(), encode_time(Some(self.created_at))),
            (
                "worker_id".to_string(),
                self.worker_id.clone().unwrap_or_default(),
            ),
            ("started_at".to_string(), encode_time(self.started_at)),
            ("completed_at".to_string(), encode_time(self.completed_at)),
            (
                "result".to_string(),
                match &self.result {
                    Some(value) => serde_json::to_string(value)?,
                    None => String::new(),
                },
            ),
            ("error".to_string(), self.error.clone().unwrap_or_default()),
        ])
    }

    /// Decodes a task from its hash fields.
    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Result<Self, String> {
        let required = |name: &str| {
            fields
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| format!("missing field '{}'", name))
        };
        let optional = |name: &str| {
            fields
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };

        let id = Uuid::parse_str(required("id")?).map_err(|e| format!("invalid id: {}", e))?;
        let payload = serde_json::from_str(required("data")?)
            .map_err(|e| format!("invalid payload: {}", e))?;
        let status = required("status")?.parse()?;
        let created_at = decode_time(required("created_at")?)?;
        let started_at = optional("started_at").map(decode_time).transpose()?;
        let completed_at = optional("completed_at").map(decode_time).transpose()?;
        let result = optional("result")
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| format!("invalid result: {}", e))?;

        Ok(Self {
            id,
            payload,
            status,
            created_at,
            worker_id: optional("worker_id").map(str::to_string),
            started_at,
            completed_at,
            result,
            error: optional("error").map(str::to_string),
        })
    }
}

pub(crate) fn encode_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_default()
}

pub(crate) fn decode_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

/// Entry pushed onto the results list when a task completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedResult {
    /// Task the result belongs to.
    pub task_id: Uuid,
    /// Result stored on the task record.
    pub result: serde_json::Value,
    /// When the task completed.
    pub completed_at: DateTime<Utc>,
}

/// Per-image result of running a filter chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageOutcome {
    /// Input reference the filters ran on.
    pub image_path: String,
    /// Filters applied (empty when the image failed).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters_applied: Vec<String>,
    /// Metadata produced by each filter, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_results: Vec<serde_json::Value>,
    /// Where the filtered image was written, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Why this image failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker that processed the image.
    pub worker_id: String,
}

impl ImageOutcome {
    /// Returns whether this image failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Result a worker stores when it completes a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    /// Worker that processed the task.
    pub worker_id: String,
    /// One entry per input image, successful or not.
    pub results: Vec<ImageOutcome>,
    /// Number of inputs processed.
    pub images_processed: usize,
    /// Number of inputs that succeeded.
    pub images_successful: usize,
    /// Number of inputs that failed.
    pub images_failed: usize,
    /// Filter chain requested by the task.
    pub filters_applied: Vec<String>,
    /// Wall-clock processing time in seconds.
    pub total_processing_time_secs: f64,
}

impl TaskOutcome {
    /// Builds an outcome from per-image results.
    pub fn new(
        worker_id: impl Into<String>,
        results: Vec<ImageOutcome>,
        filters_applied: Vec<String>,
        total_processing_time_secs: f64,
    ) -> Self {
        let images_failed = results.iter().filter(|r| r.is_error()).count();
        Self {
            worker_id: worker_id.into(),
            images_processed: results.len(),
            images_successful: results.len() - images_failed,
            images_failed,
            results,
            filters_applied,
            total_processing_time_secs,
        }
    }

    /// Returns whether every image failed (including the no-image case).
    pub fn all_failed(&self) -> bool {
        self.images_successful == 0
    }

    /// Returns the per-image error messages.
    pub fn errors(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_is_pending() {
        let task = Task::new(TaskPayload::new(["resize"], ["a.jpg"]));

        assert!(!task.id.is_nil());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker_id.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
        assert!(task.processing_time().is_none());
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));

        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Processing.is_terminal());
    }

    #[test]
    fn test_status_display_and_parse() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.to_string().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_payload_preserves_extra_fields() {
        let json = serde_json::json!({
            "filters": ["blur"],
            "filter_params": {"blur": {"radius": 2.0}},
            "images": ["x.png"],
            "priority": 7
        });
        let payload: TaskPayload = serde_json::from_value(json).expect("payload");

        assert_eq!(payload.filters, vec!["blur".to_string()]);
        assert_eq!(payload.params_for("blur")["radius"], 2.0);
        assert_eq!(payload.params_for("resize"), serde_json::Value::Null);
        assert_eq!(payload.extra.get("priority"), Some(&serde_json::json!(7)));
    }

    #[test]
    fn test_field_encoding_of_running_task() {
        let mut task = Task::new(
            TaskPayload::new(["resize", "blur"], ["a.jpg"])
                .with_filter_params("resize", serde_json::json!({"width": 800})),
        );
        task.status = TaskStatus::Processing;
        task.worker_id = Some("worker-1".to_string());
        task.started_at = Some(Utc::now());

        let fields: HashMap<String, String> =
            task.to_fields().expect("encode").into_iter().collect();
        assert_eq!(fields["status"], "processing");
        assert_eq!(fields["completed_at"], "");
        assert_eq!(fields["result"], "");

        let decoded = Task::from_fields(&fields).expect("decode");
        assert_eq!(decoded.status, TaskStatus::Processing);
        assert_eq!(decoded.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(decoded.payload, task.payload);
        assert!(decoded.completed_at.is_none());
    }

    #[test]
    fn test_from_fields_rejects_garbage() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "not-a-uuid".to_string());
        assert!(Task::from_fields(&fields).is_err());

        let fields = HashMap::new();
        let err = Task::from_fields(&fields).expect_err("empty record");
        assert!(err.contains("id"));
    }

    #[test]
    fn test_outcome_counts() {
        let ok = ImageOutcome {
            image_path: "a.jpg".to_string(),
            filters_applied: vec!["inspect".to_string()],
            filter_results: vec![serde_json::json!({"bytes": 10})],
            output_path: None,
            error: None,
            worker_id: "w".to_string(),
        };
        let bad = ImageOutcome {
            image_path: "b.jpg".to_string(),
            filters_applied: Vec::new(),
            filter_results: Vec::new(),
            output_path: None,
            error: Some("unreadable".to_string()),
            worker_id: "w".to_string(),
        };

        let outcome = TaskOutcome::new("w", vec![ok, bad], vec!["inspect".to_string()], 0.5);
        assert_eq!(outcome.images_processed, 2);
        assert_eq!(outcome.images_successful, 1);
        assert_eq!(outcome.images_failed, 1);
        assert!(!outcome.all_failed());
        assert_eq!(outcome.errors(), vec!["unreadable"]);

        let empty = TaskOutcome::new("w", Vec::new(), Vec::new(), 0.0);
        assert!(empty.all_failed());
    }
}
