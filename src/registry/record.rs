//! Worker records as stored in the registry.
//!
//! A record carries no status flag. Liveness is derived at query time from
//! `last_heartbeat`, see [`WorkerView`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::task::{decode_time, encode_time};

/// Key prefix for worker records.
pub const WORKER_KEY_PREFIX: &str = "worker:";

/// Capability advertising support for every filter.
pub const ALL_CAPABILITIES: &str = "all";

/// Returns the store key of a worker record.
pub fn worker_key(worker_id: &str) -> String {
    format!("{}{}", WORKER_KEY_PREFIX, worker_id)
}

/// Counters a worker reports with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Tasks finished as completed.
    pub tasks_completed: u64,
    /// Tasks finished as failed.
    pub tasks_failed: u64,
    /// Seconds spent processing tasks.
    pub total_processing_time_secs: f64,
}

impl WorkerStats {
    /// Accounts for one finished task.
    pub fn record(&mut self, success: bool, processing_time_secs: f64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_processing_time_secs += processing_time_secs;
    }

    /// Tasks finished either way.
    pub fn total(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    pub(crate) fn to_fields(self) -> Vec<(String, String)> {
        vec![
            (
                "tasks_completed".to_string(),
                self.tasks_completed.to_string(),
            ),
            ("tasks_failed".to_string(), self.tasks_failed.to_string()),
            (
                "total_processing_time".to_string(),
                self.total_processing_time_secs.to_string(),
            ),
        ]
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker identifier.
    pub id: String,
    /// Filter names the worker handles, or [`ALL_CAPABILITIES`].
    pub capabilities: Vec<String>,
    /// Host the worker runs on.
    pub host: String,
    /// Port, when the worker listens on one.
    pub port: Option<u16>,
    /// When the worker (last) registered.
    pub registered_at: DateTime<Utc>,
    /// When the last heartbeat landed.
    pub last_heartbeat: DateTime<Utc>,
    /// Counters from the last heartbeat.
    #[serde(flatten)]
    pub stats: WorkerStats,
}

impl WorkerRecord {
    /// Creates a fresh record with zeroed counters.
    pub fn new(
        id: impl Into<String>,
        capabilities: Vec<String>,
        host: impl Into<String>,
        port: Option<u16>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capabilities,
            host: host.into(),
            port,
            registered_at: now,
            last_heartbeat: now,
            stats: WorkerStats::default(),
        }
    }

    /// Returns whether the worker advertises `capability`.
    pub fn can_handle(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == capability || c == ALL_CAPABILITIES)
    }

    /// Time since the last heartbeat, as seen at `now`.
    pub fn time_since_heartbeat(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }

    pub(crate) fn to_fields(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            (
                "capabilities".to_string(),
                serde_json::to_string(&self.capabilities)?,
            ),
            ("host".to_string(), self.host.clone()),
            (
                "port".to_string(),
                self.port.map(|p| p.to_string()).unwrap_or_default(),
            ),
            (
                "registered_at".to_string(),
                encode_time(Some(self.registered_at)),
            ),
            (
                "last_heartbeat".to_string(),
                encode_time(Some(self.last_heartbeat)),
            ),
        ];
        fields.extend(self.stats.to_fields());
        Ok(fields)
    }

    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Result<Self, String> {
        let get = |name: &str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| format!("missing field '{}'", name))
        };
        let number = |name: &str| -> Result<u64, String> {
            match fields.get(name).map(String::as_str) {
                None | Some("") => Ok(0),
                Some(v) => v
                    .parse()
                    .map_err(|e| format!("invalid {} '{}': {}", name, v, e)),
            }
        };

        let id = get("id")?.to_string();
        if id.is_empty() {
            return Err("empty worker id".to_string());
        }
        let capabilities = serde_json::from_str(get("capabilities")?)
            .map_err(|e| format!("invalid capabilities: {}", e))?;
        let port = match fields.get("port").map(String::as_str) {
            None | Some("") => None,
            Some(v) => Some(
                v.parse()
                    .map_err(|e| format!("invalid port '{}': {}", v, e))?,
            ),
        };
        let total_processing_time_secs = match fields.get("total_processing_time").map(String::as_str)
        {
            None | Some("") => 0.0,
            Some(v) => v
                .parse()
                .map_err(|e| format!("invalid total_processing_time '{}': {}", v, e))?,
        };

        Ok(Self {
            id,
            capabilities,
            host: fields.get("host").cloned().unwrap_or_default(),
            port,
            registered_at: decode_time(get("registered_at")?)?,
            last_heartbeat: decode_time(get("last_heartbeat")?)?,
            stats: WorkerStats {
                tasks_completed: number("tasks_completed")?,
                tasks_failed: number("tasks_failed")?,
                total_processing_time_secs,
            },
        })
    }
}

/// Liveness of a worker, derived from its heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Heartbeat within the timeout.
    Active,
    /// Heartbeat older than the timeout.
    Inactive,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// A worker record annotated with its derived status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerView {
    /// The stored record.
    #[serde(flatten)]
    pub record: WorkerRecord,
    /// Derived liveness.
    pub status: WorkerStatus,
    /// Seconds since the last heartbeat.
    pub time_since_heartbeat_secs: f64,
}

impl WorkerView {
    /// Annotates `record` as seen at `now` with the given liveness timeout.
    pub fn new(record: WorkerRecord, now: DateTime<Utc>, timeout: chrono::Duration) -> Self {
        let age = record.time_since_heartbeat(now);
        let status = if age <= timeout {
            WorkerStatus::Active
        } else {
            WorkerStatus::Inactive
        };
        Self {
            time_since_heartbeat_secs: age.num_milliseconds() as f64 / 1000.0,
            record,
            status,
        }
    }

    /// Returns whether the worker is live.
    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }
}
