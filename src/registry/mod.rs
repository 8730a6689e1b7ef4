//! Worker registry: service discovery and failure detection.
//!
//! This module provides functionality for:
//! - Registering and unregistering workers with their capabilities
//! - Recording heartbeats and per-worker counters
//! - Deriving liveness from heartbeat age
//! - Capability lookup and least-busy selection
//! - Purging long-dead workers
//!
//! Each worker lives in its own hash, `worker:{id}`.

pub mod heartbeat;
pub mod record;

pub use heartbeat::HeartbeatManager;
pub use record::{
    worker_key, WorkerRecord, WorkerStats, WorkerStatus, WorkerView, ALL_CAPABILITIES,
    WORKER_KEY_PREFIX,
};

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::store::{SharedStore, StoreError};

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default heartbeat age after which a worker is inactive.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(90);

/// Default heartbeat age after which a worker is purged.
pub const DEFAULT_CLEANUP_AGE: Duration = Duration::from_secs(300);

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Backing store failed.
    #[error("Registry store error: {0}")]
    Store(#[from] StoreError),

    /// The worker has no record.
    #[error("Worker {0} not found")]
    NotFound(String),

    /// A stored record could not be decoded.
    #[error("Malformed worker record {key}: {reason}")]
    Malformed {
        /// Store key of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Failed to serialize record data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    /// Records in the registry, live or not.
    pub total_workers: usize,
    /// Live workers.
    pub active_workers: usize,
    /// Tasks completed by live workers.
    pub tasks_completed: u64,
    /// Tasks failed by live workers.
    pub tasks_failed: u64,
    /// Sorted union of live workers' capabilities.
    pub capabilities: Vec<String>,
    /// Percentage of successful tasks; 100 when none finished.
    pub success_rate: f64,
}

/// Registry of workers over a shared store.
#[derive(Clone)]
pub struct WorkerRegistry {
    store: SharedStore,
    worker_timeout: Duration,
}

impl WorkerRegistry {
    /// Creates a registry with the default liveness timeout.
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }

    /// Sets the heartbeat age after which a worker is inactive.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Returns the liveness timeout.
    pub fn worker_timeout(&self) -> Duration {
        self.worker_timeout
    }

    /// Registers a worker, overwriting any previous record.
    ///
    /// Timestamps are set to now and counters reset to zero.
    ///
    /// # Arguments
    ///
    /// * `worker_id` - Unique worker identifier
    /// * `capabilities` - Filter names handled, or `["all"]`
    /// * `host` - Host the worker runs on
    /// * `port` - Optional port
    pub async fn register(
        &self,
        worker_id: &str,
        capabilities: &[String],
        host: &str,
        port: Option<u16>,
    ) -> Result<bool, RegistryError> {
        let key = worker_key(worker_id);
        let record = WorkerRecord::new(worker_id, capabilities.to_vec(), host, port);

        // Drop stale fields from an older record before writing the new one.
        self.store.delete(&key).await?;
        self.store.hash_set(&key, &record.to_fields()?).await?;

        tracing::info!(
            worker_id = %worker_id,
            host = %host,
            capabilities = ?capabilities,
            "Worker registered"
        );

        Ok(true)
    }

    /// Removes a worker.
    ///
    /// # Returns
    ///
    /// `false` if the worker was not registered.
    pub async fn unregister(&self, worker_id: &str) -> Result<bool, RegistryError> {
        let removed = self.store.delete(&worker_key(worker_id)).await?;
        if removed {
            tracing::info!(worker_id = %worker_id, "Worker unregistered");
        } else {
            tracing::warn!(worker_id = %worker_id, "Worker was not registered");
        }
        Ok(removed)
    }

    /// Records a heartbeat with the worker's current counters.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if the worker has no decodable
    /// record. A partial hash left by a heartbeat racing an unregister counts
    /// as missing, so the caller registers again and overwrites it.
    pub async fn heartbeat(&self, worker_id: &str, stats: WorkerStats) -> Result<(), RegistryError> {
        let key = worker_key(worker_id);
        match self.get(worker_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(RegistryError::NotFound(worker_id.to_string())),
            Err(RegistryError::Malformed { reason, .. }) => {
                tracing::warn!(worker_id = %worker_id, reason = %reason, "Worker record is partial");
                return Err(RegistryError::NotFound(worker_id.to_string()));
            }
            Err(e) => return Err(e),
        }

        let mut fields = stats.to_fields();
        fields.push((
            "last_heartbeat".to_string(),
            Utc::now().to_rfc3339(),
        ));
        self.store.hash_set(&key, &fields).await?;

        tracing::trace!(worker_id = %worker_id, "Heartbeat recorded");
        Ok(())
    }

    /// Looks up a worker.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Malformed` if the record cannot be decoded.
    pub async fn get(&self, worker_id: &str) -> Result<Option<WorkerRecord>, RegistryError> {
        let key = worker_key(worker_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        WorkerRecord::from_fields(&fields)
            .map(Some)
            .map_err(|reason| RegistryError::Malformed { key, reason })
    }

    async fn records(&self) -> Result<Vec<WorkerRecord>, RegistryError> {
        Ok(self.scan().await?.0)
    }

    /// Reads every worker hash, splitting decodable records from the keys of
    /// malformed ones.
    async fn scan(&self) -> Result<(Vec<WorkerRecord>, Vec<String>), RegistryError> {
        let keys = self.store.scan_prefix(WORKER_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        let mut malformed = Vec::new();

        let reads = keys.into_iter().map(|key| async move {
            let fields = self.store.hash_get_all(&key).await;
            (key, fields)
        });

        for (key, fields) in futures::future::join_all(reads).await {
            let fields = fields?;
            if fields.is_empty() {
                continue;
            }
            match WorkerRecord::from_fields(&fields) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    tracing::warn!(key = %key, reason = %reason, "Skipping malformed worker record");
                    malformed.push(key);
                }
            }
        }

        Ok((records, malformed))
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.worker_timeout).unwrap_or(chrono::Duration::zero())
    }

    /// Every registered worker, annotated with its derived status.
    pub async fn all_workers(&self) -> Result<Vec<WorkerView>, RegistryError> {
        self.all_workers_at(Utc::now()).await
    }

    /// Like [`all_workers`](Self::all_workers), with liveness judged at `now`.
    pub async fn all_workers_at(&self, now: DateTime<Utc>) -> Result<Vec<WorkerView>, RegistryError> {
        let timeout = self.timeout();
        Ok(self
            .records()
            .await?
            .into_iter()
            .map(|record| WorkerView::new(record, now, timeout))
            .collect())
    }

    /// Workers whose last heartbeat is within the liveness timeout.
    ///
    /// Stale workers are left untouched.
    pub async fn active_workers(&self) -> Result<Vec<WorkerView>, RegistryError> {
        self.active_workers_at(Utc::now()).await
    }

    /// Like [`active_workers`](Self::active_workers), judged at `now`.
    pub async fn active_workers_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkerView>, RegistryError> {
        let mut workers = self.all_workers_at(now).await?;
        workers.retain(WorkerView::is_active);
        Ok(workers)
    }

    /// Live workers able to run `capability`.
    pub async fn workers_with_capability(
        &self,
        capability: &str,
    ) -> Result<Vec<WorkerView>, RegistryError> {
        let mut workers = self.active_workers().await?;
        workers.retain(|w| w.record.can_handle(capability));
        Ok(workers)
    }

    /// The live worker with the fewest completed tasks.
    ///
    /// # Arguments
    ///
    /// * `capability` - Restrict the choice to workers handling this filter
    pub async fn least_busy(
        &self,
        capability: Option<&str>,
    ) -> Result<Option<WorkerView>, RegistryError> {
        let workers = match capability {
            Some(capability) => self.workers_with_capability(capability).await?,
            None => self.active_workers().await?,
        };
        Ok(workers
            .into_iter()
            .min_by_key(|w| w.record.stats.tasks_completed))
    }

    /// Deletes workers whose last heartbeat is older than `max_inactive_age`,
    /// along with any worker hash that cannot be decoded.
    ///
    /// A live worker whose partial hash is removed registers again on its
    /// next heartbeat.
    ///
    /// # Returns
    ///
    /// The number of keys removed.
    pub async fn cleanup(&self, max_inactive_age: Duration) -> Result<usize, RegistryError> {
        let max_age =
            chrono::Duration::from_std(max_inactive_age).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();
        let mut removed = 0;
        let (records, malformed) = self.scan().await?;

        for record in records {
            if record.time_since_heartbeat(now) > max_age
                && self.store.delete(&worker_key(&record.id)).await?
            {
                tracing::info!(worker_id = %record.id, "Removed inactive worker");
                removed += 1;
            }
        }

        for key in malformed {
            if self.store.delete(&key).await? {
                tracing::info!(key = %key, "Removed malformed worker record");
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Aggregate counts over the registry.
    pub async fn registry_stats(&self) -> Result<RegistryStats, RegistryError> {
        let workers = self.all_workers().await?;
        let total_workers = workers.len();
        let active: Vec<&WorkerView> = workers.iter().filter(|w| w.is_active()).collect();

        let tasks_completed = active.iter().map(|w| w.record.stats.tasks_completed).sum();
        let tasks_failed = active.iter().map(|w| w.record.stats.tasks_failed).sum();
        let capabilities: BTreeSet<String> = active
            .iter()
            .flat_map(|w| w.record.capabilities.iter().cloned())
            .collect();

        let finished = tasks_completed + tasks_failed;
        let success_rate = if finished == 0 {
            100.0
        } else {
            tasks_completed as f64 / finished as f64 * 100.0
        };

        Ok(RegistryStats {
            total_workers,
            active_workers: active.len(),
            tasks_completed,
            tasks_failed,
            capabilities: capabilities.into_iter().collect(),
            success_rate,
        })
    }
}
