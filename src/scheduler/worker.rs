//! Worker process: pulls tasks from the queue and runs filter chains.
//!
//! A worker registers itself, verifies it is visible to the fleet, starts its
//! heartbeat, then loops on a blocking dequeue until shutdown is requested.
//! Shutdown is observed between dequeues, so exit latency is bounded by the
//! dequeue timeout plus the task in flight.
//!
//! # Partial batches
//!
//! Each input image is processed independently. If at least one succeeds the
//! task completes and the failures are listed in the result; if all fail the
//! task fails with the aggregated errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::{QueueError, TaskQueue};
use super::task::{ImageOutcome, Task, TaskOutcome};
use crate::config::{parse_env_value, ConfigError, FleetConfig};
use crate::filters::{self, FilterError, FilterRegistry};
use crate::registry::{
    HeartbeatManager, RegistryError, WorkerRegistry, WorkerStats, ALL_CAPABILITIES,
    DEFAULT_HEARTBEAT_INTERVAL,
};

/// Errors that stop a worker from running.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Queue or store failure during bootstrap.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Registry failure during bootstrap.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Registration succeeded but the worker is not listed as active.
    #[error("Worker {0} registered but not visible in the active worker list")]
    NotVisible(String),
}

/// Configuration for a single worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,
    /// Filter names this worker accepts, or `["all"]`.
    pub capabilities: Vec<String>,
    /// Host advertised in the registry.
    pub host: String,
    /// Port advertised in the registry.
    pub port: Option<u16>,
    /// How long each dequeue blocks.
    pub dequeue_timeout: Duration,
    /// Pause after a failed dequeue.
    pub error_backoff: Duration,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Inputs used when a task names none.
    pub default_images: Vec<String>,
    /// Directory receiving filtered images; nothing is written when unset.
    pub output_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            capabilities: vec![ALL_CAPABILITIES.to_string()],
            host: "localhost".to_string(),
            port: None,
            dequeue_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            default_images: Vec::new(),
            output_dir: None,
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", chrono::Utc::now().timestamp())
}

impl WorkerConfig {
    /// Creates a configuration for `worker_id` with default values.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration from the fleet settings and environment.
    ///
    /// Environment variables:
    /// - `WORKER_ID`: Identifier (default: worker-{unix timestamp})
    /// - `WORKER_CAPABILITIES`: Comma-separated filters or `all` (default: all)
    /// - `HOSTNAME`: Advertised host (default: localhost)
    /// - `WORKER_PORT`: Advertised port (default: none)
    /// - `WORKER_DEFAULT_IMAGES`: Comma-separated fallback inputs
    /// - `WORKER_OUTPUT_DIR`: Where filtered images are written
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unparsable port.
    pub fn from_env(fleet: &FleetConfig) -> Result<Self, ConfigError> {
        Self::from_lookup(fleet, |key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(fleet: &FleetConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default()
            .with_dequeue_timeout(fleet.dequeue_timeout)
            .with_heartbeat_interval(fleet.heartbeat_interval);

        if let Some(val) = lookup("WORKER_ID").filter(|v| !v.trim().is_empty()) {
            config.worker_id = val.trim().to_string();
        }

        if let Some(val) = lookup("WORKER_CAPABILITIES") {
            config.capabilities = filters::parse_capabilities(&val);
        }

        if let Some(val) = lookup("HOSTNAME").filter(|v| !v.trim().is_empty()) {
            config.host = val;
        }

        if let Some(val) = lookup("WORKER_PORT") {
            config.port = Some(parse_env_value(&val, "WORKER_PORT")?);
        }

        if let Some(val) = lookup("WORKER_DEFAULT_IMAGES") {
            config.default_images = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(val) = lookup("WORKER_OUTPUT_DIR").filter(|v| !v.trim().is_empty()) {
            config.output_dir = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Sets the capabilities.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the advertised host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the dequeue timeout.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Sets the pause after a failed dequeue.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the fallback inputs.
    pub fn with_default_images(mut self, images: Vec<String>) -> Self {
        self.default_images = images;
        self
    }

    /// Sets the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// A worker bound to a queue and a registry.
pub struct Worker {
    config: WorkerConfig,
    queue: TaskQueue,
    registry: WorkerRegistry,
    filters: Arc<FilterRegistry>,
    heartbeat: HeartbeatManager,
}

impl Worker {
    /// Creates a worker. Nothing touches the store until [`run`](Self::run).
    pub fn new(
        config: WorkerConfig,
        queue: TaskQueue,
        registry: WorkerRegistry,
        filters: FilterRegistry,
    ) -> Self {
        let heartbeat = HeartbeatManager::new(
            registry.clone(),
            config.worker_id.clone(),
            config.capabilities.clone(),
            config.host.clone(),
            config.port,
        )
        .with_interval(config.heartbeat_interval);

        Self {
            config,
            queue,
            registry,
            filters: Arc::new(filters),
            heartbeat,
        }
    }

    /// Returns the worker identifier.
    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    /// Returns the counters accumulated so far.
    pub fn stats(&self) -> WorkerStats {
        self.heartbeat.stats()
    }

    /// Runs the worker until `shutdown` flips to `true`.
    ///
    /// # Returns
    ///
    /// The final counters.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError` if the store is unreachable or registration
    /// fails. Errors after startup are logged and retried instead.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<WorkerStats, WorkerError> {
        let worker_id = self.config.worker_id.clone();

        self.queue.ping().await?;
        debug!(worker_id = %worker_id, "Store connection verified");

        self.registry
            .register(
                &worker_id,
                &self.config.capabilities,
                &self.config.host,
                self.config.port,
            )
            .await?;

        let active = self.registry.active_workers().await?;
        if !active.iter().any(|w| w.record.id == worker_id) {
            // Leave no half-registered record behind.
            let _ = self.registry.unregister(&worker_id).await;
            return Err(WorkerError::NotVisible(worker_id));
        }
        info!(
            worker_id = %worker_id,
            active_workers = active.len(),
            capabilities = ?filters::expand_capabilities(&self.config.capabilities, &self.filters.names()),
            "Worker verified in active worker list"
        );

        self.heartbeat.start();
        info!(worker_id = %worker_id, queue = %self.queue.name(), "Worker started, waiting for tasks");

        while !*shutdown.borrow_and_update() {
            match self
                .queue
                .dequeue(&worker_id, self.config.dequeue_timeout)
                .await
            {
                Ok(Some(task)) => {
                    self.process(task).await;
                }
                Ok(None) => {
                    debug!(worker_id = %worker_id, "No tasks available");
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Failed to dequeue task");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        changed = shutdown.changed() => {
                            // Sender dropped counts as a shutdown request.
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(worker_id = %worker_id, "Shutting down worker");
        if let Err(e) = self.heartbeat.stop().await {
            warn!(worker_id = %worker_id, error = %e, "Failed to unregister worker");
        }

        let stats = self.heartbeat.stats();
        let average_secs = if stats.tasks_completed > 0 {
            stats.total_processing_time_secs / stats.tasks_completed as f64
        } else {
            0.0
        };
        info!(
            worker_id = %worker_id,
            tasks_completed = stats.tasks_completed,
            tasks_failed = stats.tasks_failed,
            total_processing_time_secs = stats.total_processing_time_secs,
            average_task_secs = average_secs,
            "Worker stopped"
        );

        Ok(stats)
    }

    /// Processes one dequeued task and records its terminal state.
    ///
    /// # Returns
    ///
    /// Whether the task completed.
    pub async fn process(&self, task: Task) -> bool {
        let started = Instant::now();
        let worker_id = &self.config.worker_id;
        let payload = &task.payload;

        info!(
            worker_id = %worker_id,
            task_id = %task.id,
            filters = ?payload.filters,
            images = payload.images.len(),
            "Processing task"
        );

        let unsupported = filters::unsupported_filters(
            &payload.filters,
            &self.config.capabilities,
            &self.filters.names(),
        );
        if !unsupported.is_empty() {
            let message = format!(
                "Worker {} cannot handle filters: {}",
                worker_id,
                unsupported.join(", ")
            );
            return self.finish_failed(&task, &message, started).await;
        }

        let images = if payload.images.is_empty() {
            &self.config.default_images
        } else {
            &payload.images
        };
        if images.is_empty() {
            return self
                .finish_failed(&task, "Task has no images to process", started)
                .await;
        }

        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.process_image(&task, image).await);
        }

        let outcome = TaskOutcome::new(
            worker_id.clone(),
            results,
            payload.filters.clone(),
            started.elapsed().as_secs_f64(),
        );

        if outcome.all_failed() {
            let message = format!(
                "All {} images failed. Errors: [{}]",
                outcome.images_processed,
                outcome.errors().join("; ")
            );
            return self.finish_failed(&task, &message, started).await;
        }

        let result = match serde_json::to_value(&outcome) {
            Ok(value) => value,
            Err(e) => {
                let message = format!("Cannot encode task result: {}", e);
                return self.finish_failed(&task, &message, started).await;
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        match self.queue.complete(task.id, result).await {
            Ok(()) => {
                if outcome.images_failed > 0 {
                    warn!(
                        worker_id = %worker_id,
                        task_id = %task.id,
                        failed = outcome.images_failed,
                        total = outcome.images_processed,
                        elapsed_secs = elapsed,
                        "Task completed with failures"
                    );
                } else {
                    info!(
                        worker_id = %worker_id,
                        task_id = %task.id,
                        elapsed_secs = elapsed,
                        "Task completed"
                    );
                }
            }
            Err(e) => {
                error!(worker_id = %worker_id, task_id = %task.id, error = %e, "Failed to record completion");
            }
        }

        self.heartbeat.record_task(true, elapsed);
        true
    }

    async fn finish_failed(&self, task: &Task, message: &str, started: Instant) -> bool {
        let elapsed = started.elapsed().as_secs_f64();
        if let Err(e) = self.queue.fail(task.id, message).await {
            error!(
                worker_id = %self.config.worker_id,
                task_id = %task.id,
                error = %e,
                "Failed to record failure"
            );
        }
        error!(
            worker_id = %self.config.worker_id,
            task_id = %task.id,
            elapsed_secs = elapsed,
            reason = %message,
            "Task failed"
        );
        self.heartbeat.record_task(false, elapsed);
        false
    }

    async fn process_image(&self, task: &Task, image: &str) -> ImageOutcome {
        let mut outcome = ImageOutcome {
            image_path: image.to_string(),
            filters_applied: Vec::new(),
            filter_results: Vec::new(),
            output_path: None,
            error: None,
            worker_id: self.config.worker_id.clone(),
        };

        match self.run_filters(task, image).await {
            Ok((metadata, output_path)) => {
                debug!(task_id = %task.id, image = %image, "Image processed");
                outcome.filters_applied = task.payload.filters.clone();
                outcome.filter_results = metadata;
                outcome.output_path = output_path;
            }
            Err(e) => {
                warn!(task_id = %task.id, image = %image, error = %e, "Image failed");
                outcome.error = Some(e.to_string());
            }
        }

        outcome
    }

    async fn run_filters(
        &self,
        task: &Task,
        image: &str,
    ) -> Result<(Vec<serde_json::Value>, Option<String>), FilterError> {
        let chain = self.filters.chain(&task.payload.filters)?;

        let bytes = tokio::fs::read(image)
            .await
            .map_err(|e| FilterError::UnreadableInput {
                path: image.to_string(),
                reason: e.to_string(),
            })?;

        let params = task.payload.filter_params.clone();
        let (output, metadata) = tokio::task::spawn_blocking(move || chain.run(bytes, &params))
            .await
            .map_err(|e| FilterError::Failed {
                filter: task.payload.filters.join(","),
                reason: format!("filter thread aborted: {}", e),
            })??;

        let output_path = match &self.config.output_dir {
            Some(dir) => Some(write_output(dir, task, image, &output).await?),
            None => None,
        };

        Ok((metadata, output_path))
    }
}

async fn write_output(
    dir: &Path,
    task: &Task,
    image: &str,
    bytes: &[u8],
) -> Result<String, FilterError> {
    let source = Path::new(image);
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let file_name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, task.id.simple(), ext),
        None => format!("{}_{}", stem, task.id.simple()),
    };
    let path = dir.join(file_name);

    let write_error = |e: std::io::Error| FilterError::Failed {
        filter: "output".to_string(),
        reason: format!("cannot write {}: {}", path.display(), e),
    };
    tokio::fs::create_dir_all(dir).await.map_err(write_error)?;
    tokio::fs::write(&path, bytes).await.map_err(write_error)?;

    Ok(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_from_lookup() {
        let fleet = FleetConfig::default().with_dequeue_timeout(Duration::from_secs(2));
        let config = WorkerConfig::from_lookup(&fleet, |key| match key {
            "WORKER_ID" => Some("w-9".to_string()),
            "WORKER_CAPABILITIES" => Some("resize, blur".to_string()),
            "HOSTNAME" => Some("node-3".to_string()),
            "WORKER_PORT" => Some("8081".to_string()),
            "WORKER_DEFAULT_IMAGES" => Some("a.jpg,b.jpg".to_string()),
            _ => None,
        })
        .expect("config");

        assert_eq!(config.worker_id, "w-9");
        assert_eq!(config.capabilities, vec!["resize".to_string(), "blur".to_string()]);
        assert_eq!(config.host, "node-3");
        assert_eq!(config.port, Some(8081));
        assert_eq!(config.dequeue_timeout, Duration::from_secs(2));
        assert_eq!(config.default_images.len(), 2);
        assert!(config.output_dir.is_none());
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::from_lookup(&FleetConfig::default(), |_| None).expect("config");
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.capabilities, vec!["all".to_string()]);
        assert_eq!(config.host, "localhost");

        let err = WorkerConfig::from_lookup(&FleetConfig::default(), |key| {
            (key == "WORKER_PORT").then(|| "http".to_string())
        })
        .expect_err("bad port");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
