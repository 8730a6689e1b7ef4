//! Background heartbeats for a single worker.
//!
//! The manager spawns one tokio task that reports the worker's counters at a
//! fixed interval. If the registry has lost the worker (expired, purged or
//! flushed), the task registers it again with its original details and keeps
//! going.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RegistryError, WorkerRegistry, WorkerStats, DEFAULT_HEARTBEAT_INTERVAL};

/// Delay before retrying after a failed heartbeat.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Counters shared between a worker loop and its heartbeat task.
pub type SharedStats = Arc<Mutex<WorkerStats>>;

/// Identity used to (re-)register the worker.
#[derive(Debug, Clone)]
struct Identity {
    worker_id: String,
    capabilities: Vec<String>,
    host: String,
    port: Option<u16>,
}

/// Sends periodic heartbeats for one worker.
pub struct HeartbeatManager {
    registry: WorkerRegistry,
    identity: Identity,
    interval: Duration,
    retry_delay: Duration,
    stats: SharedStats,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatManager {
    /// Creates a stopped manager for `worker_id`.
    pub fn new(
        registry: WorkerRegistry,
        worker_id: impl Into<String>,
        capabilities: Vec<String>,
        host: impl Into<String>,
        port: Option<u16>,
    ) -> Self {
        Self {
            registry,
            identity: Identity {
                worker_id: worker_id.into(),
                capabilities,
                host: host.into(),
                port,
            },
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            stop_tx: None,
            handle: None,
        }
    }

    /// Sets the interval between heartbeats.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the delay before retrying a failed heartbeat.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Returns the worker this manager reports for.
    pub fn worker_id(&self) -> &str {
        &self.identity.worker_id
    }

    /// Returns the shared counters reported with each heartbeat.
    pub fn stats_handle(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    /// Returns a copy of the current counters.
    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accounts for one finished task; picked up by the next heartbeat.
    pub fn record_task(&self, success: bool, processing_time_secs: f64) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(success, processing_time_secs);
    }

    /// Returns whether the heartbeat task is running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Starts the heartbeat task. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let beat = HeartbeatLoop {
            registry: self.registry.clone(),
            identity: self.identity.clone(),
            interval: self.interval,
            retry_delay: self.retry_delay,
            stats: Arc::clone(&self.stats),
            stop_rx,
        };

        self.handle = Some(tokio::spawn(beat.run()));
        self.stop_tx = Some(stop_tx);

        info!(
            worker_id = %self.identity.worker_id,
            interval_secs = self.interval.as_secs_f64(),
            "Started heartbeat"
        );
    }

    /// Stops the heartbeat task and unregisters the worker.
    ///
    /// # Returns
    ///
    /// Whether the worker was still registered.
    pub async fn stop(&mut self) -> Result<bool, RegistryError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Receiver gone means the task already exited.
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(worker_id = %self.identity.worker_id, error = %e, "Heartbeat task panicked");
            }
        }

        info!(worker_id = %self.identity.worker_id, "Stopped heartbeat");
        self.registry.unregister(&self.identity.worker_id).await
    }
}

struct HeartbeatLoop {
    registry: WorkerRegistry,
    identity: Identity,
    interval: Duration,
    retry_delay: Duration,
    stats: SharedStats,
    stop_rx: watch::Receiver<bool>,
}

impl HeartbeatLoop {
    async fn run(mut self) {
        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let pause = match self.beat().await {
                Ok(()) => self.interval,
                Err(e) => {
                    warn!(
                        worker_id = %self.identity.worker_id,
                        error = %e,
                        "Heartbeat failed, retrying"
                    );
                    self.retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = self.stop_rx.changed() => {
                    // Sender dropped counts as a stop request.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %self.identity.worker_id, "Heartbeat loop exited");
    }

    async fn beat(&self) -> Result<(), RegistryError> {
        let stats = *self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let id = &self.identity.worker_id;

        match self.registry.heartbeat(id, stats).await {
            Err(RegistryError::NotFound(_)) => {
                warn!(worker_id = %id, "Worker missing from registry, re-registering");
                self.registry
                    .register(
                        id,
                        &self.identity.capabilities,
                        &self.identity.host,
                        self.identity.port,
                    )
                    .await?;
                // Registration zeroes the counters; restore them.
                self.registry.heartbeat(id, stats).await
            }
            other => other,
        }
    }
}
