//! Autoscaler: periodic collect → evaluate → (optionally) resize.
//!
//! Without an executor the autoscaler is advisory and only reports what it
//! would do. With one it is acting and forwards every scale-up and
//! scale-down decision as a [`ResizeCommand`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use super::executor::{ExecutorError, FleetExecutor, ResizeCommand, DEFAULT_WORKER_ROLE};
use super::rules::{ScalingAction, ScalingDecision, ScalingEngine};
use crate::config::{ConfigError, ScalingConfig};
use crate::metrics::prometheus::record_scaling_decision;
use crate::metrics::{MetricsCollector, MetricsSnapshot};

/// Scaling events kept in memory.
pub const HISTORY_LIMIT: usize = 50;

/// Errors raised by the autoscaler.
#[derive(Debug, Error)]
pub enum ScalingError {
    /// Requested fleet size is outside the configured bounds.
    #[error("Target of {target} workers is outside [{min}, {max}]")]
    InvalidTarget {
        /// Requested size.
        target: usize,
        /// Lower bound.
        min: usize,
        /// Upper bound.
        max: usize,
    },

    /// The operation needs an executor.
    #[error("Autoscaler is advisory; no fleet executor configured")]
    AdvisoryMode,

    /// Scaling thresholds are inconsistent.
    #[error("Invalid scaling configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The executor rejected a resize.
    #[error("Resize failed: {0}")]
    Executor(#[from] ExecutorError),
}

/// Whether decisions are acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// Decisions are reported only.
    Advisory,
    /// Decisions are forwarded to a fleet executor.
    Acting,
}

/// One scaling decision that asked for a fleet change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    /// When the decision was taken.
    pub timestamp: DateTime<Utc>,
    /// Action taken or recommended.
    pub action: ScalingAction,
    /// Fleet size before.
    pub from_workers: usize,
    /// Requested fleet size.
    pub to_workers: usize,
    /// Why.
    pub reason: String,
    /// Engine confidence.
    pub confidence: f64,
    /// True if an executor accepted the resize.
    pub executed: bool,
}

/// Serializable view of the autoscaler.
#[derive(Debug, Clone, Serialize)]
pub struct AutoscalerStatus {
    /// Fresh metrics.
    pub snapshot: MetricsSnapshot,
    /// What the engine would decide now. Does not start a cooldown.
    pub decision: ScalingDecision,
    /// Thresholds in use.
    pub config: ScalingConfig,
    /// Advisory or acting.
    pub mode: ScalingMode,
    /// Recent scaling events, oldest first.
    pub history: Vec<ScalingEvent>,
}

/// Drives the scaling engine from live metrics.
pub struct Autoscaler {
    collector: MetricsCollector,
    engine: Mutex<ScalingEngine>,
    executor: Option<Arc<dyn FleetExecutor>>,
    worker_role: String,
    history: Mutex<VecDeque<ScalingEvent>>,
}

impl Autoscaler {
    /// Creates an advisory autoscaler.
    ///
    /// # Errors
    ///
    /// Returns `ScalingError::InvalidConfig` if the thresholds do not validate.
    pub fn new(collector: MetricsCollector, config: ScalingConfig) -> Result<Self, ScalingError> {
        config.validate()?;

        Ok(Self {
            collector,
            engine: Mutex::new(ScalingEngine::new(config)),
            executor: None,
            worker_role: DEFAULT_WORKER_ROLE.to_string(),
            history: Mutex::new(VecDeque::new()),
        })
    }

    /// Switches to acting mode with the given executor.
    pub fn with_executor(mut self, executor: Arc<dyn FleetExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the role named in resize commands.
    pub fn with_worker_role(mut self, role: impl Into<String>) -> Self {
        self.worker_role = role.into();
        self
    }

    /// Current mode.
    pub fn mode(&self) -> ScalingMode {
        if self.executor.is_some() {
            ScalingMode::Acting
        } else {
            ScalingMode::Advisory
        }
    }

    /// Thresholds currently applied.
    pub fn config(&self) -> ScalingConfig {
        self.engine().config().clone()
    }

    /// Replaces the thresholds without restarting the autoscaler.
    ///
    /// # Errors
    ///
    /// Returns `ScalingError::InvalidConfig` and keeps the current thresholds
    /// if `config` does not validate.
    pub fn update_config(&self, config: ScalingConfig) -> Result<(), ScalingError> {
        self.engine().update_config(config)?;
        Ok(())
    }

    /// Metrics collector in use.
    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    fn engine(&self) -> std::sync::MutexGuard<'_, ScalingEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One monitoring cycle.
    ///
    /// Collects a snapshot, evaluates it, and in acting mode forwards any
    /// scale action to the executor. Executor failures are logged and
    /// recorded in the history as not executed.
    pub async fn tick(&self) -> ScalingDecision {
        let snapshot = self.collector.collect().await;
        let decision = self.engine().evaluate(&snapshot);
        record_scaling_decision(decision.action.as_str());

        if decision.is_actionable() {
            let executed = match &self.executor {
                Some(executor) => {
                    let command = ResizeCommand::new(&self.worker_role, decision.target_workers);
                    match executor.resize(command).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                action = %decision.action,
                                target = decision.target_workers,
                                "Failed to apply scaling decision"
                            );
                            false
                        }
                    }
                }
                None => false,
            };

            tracing::info!(
                action = %decision.action,
                from = decision.current_workers,
                to = decision.target_workers,
                confidence = decision.confidence,
                reason = %decision.reason,
                executed,
                "Scaling decision"
            );

            self.remember(ScalingEvent {
                timestamp: Utc::now(),
                action: decision.action,
                from_workers: decision.current_workers,
                to_workers: decision.target_workers,
                reason: decision.reason.clone(),
                confidence: decision.confidence,
                executed,
            });
        }

        tracing::info!(
            queue = snapshot.queue_length,
            workers = snapshot.active_workers,
            utilization = format!("{:.1}%", snapshot.worker_utilization * 100.0),
            cpu = format!("{:.1}%", snapshot.cpu_usage),
            action = %decision.action,
            degraded = snapshot.degraded,
            "Fleet status"
        );

        decision
    }

    /// Runs [`tick`](Self::tick) every `interval` until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = interval.as_secs_f64(),
            mode = ?self.mode(),
            "Autoscaler started"
        );

        while !*shutdown.borrow_and_update() {
            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Autoscaler stopped");
    }

    /// Collects metrics and previews the decision without starting a cooldown.
    pub async fn status(&self) -> AutoscalerStatus {
        let snapshot = self.collector.collect().await;
        let (decision, config) = {
            let engine = self.engine();
            let mut preview = engine.clone();
            (preview.evaluate(&snapshot), engine.config().clone())
        };

        AutoscalerStatus {
            snapshot,
            decision,
            config,
            mode: self.mode(),
            history: self.history(HISTORY_LIMIT),
        }
    }

    /// Resizes the fleet to `target` regardless of metrics.
    ///
    /// # Errors
    ///
    /// - `ScalingError::InvalidTarget` if `target` is outside the configured bounds
    /// - `ScalingError::AdvisoryMode` if no executor is configured
    /// - `ScalingError::Executor` if the resize is rejected
    pub async fn manual_scale(&self, target: usize) -> Result<ScalingEvent, ScalingError> {
        let (min, max) = {
            let engine = self.engine();
            (engine.config().min_workers, engine.config().max_workers)
        };
        if target < min || target > max {
            return Err(ScalingError::InvalidTarget { target, min, max });
        }
        let executor = self.executor.as_ref().ok_or(ScalingError::AdvisoryMode)?;

        let current = self.collector.collect().await.active_workers;
        let action = match target.cmp(&current) {
            std::cmp::Ordering::Greater => ScalingAction::ScaleUp,
            std::cmp::Ordering::Less => ScalingAction::ScaleDown,
            std::cmp::Ordering::Equal => ScalingAction::NoAction,
        };

        let mut event = ScalingEvent {
            timestamp: Utc::now(),
            action,
            from_workers: current,
            to_workers: target,
            reason: "Manual scaling".to_string(),
            confidence: 1.0,
            executed: false,
        };

        if action == ScalingAction::NoAction {
            tracing::info!(workers = current, "Already at target worker count");
            return Ok(event);
        }

        tracing::info!(from = current, to = target, "Manual scaling");
        executor
            .resize(ResizeCommand::new(&self.worker_role, target))
            .await?;

        event.executed = true;
        self.remember(event.clone());
        Ok(event)
    }

    fn remember(&self, event: ScalingEvent) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_back(event);
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// The most recent `last_n` scaling events, oldest first.
    pub fn history(&self, last_n: usize) -> Vec<ScalingEvent> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(last_n);
        history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{HostSample, StaticSampler};
    use crate::registry::WorkerRegistry;
    use crate::scheduler::{TaskPayload, TaskQueue};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingExecutor {
        commands: Mutex<Vec<ResizeCommand>>,
        fail: bool,
    }

    #[async_trait]
    impl FleetExecutor for RecordingExecutor {
        async fn resize(&self, command: ResizeCommand) -> Result<(), ExecutorError> {
            self.commands.lock().expect("lock").push(command);
            if self.fail {
                return Err(ExecutorError::ServiceNotFound("worker".to_string()));
            }
            Ok(())
        }
    }

    /// One live worker, twelve queued tasks, hot CPU.
    async fn overloaded() -> Autoscaler {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let registry = WorkerRegistry::new(store);
        registry
            .register("w1", &["all".to_string()], "h", None)
            .await
            .expect("register");
        for _ in 0..12 {
            queue
                .enqueue(TaskPayload::new(["inspect"], ["x"]))
                .await
                .expect("enqueue");
        }

        let host = StaticSampler(HostSample {
            cpu_usage: 80.0,
            memory_usage: 40.0,
            memory_available_gb: 4.0,
        });
        let collector = MetricsCollector::new(queue, registry, Arc::new(host));
        Autoscaler::new(collector, ScalingConfig::default()).expect("autoscaler")
    }

    #[tokio::test]
    async fn test_advisory_tick_only_records() {
        let autoscaler = overloaded().await;
        assert_eq!(autoscaler.mode(), ScalingMode::Advisory);

        let decision = autoscaler.tick().await;
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_workers, 3);

        let history = autoscaler.history(10);
        assert_eq!(history.len(), 1);
        assert!(!history[0].executed);
    }

    #[tokio::test]
    async fn test_acting_tick_resizes_once_per_cooldown() {
        let executor = Arc::new(RecordingExecutor::default());
        let autoscaler = overloaded()
            .await
            .with_executor(executor.clone())
            .with_worker_role("filter-worker");
        assert_eq!(autoscaler.mode(), ScalingMode::Acting);

        autoscaler.tick().await;
        let second = autoscaler.tick().await;
        assert_eq!(second.action, ScalingAction::NoAction);
        assert!(second.reason.contains("Cooldown"));

        let commands = executor.commands.lock().expect("lock").clone();
        assert_eq!(commands, vec![ResizeCommand::new("filter-worker", 3)]);
        assert!(autoscaler.history(10)[0].executed);
    }

    #[tokio::test]
    async fn test_executor_failure_is_recorded() {
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..Default::default()
        });
        let autoscaler = overloaded().await.with_executor(executor);

        let decision = autoscaler.tick().await;
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert!(!autoscaler.history(1)[0].executed);
    }

    #[tokio::test]
    async fn test_status_does_not_start_cooldown() {
        let autoscaler = overloaded().await;

        let status = autoscaler.status().await;
        assert_eq!(status.decision.action, ScalingAction::ScaleUp);
        assert_eq!(status.mode, ScalingMode::Advisory);
        assert_eq!(status.snapshot.queue_length, 12);

        let decision = autoscaler.tick().await;
        assert_eq!(decision.action, ScalingAction::ScaleUp);

        let json = serde_json::to_value(autoscaler.status().await).expect("serialize");
        assert_eq!(json["mode"], "advisory");
        assert_eq!(json["config"]["max_workers"], 10);
    }

    #[tokio::test]
    async fn test_manual_scale() {
        let autoscaler = overloaded().await;
        assert!(matches!(
            autoscaler.manual_scale(2).await,
            Err(ScalingError::AdvisoryMode)
        ));

        let executor = Arc::new(RecordingExecutor::default());
        let autoscaler = autoscaler.with_executor(executor.clone());
        assert!(matches!(
            autoscaler.manual_scale(11).await,
            Err(ScalingError::InvalidTarget { target: 11, .. })
        ));
        assert!(matches!(
            autoscaler.manual_scale(0).await,
            Err(ScalingError::InvalidTarget { .. })
        ));

        let event = autoscaler.manual_scale(4).await.expect("scale");
        assert_eq!(event.action, ScalingAction::ScaleUp);
        assert!(event.executed);

        let same = autoscaler.manual_scale(1).await.expect("noop");
        assert_eq!(same.action, ScalingAction::NoAction);
        assert!(!same.executed);

        assert_eq!(executor.commands.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn test_update_config_applies_to_next_tick() {
        let autoscaler = overloaded().await;
        let relaxed = ScalingConfig::default().with_scale_up_thresholds(20, 0.5, 90.0);
        autoscaler.update_config(relaxed.clone()).expect("update");
        assert_eq!(autoscaler.config(), relaxed);

        let decision = autoscaler.tick().await;
        assert_eq!(decision.action, ScalingAction::NoAction);
        assert!(autoscaler.history(10).is_empty());

        assert!(matches!(
            autoscaler.update_config(ScalingConfig::default().with_bounds(3, 1)),
            Err(ScalingError::InvalidConfig(_))
        ));
        assert_eq!(autoscaler.config(), relaxed);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let collector = MetricsCollector::new(
            TaskQueue::new(Arc::new(MemoryStore::new())),
            WorkerRegistry::new(Arc::new(MemoryStore::new())),
            Arc::new(StaticSampler::default()),
        );
        let config = ScalingConfig::default().with_bounds(5, 2);
        assert!(matches!(
            Autoscaler::new(collector, config),
            Err(ScalingError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let autoscaler = Arc::new(overloaded().await);
        let (tx, rx) = watch::channel(false);

        let runner = {
            let autoscaler = autoscaler.clone();
            tokio::spawn(async move { autoscaler.run(Duration::from_secs(60), rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("stopped in time")
            .expect("join");

        assert_eq!(autoscaler.history(10).len(), 1);
    }
}
