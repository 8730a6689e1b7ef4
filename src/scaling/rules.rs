//! Scaling decision rules.
//!
//! [`ScalingEngine::evaluate`] turns a [`MetricsSnapshot`] into a
//! [`ScalingDecision`]. The only state it keeps is the last action taken and
//! when, which drives the cooldown guard. Evaluation has no side effects
//! beyond that; acting on a decision is the autoscaler's job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ScalingConfig};
use crate::metrics::MetricsSnapshot;

/// Recommended change to the fleet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// Add workers.
    ScaleUp,
    /// Remove one worker.
    ScaleDown,
    /// Keep the fleet as it is.
    NoAction,
}

impl ScalingAction {
    /// Returns the action as a lowercase string.
    pub fn as_str(self) -> &'static str {
        match self {
            ScalingAction::ScaleUp => "scale_up",
            ScalingAction::ScaleDown => "scale_down",
            ScalingAction::NoAction => "no_action",
        }
    }
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How quickly a decision should be acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Nothing to do.
    None,
    /// Act when convenient.
    Low,
    /// Act soon.
    Medium,
    /// Act now.
    High,
}

/// Output of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    /// Recommended action.
    pub action: ScalingAction,
    /// Live workers at evaluation time.
    pub current_workers: usize,
    /// Recommended fleet size.
    pub target_workers: usize,
    /// Human-readable explanation.
    pub reason: String,
    /// Confidence in the recommendation, in [0, 1].
    pub confidence: f64,
    /// How quickly to act.
    pub urgency: Urgency,
}

impl ScalingDecision {
    fn hold(current_workers: usize, reason: String, confidence: f64) -> Self {
        Self {
            action: ScalingAction::NoAction,
            current_workers,
            target_workers: current_workers,
            reason,
            confidence,
            urgency: Urgency::None,
        }
    }

    /// Returns true if the decision asks for a fleet change.
    pub fn is_actionable(&self) -> bool {
        self.action != ScalingAction::NoAction
    }
}

/// Last scaling action, kept for the cooldown guard.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LastAction {
    action: ScalingAction,
    at: DateTime<Utc>,
}

/// Scaling decision engine with cooldown memory.
#[derive(Debug, Clone)]
pub struct ScalingEngine {
    config: ScalingConfig,
    last_action: Option<LastAction>,
}

impl ScalingEngine {
    /// Creates an engine with the given thresholds.
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            last_action: None,
        }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    /// Replaces the thresholds at runtime.
    ///
    /// A running cooldown is kept and measured against the new cooldown
    /// durations.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` and keeps the current thresholds if `config`
    /// does not validate.
    pub fn update_config(&mut self, config: ScalingConfig) -> Result<(), ConfigError> {
        config.validate()?;
        tracing::info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            scale_up_queue_threshold = config.scale_up_queue_threshold,
            scale_up_cpu_threshold = config.scale_up_cpu_threshold,
            "Updated scaling thresholds"
        );
        self.config = config;
        Ok(())
    }

    /// Evaluates a snapshot against the current time.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot) -> ScalingDecision {
        self.evaluate_at(snapshot, Utc::now())
    }

    /// Evaluates a snapshot as of `now`.
    ///
    /// A pending cooldown wins over every other rule. Scale-up is checked
    /// before scale-down. Any action other than `NoAction` starts a new
    /// cooldown.
    pub fn evaluate_at(&mut self, snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> ScalingDecision {
        let current = snapshot.active_workers;

        if let Some(remaining) = self.cooldown_remaining(now) {
            return ScalingDecision::hold(
                current,
                format!("Cooldown period ({}s remaining)", remaining.as_secs()),
                1.0,
            );
        }

        let decision = self
            .scale_up(snapshot)
            .or_else(|| self.scale_down(snapshot))
            .unwrap_or_else(|| {
                ScalingDecision::hold(
                    current,
                    "System is within optimal parameters".to_string(),
                    self.config.maintain_confidence,
                )
            });

        if decision.is_actionable() {
            self.last_action = Some(LastAction {
                action: decision.action,
                at: now,
            });
        }

        decision
    }

    /// Time left before another action may be taken, if any.
    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let last = self.last_action?;
        let cooldown = match last.action {
            ScalingAction::ScaleUp => self.config.scale_up_cooldown,
            ScalingAction::ScaleDown => self.config.scale_down_cooldown,
            ScalingAction::NoAction => return None,
        };

        // A clock that went backwards counts as no time elapsed.
        let elapsed = (now - last.at).to_std().unwrap_or_default();
        cooldown.checked_sub(elapsed).filter(|left| !left.is_zero())
    }

    fn scale_up(&self, snapshot: &MetricsSnapshot) -> Option<ScalingDecision> {
        let cfg = &self.config;
        let current = snapshot.active_workers;
        let mut reasons = Vec::new();
        let mut factors = Vec::new();

        if snapshot.queue_length > cfg.scale_up_queue_threshold {
            reasons.push(format!("High queue length ({} tasks)", snapshot.queue_length));
            factors.push(ratio(
                snapshot.queue_length as f64,
                cfg.scale_up_queue_threshold as f64,
            ));
        }
        if snapshot.worker_utilization > cfg.scale_up_utilization_threshold {
            reasons.push(format!(
                "High worker utilization ({:.1}%)",
                snapshot.worker_utilization * 100.0
            ));
            factors.push(ratio(
                snapshot.worker_utilization,
                cfg.scale_up_utilization_threshold,
            ));
        }
        if snapshot.cpu_usage > cfg.scale_up_cpu_threshold {
            reasons.push(format!("High CPU usage ({:.1}%)", snapshot.cpu_usage));
            factors.push(ratio(snapshot.cpu_usage, cfg.scale_up_cpu_threshold));
        }

        if reasons.is_empty() || current >= cfg.max_workers {
            return None;
        }

        let step = (snapshot.queue_length / cfg.queue_step_divisor.max(1)).max(1);
        let target = (current + step).min(cfg.max_workers);
        let confidence = factors.iter().sum::<f64>() / factors.len() as f64;

        let urgency = if confidence >= 0.8 {
            Urgency::High
        } else if confidence >= 0.5 {
            Urgency::Medium
        } else {
            Urgency::Low
        };

        Some(ScalingDecision {
            action: ScalingAction::ScaleUp,
            current_workers: current,
            target_workers: target,
            reason: reasons.join("; "),
            confidence,
            urgency,
        })
    }

    fn scale_down(&self, snapshot: &MetricsSnapshot) -> Option<ScalingDecision> {
        let cfg = &self.config;
        let current = snapshot.active_workers;

        let idle = snapshot.queue_length <= cfg.scale_down_queue_threshold
            && snapshot.worker_utilization < cfg.scale_down_utilization_threshold;
        if !idle || current <= cfg.min_workers {
            return None;
        }

        let threshold = cfg.scale_down_utilization_threshold;
        let confidence = ((threshold - snapshot.worker_utilization) / threshold).clamp(0.0, 1.0);

        Some(ScalingDecision {
            action: ScalingAction::ScaleDown,
            current_workers: current,
            target_workers: (current - 1).max(cfg.min_workers),
            reason: format!(
                "Low queue length ({}) and utilization ({:.1}%)",
                snapshot.queue_length,
                snapshot.worker_utilization * 100.0
            ),
            confidence,
            urgency: Urgency::Low,
        })
    }
}

/// `value / threshold`, capped at 1.0.
fn ratio(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 1.0;
    }
    (value / threshold).min(1.0)
}
