//! Fleet and scaling configuration.
//!
//! This module provides the settings shared by workers, the monitor and the
//! CLI: where the store lives, registry timings, and the thresholds the
//! scaling engine applies. Both structs follow the same pattern: `Default`
//! values, `from_env()` overrides, `validate()`, and `with_*` builders.

use std::time::Duration;
use thiserror::Error;

use crate::registry::{DEFAULT_CLEANUP_AGE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_WORKER_TIMEOUT};
use crate::scheduler::queue::DEFAULT_QUEUE_NAME;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Default store URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Settings shared by every fleet component.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Store URL (`redis://…` or `memory://`).
    pub redis_url: String,
    /// Name of the pending-task list.
    pub queue_name: String,
    /// Heartbeat age after which a worker is inactive.
    pub worker_timeout: Duration,
    /// Interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a worker record is purged.
    pub cleanup_age: Duration,
    /// Age after which finished tasks are swept.
    pub task_retention: Duration,
    /// How long a worker blocks on an empty queue.
    pub dequeue_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cleanup_age: DEFAULT_CLEANUP_AGE,
            task_retention: Duration::from_secs(24 * 3600),
            dequeue_timeout: Duration::from_secs(5),
        }
    }
}

impl FleetConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `REDIS_URL`: Store URL; otherwise built from `REDIS_HOST` / `REDIS_PORT`
    /// - `QUEUE_NAME`: Pending-task list (default: image_tasks)
    /// - `WORKER_TIMEOUT_SECS`: Liveness timeout (default: 90)
    /// - `HEARTBEAT_INTERVAL_SECS`: Heartbeat interval (default: 30)
    /// - `WORKER_CLEANUP_SECS`: Purge age for dead workers (default: 300)
    /// - `TASK_RETENTION_SECS`: Age at which finished tasks are swept (default: 86400)
    /// - `DEQUEUE_TIMEOUT_SECS`: Blocking dequeue timeout (default: 5)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        } else if let Some(host) = lookup("REDIS_HOST") {
            let port: u16 = match lookup("REDIS_PORT") {
                Some(val) => parse_env_value(&val, "REDIS_PORT")?,
                None => 6379,
            };
            config.redis_url = format!("redis://{}:{}", host, port);
        }

        if let Some(val) = lookup("QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Some(val) = lookup("WORKER_TIMEOUT_SECS") {
            config.worker_timeout = parse_env_secs(&val, "WORKER_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = parse_env_secs(&val, "HEARTBEAT_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("WORKER_CLEANUP_SECS") {
            config.cleanup_age = parse_env_secs(&val, "WORKER_CLEANUP_SECS")?;
        }

        if let Some(val) = lookup("TASK_RETENTION_SECS") {
            config.task_retention = parse_env_secs(&val, "TASK_RETENTION_SECS")?;
        }

        if let Some(val) = lookup("DEQUEUE_TIMEOUT_SECS") {
            config.dequeue_timeout = parse_env_secs(&val, "DEQUEUE_TIMEOUT_SECS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval >= self.worker_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "heartbeat_interval ({:?}) must be shorter than worker_timeout ({:?})",
                self.heartbeat_interval, self.worker_timeout
            )));
        }

        if self.cleanup_age < self.worker_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "cleanup_age ({:?}) cannot be shorter than worker_timeout ({:?})",
                self.cleanup_age, self.worker_timeout
            )));
        }

        if self.dequeue_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dequeue_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the store URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the liveness timeout.
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the purge age for dead workers.
    pub fn with_cleanup_age(mut self, age: Duration) -> Self {
        self.cleanup_age = age;
        self
    }

    /// Sets the retention of finished tasks.
    pub fn with_task_retention(mut self, retention: Duration) -> Self {
        self.task_retention = retention;
        self
    }

    /// Sets the blocking dequeue timeout.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }
}

/// Thresholds and limits applied by the scaling engine.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScalingConfig {
    /// Fewest workers the engine will recommend.
    pub min_workers: usize,
    /// Most workers the engine will recommend.
    pub max_workers: usize,
    /// Scale up when the queue is longer than this.
    pub scale_up_queue_threshold: usize,
    /// Scale up when utilization exceeds this fraction.
    pub scale_up_utilization_threshold: f64,
    /// Scale up when CPU usage exceeds this percentage.
    pub scale_up_cpu_threshold: f64,
    /// Queue length per extra worker when scaling up.
    pub queue_step_divisor: usize,
    /// Scale down only when the queue is at most this long.
    pub scale_down_queue_threshold: usize,
    /// Scale down only when utilization is below this fraction.
    pub scale_down_utilization_threshold: f64,
    /// Minimum time after a scale-up before the next scaling action.
    #[serde(with = "duration_secs")]
    pub scale_up_cooldown: Duration,
    /// Minimum time after a scale-down before the next scaling action.
    #[serde(with = "duration_secs")]
    pub scale_down_cooldown: Duration,
    /// Confidence reported with "maintain" decisions.
    pub maintain_confidence: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_queue_threshold: 3,
            scale_up_utilization_threshold: 0.5,
            scale_up_cpu_threshold: 50.0,
            queue_step_divisor: 5,
            scale_down_queue_threshold: 1,
            scale_down_utilization_threshold: 0.2,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(180),
            maintain_confidence: 0.8,
        }
    }
}

impl ScalingConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SCALING_MIN_WORKERS` (default: 1)
    /// - `SCALING_MAX_WORKERS` (default: 10)
    /// - `SCALING_UP_QUEUE_THRESHOLD` (default: 3)
    /// - `SCALING_UP_UTILIZATION` (default: 0.5)
    /// - `SCALING_UP_CPU` (default: 50)
    /// - `SCALING_DOWN_QUEUE_THRESHOLD` (default: 1)
    /// - `SCALING_DOWN_UTILIZATION` (default: 0.2)
    /// - `SCALING_UP_COOLDOWN_SECS` (default: 60)
    /// - `SCALING_DOWN_COOLDOWN_SECS` (default: 180)
    /// - `FLEET_SCALE_STEP_DIVISOR`: queued tasks per extra worker (default: 5)
    /// - `FLEET_MAINTAIN_CONFIDENCE`: confidence of hold decisions (default: 0.8)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("SCALING_MIN_WORKERS") {
            config.min_workers = parse_env_value(&val, "SCALING_MIN_WORKERS")?;
        }

        if let Some(val) = lookup("SCALING_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "SCALING_MAX_WORKERS")?;
        }

        if let Some(val) = lookup("SCALING_UP_QUEUE_THRESHOLD") {
            config.scale_up_queue_threshold = parse_env_value(&val, "SCALING_UP_QUEUE_THRESHOLD")?;
        }

        if let Some(val) = lookup("SCALING_UP_UTILIZATION") {
            config.scale_up_utilization_threshold =
                parse_env_value(&val, "SCALING_UP_UTILIZATION")?;
        }

        if let Some(val) = lookup("SCALING_UP_CPU") {
            config.scale_up_cpu_threshold = parse_env_value(&val, "SCALING_UP_CPU")?;
        }

        if let Some(val) = lookup("SCALING_DOWN_QUEUE_THRESHOLD") {
            config.scale_down_queue_threshold =
                parse_env_value(&val, "SCALING_DOWN_QUEUE_THRESHOLD")?;
        }

        if let Some(val) = lookup("SCALING_DOWN_UTILIZATION") {
            config.scale_down_utilization_threshold =
                parse_env_value(&val, "SCALING_DOWN_UTILIZATION")?;
        }

        if let Some(val) = lookup("SCALING_UP_COOLDOWN_SECS") {
            config.scale_up_cooldown = parse_env_secs(&val, "SCALING_UP_COOLDOWN_SECS")?;
        }

        if let Some(val) = lookup("SCALING_DOWN_COOLDOWN_SECS") {
            config.scale_down_cooldown = parse_env_secs(&val, "SCALING_DOWN_COOLDOWN_SECS")?;
        }

        if let Some(val) = lookup("FLEET_SCALE_STEP_DIVISOR") {
            config.queue_step_divisor = parse_env_value(&val, "FLEET_SCALE_STEP_DIVISOR")?;
        }

        if let Some(val) = lookup("FLEET_MAINTAIN_CONFIDENCE") {
            config.maintain_confidence = parse_env_value(&val, "FLEET_MAINTAIN_CONFIDENCE")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.queue_step_divisor == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_step_divisor must be greater than 0".to_string(),
            ));
        }

        check_fraction(
            "scale_up_utilization_threshold",
            self.scale_up_utilization_threshold,
        )?;
        check_fraction(
            "scale_down_utilization_threshold",
            self.scale_down_utilization_threshold,
        )?;

        // Also rejects NaN.
        if !(0.0..=1.0).contains(&self.maintain_confidence) {
            return Err(ConfigError::ValidationFailed(format!(
                "maintain_confidence must be in [0.0, 1.0], got {}",
                self.maintain_confidence
            )));
        }

        if !(self.scale_up_cpu_threshold > 0.0 && self.scale_up_cpu_threshold <= 100.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "scale_up_cpu_threshold must be in (0, 100], got {}",
                self.scale_up_cpu_threshold
            )));
        }

        if self.scale_up_queue_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "scale_up_queue_threshold must be greater than 0".to_string(),
            ));
        }

        if self.scale_down_utilization_threshold >= self.scale_up_utilization_threshold {
            return Err(ConfigError::ValidationFailed(format!(
                "scale_down_utilization_threshold ({}) must be below scale_up_utilization_threshold ({})",
                self.scale_down_utilization_threshold, self.scale_up_utilization_threshold
            )));
        }

        Ok(())
    }

    /// Sets the worker bounds.
    pub fn with_bounds(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    /// Sets the scale-up thresholds.
    pub fn with_scale_up_thresholds(mut self, queue: usize, utilization: f64, cpu: f64) -> Self {
        self.scale_up_queue_threshold = queue;
        self.scale_up_utilization_threshold = utilization;
        self.scale_up_cpu_threshold = cpu;
        self
    }

    /// Sets the scale-down thresholds.
    pub fn with_scale_down_thresholds(mut self, queue: usize, utilization: f64) -> Self {
        self.scale_down_queue_threshold = queue;
        self.scale_down_utilization_threshold = utilization;
        self
    }

    /// Sets both cooldowns.
    pub fn with_cooldowns(mut self, scale_up: Duration, scale_down: Duration) -> Self {
        self.scale_up_cooldown = scale_up;
        self.scale_down_cooldown = scale_down;
        self
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

/// Helper function to parse environment variable values.
pub(crate) fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn check_fraction(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(format!(
            "{} must be in (0.0, 1.0], got {}",
            name, value
        )))
    }
}

fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse_env_value(value, key)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a non-negative number of seconds, got '{}'", value),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_fleet_config() {
        let config = FleetConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.queue_name, "image_tasks");
        assert_eq!(config.worker_timeout, Duration::from_secs(90));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.cleanup_age, Duration::from_secs(300));
        assert_eq!(config.dequeue_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fleet_config_from_lookup() {
        let config = FleetConfig::from_lookup(env(&[
            ("REDIS_HOST", "redis"),
            ("REDIS_PORT", "6380"),
            ("QUEUE_NAME", "thumbnails"),
            ("HEARTBEAT_INTERVAL_SECS", "10"),
            ("DEQUEUE_TIMEOUT_SECS", "0.5"),
        ]))
        .expect("config");

        assert_eq!(config.redis_url, "redis://redis:6380");
        assert_eq!(config.queue_name, "thumbnails");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.dequeue_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_redis_url_wins_over_host() {
        let config = FleetConfig::from_lookup(env(&[
            ("REDIS_URL", "memory://"),
            ("REDIS_HOST", "ignored"),
        ]))
        .expect("config");
        assert_eq!(config.redis_url, "memory://");
    }

    #[test]
    fn test_fleet_config_invalid_values() {
        let err = FleetConfig::from_lookup(env(&[("REDIS_HOST", "r"), ("REDIS_PORT", "abc")]))
            .expect_err("bad port");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "REDIS_PORT"));

        let err = FleetConfig::from_lookup(env(&[("WORKER_TIMEOUT_SECS", "-4")]))
            .expect_err("negative");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = FleetConfig::from_lookup(env(&[("HEARTBEAT_INTERVAL_SECS", "120")]))
            .expect_err("heartbeat slower than timeout");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_fleet_config_builder() {
        let config = FleetConfig::new()
            .with_redis_url("memory://")
            .with_queue_name("q")
            .with_worker_timeout(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::from_secs(2))
            .with_cleanup_age(Duration::from_secs(20))
            .with_task_retention(Duration::from_secs(60))
            .with_dequeue_timeout(Duration::from_millis(100));

        assert_eq!(config.queue_name, "q");
        assert_eq!(config.task_retention, Duration::from_secs(60));
        assert!(config.validate().is_ok());

        let invalid = config.with_cleanup_age(Duration::from_secs(1));
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_default_scaling_config() {
        let config = ScalingConfig::default();
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.scale_up_queue_threshold, 3);
        assert!((config.scale_up_utilization_threshold - 0.5).abs() < f64::EPSILON);
        assert!((config.scale_up_cpu_threshold - 50.0).abs() < f64::EPSILON);
        assert_eq!(config.scale_up_cooldown, Duration::from_secs(60));
        assert_eq!(config.scale_down_cooldown, Duration::from_secs(180));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scaling_config_from_lookup() {
        let config = ScalingConfig::from_lookup(env(&[
            ("SCALING_MIN_WORKERS", "2"),
            ("SCALING_MAX_WORKERS", "20"),
            ("SCALING_UP_COOLDOWN_SECS", "30"),
        ]))
        .expect("config");
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 20);
        assert_eq!(config.scale_up_cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_scaling_step_and_maintain_confidence_from_lookup() {
        let config = ScalingConfig::from_lookup(env(&[
            ("FLEET_SCALE_STEP_DIVISOR", "2"),
            ("FLEET_MAINTAIN_CONFIDENCE", "0.6"),
        ]))
        .expect("config");
        assert_eq!(config.queue_step_divisor, 2);
        assert!((config.maintain_confidence - 0.6).abs() < f64::EPSILON);

        let err = ScalingConfig::from_lookup(env(&[("FLEET_SCALE_STEP_DIVISOR", "0")]))
            .expect_err("zero divisor");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        let err = ScalingConfig::from_lookup(env(&[("FLEET_SCALE_STEP_DIVISOR", "-1")]))
            .expect_err("negative divisor");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "FLEET_SCALE_STEP_DIVISOR"));

        let err = ScalingConfig::from_lookup(env(&[("FLEET_MAINTAIN_CONFIDENCE", "1.5")]))
            .expect_err("confidence above one");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        let err = ScalingConfig::from_lookup(env(&[("FLEET_MAINTAIN_CONFIDENCE", "NaN")]))
            .expect_err("nan");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_scaling_config_validation() {
        assert!(ScalingConfig::new().with_bounds(5, 2).validate().is_err());
        assert!(ScalingConfig::new().with_bounds(0, 0).validate().is_err());
        assert!(ScalingConfig::new()
            .with_scale_up_thresholds(3, 1.5, 50.0)
            .validate()
            .is_err());
        assert!(ScalingConfig::new()
            .with_scale_up_thresholds(3, 0.5, 0.0)
            .validate()
            .is_err());
        assert!(ScalingConfig::new()
            .with_scale_down_thresholds(1, 0.6)
            .validate()
            .is_err());

        let mut config = ScalingConfig::new();
        config.queue_step_divisor = 0;
        assert!(config.validate().is_err());
    }
}
