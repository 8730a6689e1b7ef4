//! filter-fleet: a Redis-backed fleet of image-filter workers.
//!
//! This library provides a durable task queue, a heartbeat-based worker
//! registry, live fleet metrics and a scaling decision engine with an
//! optional executor that resizes the fleet.

// Core modules
pub mod cli;
pub mod config;
pub mod filters;
pub mod metrics;
pub mod registry;
pub mod scaling;
pub mod scheduler;
pub mod store;

// Re-export commonly used error types
pub use config::ConfigError;
pub use filters::FilterError;
pub use metrics::MetricsError;
pub use registry::RegistryError;
pub use scaling::{ExecutorError, ScalingError};
pub use scheduler::{QueueError, WorkerError};
pub use store::StoreError;
