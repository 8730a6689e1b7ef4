//! Fleet metrics: live snapshots for the autoscaler and Prometheus export.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use filter_fleet::metrics::{init_metrics, export_metrics, MetricsCollector, SysinfoSampler};
//!
//! init_metrics()?;
//!
//! let collector = MetricsCollector::new(queue, registry, Arc::new(SysinfoSampler::new()));
//! let snapshot = collector.collect().await;
//!
//! // Text exposition format, ready for scraping
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod host;
pub mod prometheus;

use thiserror::Error;

use crate::registry::RegistryError;
use crate::scheduler::QueueError;

// Re-export key types for convenient access
pub use collectors::{MetricsCollector, MetricsSnapshot, DEFAULT_HISTORY_LIMIT};
pub use host::{HostSample, HostSampler, StaticSampler, SysinfoSampler};
pub use prometheus::{export_metrics, init_metrics};

/// Errors raised while collecting a snapshot.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Reading the task queue failed.
    #[error("Queue unavailable: {0}")]
    Queue(#[from] QueueError),

    /// Reading the worker registry failed.
    #[error("Registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    /// Host resources could not be read.
    #[error("Host sampling failed: {0}")]
    Host(String),

    /// The history could not be encoded.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The history export could not be written.
    #[error("Failed to write metrics export: {0}")]
    Io(#[from] std::io::Error),
}
