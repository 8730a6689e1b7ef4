//! Task distribution across a fleet of filter workers.
//!
//! This module provides the work-distribution half of the fleet:
//!
//! - **TaskQueue**: Store-backed FIFO of task ids with per-task status records
//! - **Worker**: Process loop that registers, heartbeats and drains the queue
//! - **Task**: Task definitions, lifecycle states and result types
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │    Redis     │◄──── heartbeats / registry
//!                      │ image_tasks  │
//!                      └──────┬───────┘
//!                             │ BRPOP
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use filter_fleet::scheduler::{TaskQueue, TaskPayload};
//! use filter_fleet::store;
//!
//! let store = store::connect("redis://localhost:6379").await?;
//! let queue = TaskQueue::new(store);
//!
//! let id = queue.enqueue(TaskPayload::new(["inspect"], ["photo.jpg"])).await?;
//! let task = queue.status(id).await?;
//! ```

pub mod queue;
pub mod task;
pub mod worker;

// Re-export main types for convenience
pub use queue::{QueueError, QueueStats, TaskQueue, DEFAULT_QUEUE_NAME, DEFAULT_RESULTS_LIST};
pub use task::{CompletedResult, ImageOutcome, Task, TaskOutcome, TaskPayload, TaskStatus};
pub use worker::{Worker, WorkerConfig, WorkerError};
