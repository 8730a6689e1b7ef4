//! Fleet autoscaling.
//!
//! - **rules**: the [`ScalingEngine`], a side-effect-free decision function
//!   over a metrics snapshot, with cooldown memory
//! - **executor**: the [`FleetExecutor`] boundary and its Docker swarm
//!   implementation
//! - **manager**: the [`Autoscaler`] loop tying metrics, engine and executor
//!   together
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use filter_fleet::config::ScalingConfig;
//! use filter_fleet::scaling::{Autoscaler, SwarmExecutor};
//!
//! let autoscaler = Autoscaler::new(collector, ScalingConfig::from_env()?)?
//!     .with_executor(Arc::new(SwarmExecutor::new()?));
//!
//! let decision = autoscaler.tick().await;
//! println!("{} -> {} workers", decision.action, decision.target_workers);
//! ```

pub mod executor;
pub mod manager;
pub mod rules;

pub use executor::{ExecutorError, FleetExecutor, ResizeCommand, SwarmExecutor, DEFAULT_WORKER_ROLE};
pub use manager::{Autoscaler, AutoscalerStatus, ScalingError, ScalingEvent, ScalingMode};
pub use rules::{ScalingAction, ScalingDecision, ScalingEngine, Urgency};
