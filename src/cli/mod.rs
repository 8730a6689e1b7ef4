//! Command-line interface for filter-fleet.
//!
//! Provides commands for running workers and the autoscaler, submitting and
//! inspecting tasks, and housekeeping of the queue and the registry.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
