//! Command-line interface for farm-scheduler.
//!
//! Provides commands for running the service, queueing tasks, reading
//! status updates and inspecting or expiring idle queues.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
