//! Command-line interface for activity-decoder.
//!
//! Provides the `serve` command running the scheduler, and client commands
//! submitting activities and querying a running server.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
