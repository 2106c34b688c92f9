//! Command-line interface for vlm-worker.
//!
//! Provides the `caption`, `age-estimate`, `ingest` and `status` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
