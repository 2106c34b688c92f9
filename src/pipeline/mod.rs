//! Batch runs over the work backlog.
//!
//! - [`BatchDriver`]: selects items, drives generation and persists results
//! - [`WorkerConfig`]: layered run configuration
//! - [`BackfillSelection`]: client-side candidate filtering for backfill stages
//! - [`ShutdownSignal`]: cooperative stop between items
//! - `parse`: moderation rating and age estimation parsers

pub mod candidates;
pub mod config;
pub mod driver;
pub mod parse;
pub mod shutdown;

pub use candidates::{BackfillSelection, CandidatePage, OVER_FETCH_FACTOR};
pub use config::{ConfigError, WorkerConfig};
pub use driver::{ingest, load_prompts, BatchDriver, DriverError, DriverOptions, IngestStats, RunStats};
pub use parse::{main_character_age, parse_age_estimation, parse_moderation_rating, AgeEstimationError};
pub use shutdown::ShutdownSignal;
