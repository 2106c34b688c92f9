//! Inference server lifecycle.
//!
//! One [`ServerManager`] owns at most one `llama-server` process at a time.
//! Prefer [`ServerManager::with_server`], which guarantees the process is
//! stopped when the closure returns.

pub mod config;
pub mod manager;

pub use config::ServerConfig;
pub use manager::{HealthState, ServerEndpoint, ServerHandle, ServerKillSwitch, ServerManager};
