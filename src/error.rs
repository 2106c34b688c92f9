//! Error types for vlm-worker operations.
//!
//! Each subsystem gets its own error enum:
//! - Inference server process lifecycle
//! - Chat completion transport
//! - Document and asset storage
//! - Model registry lookups

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while starting, probing or stopping the inference server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("An inference server is already running for this manager (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Failed to spawn '{binary}': {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned process has no pid (already reaped)")]
    MissingPid,

    #[error("Inference server did not become ready within {timeout:?}")]
    NotReady { timeout: Duration },

    #[error("Failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Model error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while talking to the chat completion endpoint.
///
/// Every variant is treated as a transport failure by the retry engine:
/// the call is abandoned instead of retried.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    /// A successful reply without any text. Callers skip the item.
    #[error("Response contained no text")]
    EmptyResponse,

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the document store and asset store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store stayed contended after {attempts} attempts: {message}")]
    ContentionExhausted { attempts: u32, message: String },

    #[error("Work item '{0}' not found")]
    NotFound(String),

    #[error("Invalid status '{0}'")]
    InvalidStatus(String),

    #[error("Invalid model key '{0}': only ASCII letters, digits, '-' and '_' are allowed")]
    InvalidModelKey(String),

    #[error("Invalid asset key '{0}'")]
    InvalidAssetKey(String),

    #[error("Asset '{key}' could not be read: {source}")]
    AssetUnavailable {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from model registry lookups.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Model '{model}' requires a vision projector")]
    NotMultimodal { model: String },

    #[error("Model file for '{model}' not found at {path}")]
    MissingModelFile { model: String, path: PathBuf },
}
