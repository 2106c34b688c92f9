//! vlm-worker: batch captioning worker for local vision-language models.
//!
//! Claims pending images from a document store, runs them through a
//! llama.cpp server it manages itself, guards generations against
//! repetition loops, and merges results back without overwriting.

pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod quality;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod storage;

// Re-export commonly used error types
pub use error::{LlmError, RegistryError, ServerError, StoreError};
