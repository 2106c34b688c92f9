//! Chat completions against a local inference server.
//!
//! [`LlamaServerClient`] speaks the OpenAI-compatible protocol of
//! `llama-server`. [`RetryingGenerator`] wraps any [`ChatBackend`] and retries
//! replies that fall into repetition loops.
//!
//! ```ignore
//! use std::sync::Arc;
//! use vlm_worker::llm::{CallProfile, Conversation, LlamaServerClient, RetryingGenerator};
//!
//! let client = LlamaServerClient::new("http://127.0.0.1:8080")?;
//! let generator = RetryingGenerator::new(Arc::new(client));
//! let conversation = Conversation::new().with_image(data_uri).user("Describe this image.");
//! let caption = generator.generate(&conversation, &CallProfile::image_chat()).await?;
//! ```

pub mod client;
pub mod retry;

pub use client::{
    ChatBackend, ChatRequest, ContentPart, Conversation, ImageUrl, LlamaServerClient, Message,
    MessageContent, SamplingParams,
};
pub use retry::{
    decide, AttemptOutcome, CallProfile, Generation, RetryDecision, RetryingGenerator,
    SamplingSchedule, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_PAUSE,
};
