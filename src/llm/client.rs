//! Chat completion client for a local llama.cpp server.
//!
//! The server speaks the OpenAI-compatible `/v1/chat/completions` protocol.
//! Images travel inline as base64 `data:` URIs in a content part of the first
//! user message.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LlmError;

/// Content of a chat message: plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// A message in a conversation with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender: "system", "user" or "assistant".
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// A user message carrying text followed by an image.
    pub fn user_with_image(text: impl Into<String>, image_data_uri: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_data_uri.into(),
                    },
                },
            ]),
        }
    }
}

/// Conversation history plus the image it is about, if any.
///
/// Turns are stored as text; the image is attached to the first user turn
/// when the request is built, so follow-up turns can be appended without
/// re-encoding it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<(Role, String)>,
    image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    System,
    User,
    Assistant,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an image (as a `data:` URI) to the first user turn.
    pub fn with_image(mut self, data_uri: impl Into<String>) -> Self {
        self.image = Some(data_uri.into());
        self
    }

    pub fn system(mut self, text: impl Into<String>) -> Self {
        self.turns.push((Role::System, text.into()));
        self
    }

    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.turns.push((Role::User, text.into()));
        self
    }

    pub fn assistant(mut self, text: impl Into<String>) -> Self {
        self.turns.push((Role::Assistant, text.into()));
        self
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Wire messages for this conversation.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut image = self.image.as_deref();
        self.turns
            .iter()
            .map(|(role, text)| match role {
                Role::System => Message::system(text.as_str()),
                Role::Assistant => Message::assistant(text.as_str()),
                Role::User => match image.take() {
                    Some(uri) => Message::user_with_image(text.as_str(), uri),
                    None => Message::user(text.as_str()),
                },
            })
            .collect()
    }
}

/// Sampling parameters for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
}

impl SamplingParams {
    pub const fn new(temperature: f64, top_p: f64) -> Self {
        Self { temperature, top_p }
    }
}

/// Body of a `/v1/chat/completions` request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub messages: &'a [Message],
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub stream: bool,
}

impl<'a> ChatRequest<'a> {
    pub fn new(messages: &'a [Message], max_tokens: u32, sampling: SamplingParams) -> Self {
        Self {
            messages,
            max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            stream: false,
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams::new(self.temperature, self.top_p)
    }
}

/// A chat completion endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Sends one request and returns the assistant text of the first choice.
    async fn complete(&self, request: &ChatRequest<'_>, timeout: Duration)
        -> Result<String, LlmError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Client for a llama.cpp `llama-server` instance.
#[derive(Debug, Clone)]
pub struct LlamaServerClient {
    base_url: String,
    http_client: Client,
}

impl LlamaServerClient {
    /// Creates a client for `base_url`, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(e: reqwest::Error, timeout: Duration) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(timeout)
        } else {
            LlmError::RequestFailed(e.to_string())
        }
    }
}

#[async_trait]
impl ChatBackend for LlamaServerClient {
    async fn complete(
        &self,
        request: &ChatRequest<'_>,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let http_response = self
            .http_client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, timeout))?;

        let status = http_response.status();
        let body = http_response
            .text()
            .await
            .map_err(|e| Self::map_send_error(e, timeout))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LlmError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let response: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::ParseError(format!("{e}: {}", truncate(&body, 200))))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_message_serializes_as_string() {
        let value = serde_json::to_value(Message::user("hello")).unwrap();
        assert_eq!(value, json!({"role": "user", "content": "hello"}));
    }

    #[test]
    fn test_image_message_serializes_as_parts() {
        let value =
            serde_json::to_value(Message::user_with_image("Describe.", "data:image/png;base64,AA"))
                .unwrap();
        assert_eq!(
            value,
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "Describe."},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA"}}
                ]
            })
        );
    }

    #[test]
    fn test_image_attaches_to_first_user_turn_only() {
        let conversation = Conversation::new()
            .with_image("data:image/jpeg;base64,AA")
            .user("Describe.")
            .assistant("A cat.")
            .user("Rate it.");
        let messages = conversation.to_messages();

        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0].content, MessageContent::Parts(_)));
        assert_eq!(messages[1], Message::assistant("A cat."));
        assert_eq!(messages[2], Message::user("Rate it."));
    }

    #[test]
    fn test_text_only_conversation() {
        let messages = Conversation::new().user("Estimate.").to_messages();
        assert_eq!(messages, vec![Message::user("Estimate.")]);
    }

    #[test]
    fn test_request_body() {
        let messages = vec![Message::user("hi")];
        let request = ChatRequest::new(&messages, 256, SamplingParams::new(0.3, 0.8));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["max_tokens"], 256);
        assert_eq!(value["temperature"], 0.3);
        assert_eq!(value["top_p"], 0.8);
        assert_eq!(value["stream"], false);
        assert_eq!(value["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = LlamaServerClient::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
    }
}
