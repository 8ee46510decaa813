//! Multimodal completion client for the Anthropic Messages API.
//!
//! The pipeline only ever needs one call shape: a conversation whose user
//! turns may carry base64 images. [`ModelClient`] is the seam the pipeline is
//! written against; [`AnthropicClient`] is the HTTP implementation and
//! [`ModelProvider`] builds one per caller credential.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("model overloaded: {0}")]
    Overloaded(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl ModelError {
    /// Overload, rate limit and any 5xx are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Overloaded(_) | Self::RateLimited(_) | Self::Server { .. }
        )
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = provider_error_message(body).unwrap_or_else(|| body.trim().to_string());
        if provider_error_type(body).as_deref() == Some("overloaded_error") {
            return Self::Overloaded(message);
        }
        match status {
            401 | 403 => Self::Authentication(message),
            400 | 404 | 413 | 422 => Self::InvalidRequest(message),
            429 => Self::RateLimited(message),
            529 => Self::Overloaded(message),
            500..=599 => Self::Server { status, message },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {message}")),
        }
    }

    /// Text shown to the caller through the task's `message` field.
    pub fn user_message(&self) -> String {
        match self {
            Self::Authentication(_) => {
                "Authentication with the model provider failed. Check your API key.".to_string()
            }
            Self::InvalidRequest(detail) => {
                format!("The model provider rejected the request: {detail}")
            }
            Self::RateLimited(_) => {
                "The model provider rate limit was exceeded. Wait a moment and try again."
                    .to_string()
            }
            Self::Overloaded(_) => {
                "The model service is temporarily overloaded. Please try again later.".to_string()
            }
            Self::Server { status, .. } => {
                format!("The model service returned a server error ({status}).")
            }
            Self::Network(_) => "Could not reach the model service.".to_string(),
            Self::Parse(_) => "The model service returned an unreadable response.".to_string(),
        }
    }
}

fn provider_error_type(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"]["type"].as_str().map(str::to_string)
}

fn provider_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"]["message"].as_str().map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type: media_type.into(),
                data: STANDARD.encode(bytes),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    #[cfg(test)]
    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|block| matches!(block, ContentBlock::Image { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

/// Builds a client bound to the credential a caller supplied with its request.
pub trait ModelProvider: Send + Sync {
    fn client(&self, api_key: &str) -> Arc<dyn ModelClient>;
}

#[derive(Clone)]
pub struct AnthropicClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(http_client: Client, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let start = std::time::Instant::now();

        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Model request failed");
                ModelError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Model API error");
            return Err(ModelError::from_status(status.as_u16(), &error_text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Parse(e.to_string()))?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return Err(ModelError::Parse("response contained no text".into()));
        }

        debug!(
            model = %request.model,
            turns = request.messages.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Model completion"
        );

        Ok(text)
    }
}

pub struct AnthropicProvider {
    http_client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }
}

impl ModelProvider for AnthropicProvider {
    fn client(&self, api_key: &str) -> Arc<dyn ModelClient> {
        Arc::new(AnthropicClient::new(
            self.http_client.clone(),
            api_key,
            self.base_url.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_classes() {
        assert!(matches!(
            ModelError::from_status(401, "{}"),
            ModelError::Authentication(_)
        ));
        assert!(matches!(
            ModelError::from_status(400, "bad"),
            ModelError::InvalidRequest(_)
        ));
        assert!(matches!(
            ModelError::from_status(429, ""),
            ModelError::RateLimited(_)
        ));
        assert!(matches!(
            ModelError::from_status(529, ""),
            ModelError::Overloaded(_)
        ));
        assert!(matches!(
            ModelError::from_status(503, ""),
            ModelError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn overloaded_error_type_wins_over_status() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        match ModelError::from_status(500, body) {
            ModelError::Overloaded(message) => assert_eq!(message, "Overloaded"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ModelError::Overloaded(String::new()).is_retryable());
        assert!(ModelError::RateLimited(String::new()).is_retryable());
        assert!(ModelError::Server {
            status: 500,
            message: String::new()
        }
        .is_retryable());
        assert!(!ModelError::Authentication(String::new()).is_retryable());
        assert!(!ModelError::InvalidRequest(String::new()).is_retryable());
        assert!(!ModelError::Network(String::new()).is_retryable());
    }

    #[test]
    fn each_error_class_has_its_own_message() {
        let messages = [
            ModelError::Authentication(String::new()).user_message(),
            ModelError::InvalidRequest("x".into()).user_message(),
            ModelError::RateLimited(String::new()).user_message(),
            ModelError::Overloaded(String::new()).user_message(),
            ModelError::Server {
                status: 500,
                message: String::new(),
            }
            .user_message(),
        ];
        for (i, a) in messages.iter().enumerate() {
            for b in &messages[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn image_blocks_serialize_as_base64_sources() {
        let message = Message::user(vec![
            ContentBlock::image("image/png", b"abc"),
            ContentBlock::text("describe"),
        ]);
        let json = serde_json::to_value(&message).expect("serialize");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "image");
        assert_eq!(json["content"][0]["source"]["type"], "base64");
        assert_eq!(json["content"][0]["source"]["media_type"], "image/png");
        assert_eq!(json["content"][0]["source"]["data"], "YWJj");
        assert_eq!(json["content"][1]["text"], "describe");
        assert_eq!(message.image_count(), 1);
    }
}
