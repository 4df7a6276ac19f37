//! Text-generation backend used by the generative producer and critic.
//!
//! [`ChatClient`] talks to any OpenAI-compatible `chat/completions` endpoint.
//! Calls are never retried here; the regeneration controller owns retries.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{EvoError, Result};

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Anything that turns a request into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for an OpenAI-compatible chat endpoint.
pub struct ChatClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ChatClient {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("evoloop/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Build a client from validated generation settings.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = config.endpoint.as_deref().unwrap_or_default();
        let api_key = config.api_key.as_deref().unwrap_or_default();
        Self::new(
            endpoint,
            api_key,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }
}

#[async_trait]
impl TextGenerator for ChatClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = self.completions_url();
        debug!(model = %request.model, url = %url, "requesting completion");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EvoError::Generation(format!(
                "completion request failed with {}: {}",
                status,
                evoloop_state::head_chars(&body, 300)
            )));
        }

        let parsed: CompletionResponse = response.json().await?;
        extract_content(parsed)
    }
}

fn extract_content(response: CompletionResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| EvoError::Generation("completion contained no message content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_openai_shape() {
        let request = GenerationRequest {
            model: "writer".to_string(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            temperature: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "writer");
        assert_eq!(json["messages"][1]["role"], "user");
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn first_choice_content_is_returned() {
        let response: CompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"print(1)"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(response).unwrap(), "print(1)");
    }

    #[test]
    fn empty_choices_are_an_error() {
        let response: CompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            extract_content(response),
            Err(EvoError::Generation(_))
        ));
    }

    #[test]
    fn endpoint_trailing_slash_is_trimmed() {
        let client = ChatClient::new("https://llm.example/v1/", "k", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.completions_url(),
            "https://llm.example/v1/chat/completions"
        );
    }

    #[test]
    fn from_config_requires_complete_settings() {
        let err = ChatClient::from_config(&GenerationConfig::default()).err().unwrap();
        assert!(matches!(err, EvoError::InvalidConfig(_)));
    }
}
