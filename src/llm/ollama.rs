use crate::error::ModelError;
use crate::llm::{LlmProvider, LlmRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat provider backed by an Ollama server (`/api/chat`)
pub struct OllamaLlmProvider {
    base_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaLlmProvider {
    /// Create a new provider for `model`
    /// Default URL: http://127.0.0.1:11434
    pub fn new(base_url: Option<&str>, model: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .unwrap_or("http://127.0.0.1:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait::async_trait]
impl LlmProvider for OllamaLlmProvider {
    async fn complete(&self, request: &LlmRequest) -> Result<String, ModelError> {
        let url = format!("{}/api/chat", self.base_url);

        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
                images: &[],
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
            images: &request.images,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format: request.json.then_some("json"),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::Unreachable(format!(
                "Ollama chat API returned error {}: {}",
                status, error_text
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        tracing::debug!(model = %self.model, chars = chat.message.content.len(), "chat completion received");
        Ok(chat.message.content)
    }
}
