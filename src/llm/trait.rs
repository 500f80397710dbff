use crate::error::ModelError;

/// A single prompt round-trip against a chat model.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    /// Base64-encoded images attached to the user message
    pub images: Vec<String>,
    /// Ask the model to answer with a JSON document
    pub json: bool,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, base64_image: String) -> Self {
        self.images.push(base64_image);
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Trait for chat-style LLM providers used for captioning and facet expansion
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send the request and return the model's text answer
    async fn complete(&self, request: &LlmRequest) -> Result<String, ModelError>;
}
