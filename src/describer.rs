use crate::error::ModelError;
use crate::llm::{LlmProvider, LlmRequest};
use crate::utils;
use base64::Engine;
use std::path::Path;
use std::sync::Arc;

const ANALYST_SYSTEM_PROMPT: &str = "You are an expert visual analyst producing detailed, accurate, \
retrieval-optimized descriptions of images. The output is used to find this image again from a text query.\n\
1. Detailed summary: describe everything visible, point by point: objects, people, scenes, activities, \
colors, positions and the relationships between them. Use at least 100 words.\n\
2. Text extraction: if text appears inside the image, add a separate section exactly as \
`Text: // extracted text here //`. If no text is visible, write `Text: // none //`.\n\
3. Factual tone: describe only what is visually identifiable, do not invent or assume.";

const DESCRIBE_PROMPT: &str = "Describe the given image in full detail.";

/// Turns an image into one free-text visual description
#[async_trait::async_trait]
pub trait Describer: Send + Sync {
    async fn describe(&self, path: &Path) -> Result<String, ModelError>;
}

/// Describer that sends the image to a multimodal chat model
pub struct LlmDescriber {
    llm: Arc<dyn LlmProvider>,
}

impl LlmDescriber {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl Describer for LlmDescriber {
    async fn describe(&self, path: &Path) -> Result<String, ModelError> {
        if !utils::is_supported_image(path) {
            return Err(ModelError::UnsupportedFormat(path.display().to_string()));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ModelError::UnsupportedFormat(format!("{}: {}", path.display(), e)))?;
        if bytes.is_empty() {
            return Err(ModelError::UnsupportedFormat(format!("{}: empty file", path.display())));
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let request = LlmRequest::new(ANALYST_SYSTEM_PROMPT, DESCRIBE_PROMPT).with_image(encoded);

        let description = self.llm.complete(&request).await?;
        tracing::debug!(path = %path.display(), chars = description.len(), "image described");
        Ok(description.trim().to_string())
    }
}
