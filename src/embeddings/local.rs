use crate::embeddings::EmbeddingProvider;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Local embedding provider using Ollama API
pub struct LocalEmbeddingProvider {
    base_url: String,
    model: String,
    dimension: AtomicUsize, // Updated at runtime when the model reports a different size
    timeout: Duration,
    client: reqwest::Client,
}

impl LocalEmbeddingProvider {
    /// Determine embedding dimension from model name
    pub(crate) fn get_dimension_for_model(model: &str) -> usize {
        match model {
            m if m.contains("qwen3-embedding:0.6b") => 1024,
            m if m.contains("qwen3-embedding:8b") => 4096,
            m if m.contains("qwen3-embedding") => 2560,
            m if m.contains("mxbai-embed") => 1024,
            m if m.contains("nomic-embed") => 768,
            _ => 768,
        }
    }

    /// Create a new local embedding provider using Ollama
    /// Uses provided dimension, or auto-detects from model name if not provided
    pub fn new(
        base_url: Option<&str>,
        model: Option<&str>,
        dimension: Option<usize>,
        timeout: Duration,
    ) -> Self {
        let model_name = model.unwrap_or("qwen3-embedding:4b").to_string();
        let dimension = dimension.unwrap_or_else(|| Self::get_dimension_for_model(&model_name));

        Self {
            base_url: base_url
                .unwrap_or("http://127.0.0.1:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model_name,
            dimension: AtomicUsize::new(dimension),
            timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn compute_embedding(&self, content: &str) -> Result<Vec<f32>, ModelError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ModelError::EmptyInput(
                "cannot generate embedding for empty content".to_string(),
            ));
        }

        let url = format!("{}/api/embeddings", self.base_url);

        let request = OllamaEmbeddingRequest {
            model: self.model.clone(),
            prompt: content.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(ModelError::Unreachable(format!(
                "Ollama API returned error: {}",
                response.status()
            )));
        }

        let embedding_response: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        if embedding_response.embedding.is_empty() {
            return Err(ModelError::Unreachable(
                "Ollama returned an empty embedding".to_string(),
            ));
        }

        let actual_dimension = embedding_response.embedding.len();
        let expected_dimension = self.dimension.load(Ordering::Relaxed);
        if actual_dimension != expected_dimension {
            tracing::info!(
                model = %self.model,
                actual_dimension,
                expected_dimension,
                "embedding dimension differs from expected, updating"
            );
            self.dimension.store(actual_dimension, Ordering::Relaxed);
        }

        Ok(embedding_response.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_local_embedding_provider_creation() {
        let provider = LocalEmbeddingProvider::new(None, None, None, TIMEOUT);
        assert_eq!(provider.base_url, "http://127.0.0.1:11434");
        assert_eq!(provider.model, "qwen3-embedding:4b");
        assert_eq!(provider.dimension(), 2560);
    }

    #[test]
    fn test_local_embedding_provider_with_explicit_dims() {
        let provider = LocalEmbeddingProvider::new(None, Some("custom-model"), Some(1024), TIMEOUT);
        assert_eq!(provider.model, "custom-model");
        assert_eq!(provider.dimension(), 1024);
    }

    #[test]
    fn test_get_dimension_for_model() {
        assert_eq!(LocalEmbeddingProvider::get_dimension_for_model("qwen3-embedding:8b"), 4096);
        assert_eq!(LocalEmbeddingProvider::get_dimension_for_model("qwen3-embedding:0.6b"), 1024);
        assert_eq!(LocalEmbeddingProvider::get_dimension_for_model("mxbai-embed-large"), 1024);
        assert_eq!(LocalEmbeddingProvider::get_dimension_for_model("nomic-embed-text"), 768);
        assert_eq!(LocalEmbeddingProvider::get_dimension_for_model("unknown-model"), 768);
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_without_request() {
        let provider = LocalEmbeddingProvider::new(Some("http://127.0.0.1:9"), None, None, TIMEOUT);
        assert!(matches!(
            provider.compute_embedding("   ").await,
            Err(ModelError::EmptyInput(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires Ollama server running
    async fn test_local_embedding_provider_compute() {
        let provider = LocalEmbeddingProvider::new(None, Some("nomic-embed-text"), None, TIMEOUT);
        let embedding = provider.compute_embedding("test content").await.unwrap();
        assert_eq!(embedding.len(), 768);
        assert!(!embedding.iter().all(|&x| x == 0.0));
    }
}
