use crate::embeddings::EmbeddingProvider;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Text Embeddings Inference (TEI) provider from Hugging Face
pub struct TeiEmbeddingProvider {
    base_url: String,
    dimension: AtomicUsize,
    timeout: Duration,
    client: reqwest::Client,
}

impl TeiEmbeddingProvider {
    /// Create a new TEI embedding provider
    /// Default URL: http://127.0.0.1:8080
    pub fn new(base_url: Option<&str>, dimension: Option<usize>, timeout: Duration) -> Self {
        Self {
            base_url: base_url
                .unwrap_or("http://127.0.0.1:8080")
                .trim_end_matches('/')
                .to_string(),
            dimension: AtomicUsize::new(dimension.unwrap_or(1024)),
            timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct TeiEmbeddingRequest {
    inputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    truncate: Option<bool>,
}

// TEI answers `/embed` with one array per input.
#[derive(Deserialize)]
#[serde(transparent)]
struct TeiEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for TeiEmbeddingProvider {
    async fn compute_embedding(&self, content: &str) -> Result<Vec<f32>, ModelError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ModelError::EmptyInput(
                "cannot generate embedding for empty content".to_string(),
            ));
        }

        let url = format!("{}/embed", self.base_url);

        let request = TeiEmbeddingRequest {
            inputs: vec![content.to_string()],
            truncate: Some(true),
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
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::Unreachable(format!(
                "TEI API returned error {}: {}",
                status, error_text
            )));
        }

        let embedding_response: TeiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        let Some(embedding) = embedding_response.embeddings.into_iter().next() else {
            return Err(ModelError::Unreachable("TEI returned empty embeddings array".to_string()));
        };
        if embedding.is_empty() {
            return Err(ModelError::Unreachable("TEI returned an empty embedding".to_string()));
        }

        let actual_dimension = embedding.len();
        let expected_dimension = self.dimension.load(Ordering::Relaxed);
        if actual_dimension != expected_dimension {
            tracing::info!(
                actual_dimension,
                expected_dimension,
                "TEI embedding dimension differs from expected, updating"
            );
            self.dimension.store(actual_dimension, Ordering::Relaxed);
        }

        Ok(embedding)
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
    fn test_tei_embedding_provider_creation() {
        let provider = TeiEmbeddingProvider::new(None, None, TIMEOUT);
        assert_eq!(provider.base_url, "http://127.0.0.1:8080");
        assert_eq!(provider.dimension(), 1024);
    }

    #[test]
    fn test_tei_embedding_provider_with_explicit_dims() {
        let provider = TeiEmbeddingProvider::new(Some("http://localhost:8081/"), Some(2048), TIMEOUT);
        assert_eq!(provider.base_url, "http://localhost:8081");
        assert_eq!(provider.dimension(), 2048);
    }

    #[test]
    fn test_tei_response_shape() {
        let parsed: TeiEmbeddingResponse = serde_json::from_str("[[0.1, 0.2], [0.3, 0.4]]").unwrap();
        assert_eq!(parsed.embeddings.len(), 2);
        assert_eq!(parsed.embeddings[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_without_request() {
        let provider = TeiEmbeddingProvider::new(Some("http://127.0.0.1:9"), None, TIMEOUT);
        assert!(matches!(
            provider.compute_embedding("").await,
            Err(ModelError::EmptyInput(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires TEI server running
    async fn test_tei_embedding_provider_compute() {
        let provider = TeiEmbeddingProvider::new(None, None, TIMEOUT);
        let embedding = provider.compute_embedding("test content").await.unwrap();
        assert!(!embedding.is_empty());
    }
}
