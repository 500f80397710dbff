//! In-process stand-ins for the model endpoints, used by unit tests.

use crate::describer::Describer;
use crate::embeddings::EmbeddingProvider;
use crate::error::ModelError;
use crate::facets::FacetNames;
use crate::llm::{LlmProvider, LlmRequest};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// JSON object answer with one caption per facet.
pub fn facet_json(names: &FacetNames, caption: impl Fn(&str) -> String) -> String {
    let map: serde_json::Map<String, serde_json::Value> = names
        .iter()
        .map(|name| (name.to_string(), serde_json::Value::String(caption(name))))
        .collect();
    serde_json::Value::Object(map).to_string()
}

/// Describer answering from a file-name → description table.
#[derive(Default)]
pub struct MapDescriber {
    descriptions: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    pub calls: AtomicUsize,
    /// Most describe calls ever running at the same time
    pub peak: AtomicUsize,
}

impl MapDescriber {
    pub fn insert(&self, file_name: &str, description: &str) {
        self.failing.lock().unwrap().remove(file_name);
        self.descriptions
            .lock()
            .unwrap()
            .insert(file_name.to_string(), description.to_string());
    }

    pub fn fail(&self, file_name: &str) {
        self.failing.lock().unwrap().insert(file_name.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait::async_trait]
impl Describer for MapDescriber {
    async fn describe(&self, path: &Path) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.failing.lock().unwrap().contains(&name) {
            return Err(ModelError::Unreachable("captioner offline".to_string()));
        }
        self.descriptions
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| ModelError::UnsupportedFormat(name))
    }
}

type Answer = dyn Fn(&LlmRequest) -> Result<String, ModelError> + Send + Sync;

/// Chat model whose answer is computed by a closure.
pub struct FnLlm {
    answer: Box<Answer>,
    pub calls: AtomicUsize,
}

impl FnLlm {
    pub fn new(answer: impl Fn(&LlmRequest) -> Result<String, ModelError> + Send + Sync + 'static) -> Self {
        Self {
            answer: Box::new(answer),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for FnLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.answer)(request)
    }
}

/// Bag-of-words embedder over a fixed vocabulary, plus a small constant
/// component so no vector is ever zero.
pub struct KeywordEmbedder {
    vocab: Vec<String>,
    fail_on: Mutex<Option<String>>,
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(vocab: &[&str]) -> Self {
        Self {
            vocab: vocab.iter().map(|w| w.to_string()).collect(),
            fail_on: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every text containing `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn compute_embedding(&self, content: &str) -> Result<Vec<f32>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = self.fail_on.lock().unwrap().as_deref() {
            if content.contains(needle) {
                return Err(ModelError::Unreachable("embedder offline".to_string()));
            }
        }
        let lower = content.to_lowercase();
        let mut vector: Vec<f32> = self
            .vocab
            .iter()
            .map(|word| lower.matches(word.as_str()).count() as f32)
            .collect();
        vector.push(0.05);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.vocab.len() + 1
    }
}
