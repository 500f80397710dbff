#![allow(dead_code)]

use imgfacet::embeddings::EmbeddingProvider;
use imgfacet::llm::{LlmProvider, LlmRequest};
use imgfacet::{
    Describer, FacetGenerator, FacetNames, IndexingPipeline, ModelError, PipelineOptions, SearchAggregator,
    SearchOptions, VectorIndex,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Describes an image by looking its file name up in a table.
#[derive(Default)]
pub struct TableDescriber {
    pub descriptions: Mutex<HashMap<String, String>>,
    pub calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Describer for TableDescriber {
    async fn describe(&self, path: &Path) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        self.descriptions
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| ModelError::Unreachable(format!("no description for {}", name)))
    }
}

/// Facet expansion: explicit captions per (description, facet), otherwise
/// "<facet> <description>".
pub struct CaptionTable {
    names: FacetNames,
    overrides: Mutex<HashMap<(String, String), String>>,
}

impl CaptionTable {
    pub fn new(names: FacetNames) -> Self {
        Self {
            names,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, description: &str, facet: &str, caption: &str) {
        self.overrides
            .lock()
            .unwrap()
            .insert((description.to_string(), facet.to_string()), caption.to_string());
    }
}

#[async_trait::async_trait]
impl LlmProvider for CaptionTable {
    async fn complete(&self, request: &LlmRequest) -> Result<String, ModelError> {
        let description = request.prompt.lines().last().unwrap_or_default().to_string();
        let overrides = self.overrides.lock().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = self
            .names
            .iter()
            .map(|facet| {
                let caption = overrides
                    .get(&(description.clone(), facet.to_string()))
                    .cloned()
                    .unwrap_or_else(|| format!("{} {}", facet, description));
                (facet.to_string(), serde_json::Value::String(caption))
            })
            .collect();
        Ok(serde_json::Value::Object(map).to_string())
    }
}

/// Word-count vectors over a fixed vocabulary plus a constant component.
pub struct VocabularyEmbedder {
    vocab: Vec<&'static str>,
}

impl VocabularyEmbedder {
    pub fn new(vocab: &[&'static str]) -> Self {
        Self { vocab: vocab.to_vec() }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn compute_embedding(&self, content: &str) -> Result<Vec<f32>, ModelError> {
        let lower = content.to_lowercase();
        let mut vector: Vec<f32> = self.vocab.iter().map(|w| lower.matches(w).count() as f32).collect();
        vector.push(0.05);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.vocab.len() + 1
    }
}

pub const VOCAB: &[&str] = &["lighthouse", "pier", "boat", "cat", "forest", "sofa", "sunset"];

pub struct Setup {
    pub index: Arc<VectorIndex>,
    pub describer: Arc<TableDescriber>,
    pub captions: Arc<CaptionTable>,
    pub embedder: Arc<VocabularyEmbedder>,
    pub pipeline: Arc<IndexingPipeline>,
    pub search: SearchAggregator,
}

pub fn setup(store: &Path) -> Setup {
    let names = FacetNames::default();
    let index = Arc::new(VectorIndex::load_or_create(store, names.clone()).unwrap());
    let describer = Arc::new(TableDescriber::default());
    let captions = Arc::new(CaptionTable::new(names.clone()));
    let embedder = Arc::new(VocabularyEmbedder::new(VOCAB));
    let pipeline = Arc::new(
        IndexingPipeline::new(
            describer.clone(),
            FacetGenerator::new(captions.clone(), names),
            embedder.clone(),
            index.clone(),
            PipelineOptions {
                model_timeout: Duration::from_secs(10),
                workers: 3,
            },
        )
        .unwrap(),
    );
    let search = SearchAggregator::new(index.clone(), embedder.clone(), SearchOptions::default());
    Setup {
        index,
        describer,
        captions,
        embedder,
        pipeline,
        search,
    }
}

pub fn add_image(setup: &Setup, dir: &Path, name: &str, description: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("image bytes for {}", name)).unwrap();
    setup
        .describer
        .descriptions
        .lock()
        .unwrap()
        .insert(name.to_string(), description.to_string());
    path
}
