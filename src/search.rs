//! Query side: one embedding, one raw nearest-neighbour pass over all facets,
//! then per-image max-score aggregation.

use crate::embeddings::EmbeddingProvider;
use crate::error::{IndexError, ModelError, Result};
use crate::index::{IndexSnapshot, ScoredEntry, VectorIndex};
use crate::models::{ImageId, SearchHit};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Raw hits fetched per requested result and facet
    pub fetch_multiplier: usize,
    /// Drop hits whose file disappeared since it was indexed
    pub skip_missing_files: bool,
    pub model_timeout: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            fetch_multiplier: 3,
            skip_missing_files: true,
            model_timeout: Duration::from_secs(120),
        }
    }
}

/// Hits of one query, plus the images found to have lost their file.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Indexed images whose file no longer exists; safe to delete
    pub vanished: Vec<ImageId>,
}

pub struct SearchAggregator {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: SearchOptions,
}

impl SearchAggregator {
    pub fn new(index: Arc<VectorIndex>, embedder: Arc<dyn EmbeddingProvider>, options: SearchOptions) -> Self {
        Self {
            index,
            embedder,
            options,
        }
    }

    /// Up to `top_k` distinct images, best first. Each image is scored by its
    /// best-matching facet.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        self.query(query, top_k).await.map(|results| results.hits)
    }

    /// Like [`search`](Self::search), also reporting images whose file is
    /// gone. The raw fetch widens until `top_k` usable images are found or
    /// every entry has been seen.
    pub async fn query(&self, query: &str, top_k: usize) -> Result<SearchResults> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(SearchResults::default());
        }

        let timeout = self.options.model_timeout;
        let vector = tokio::time::timeout(timeout, self.embedder.compute_embedding(query))
            .await
            .unwrap_or(Err(ModelError::Timeout(timeout)))
            .map_err(IndexError::Embed)?;

        self.index.refresh().await?;
        let snapshot = self.index.snapshot();
        let facet_count = self.index.facet_names().len();
        let mut raw_k = top_k
            .saturating_mul(facet_count)
            .saturating_mul(self.options.fetch_multiplier.max(1));

        let pass = loop {
            let scored = snapshot.search(&vector, raw_k)?;
            tracing::debug!(query, raw_k, raw_hits = scored.len(), "raw facet search done");
            let exhausted = scored.len() >= snapshot.len();
            let pass = self.collect(&snapshot, &scored, facet_count);
            if pass.hits.len() >= top_k || exhausted {
                break pass;
            }
            raw_k = raw_k.saturating_mul(2);
        };

        for (image_id, stored) in &pass.incomplete {
            tracing::error!(
                image = %image_id,
                stored,
                expected = facet_count,
                "integrity error: image has an incomplete facet set, skipping"
            );
        }
        for image_id in &pass.vanished {
            tracing::debug!(image = %image_id, "indexed file no longer exists, skipping");
        }

        let mut hits = pass.hits;
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.indexed_at.cmp(&a.indexed_at))
                .then_with(|| a.image_id.cmp(&b.image_id))
        });
        hits.truncate(top_k);
        Ok(SearchResults {
            hits,
            vanished: pass.vanished,
        })
    }

    /// Group raw hits by image, keeping each image's best facet, and sort
    /// out images that cannot be returned.
    fn collect(&self, snapshot: &IndexSnapshot, scored: &[ScoredEntry], facet_count: usize) -> Pass {
        // Hits arrive best first, so the first entry seen for an image is its best
        let mut best: HashMap<&str, &ScoredEntry> = HashMap::new();
        for entry in scored {
            best.entry(entry.image_id.as_str()).or_insert(entry);
        }

        let mut pass = Pass::default();
        for (image_id, entry) in best {
            let stored = snapshot.facet_count(image_id);
            let record = match snapshot.record(image_id) {
                Some(record) if record.is_indexed() && stored == facet_count => record,
                _ => {
                    pass.incomplete.push((image_id.to_string(), stored));
                    continue;
                }
            };
            if self.options.skip_missing_files && !record.path.exists() {
                pass.vanished.push(image_id.to_string());
                continue;
            }
            pass.hits.push(SearchHit {
                image_id: entry.image_id.clone(),
                facet: entry.facet.clone(),
                score: entry.score,
                caption: entry.caption.clone(),
                indexed_at: record.indexed_at,
            });
        }
        pass.vanished.sort();
        pass
    }
}

#[derive(Default)]
struct Pass {
    hits: Vec<SearchHit>,
    vanished: Vec<ImageId>,
    incomplete: Vec<(ImageId, usize)>,
}
