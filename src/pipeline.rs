//! Describe → expand → embed → store, for one image at a time.

use crate::describer::Describer;
use crate::embeddings::EmbeddingProvider;
use crate::error::{IndexError, ModelError, Result};
use crate::facets::{FacetGenerator, FacetNames, FacetSet};
use crate::index::VectorIndex;
use crate::models::{ImageId, ImageRecord, IndexOutcome, IndexSummary, VectorEntry};
use crate::utils;
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

/// Result of indexing one image.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedImage {
    pub image_id: ImageId,
    pub outcome: IndexOutcome,
    pub facets: FacetSet,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound for every external model call
    pub model_timeout: Duration,
    /// Size of the worker pool shared by batch indexing and the watchers
    pub workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            model_timeout: Duration::from_secs(120),
            workers: 4,
        }
    }
}

/// Keeps image records and their facet entries in step with the files.
pub struct IndexingPipeline {
    describer: Arc<dyn Describer>,
    facets: FacetGenerator,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<VectorIndex>,
    options: PipelineOptions,
    workers: Arc<Semaphore>,
    path_locks: std::sync::Mutex<HashMap<ImageId, Arc<tokio::sync::Mutex<()>>>>,
}

impl IndexingPipeline {
    pub fn new(
        describer: Arc<dyn Describer>,
        facets: FacetGenerator,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<VectorIndex>,
        options: PipelineOptions,
    ) -> Result<Self> {
        if facets.names() != index.facet_names() {
            return Err(IndexError::StoreCorrupt(format!(
                "facet generator expects [{}] but the store holds [{}]",
                facets.names().as_slice().join(", "),
                index.facet_names().as_slice().join(", ")
            )));
        }
        let workers = Arc::new(Semaphore::new(options.workers.max(1)));
        Ok(Self {
            describer,
            facets,
            embedder,
            index,
            options,
            workers,
            path_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn facet_names(&self) -> &FacetNames {
        self.facets.names()
    }

    /// Bounded pool that model-bound work is dispatched into.
    pub fn worker_pool(&self) -> Arc<Semaphore> {
        self.workers.clone()
    }

    /// Index `path` unless its fingerprint matches the stored record.
    pub async fn index_image(&self, path: &Path) -> Result<IndexedImage> {
        self.index_serialized(path, false).await
    }

    /// Index `path` even when the fingerprint is unchanged.
    pub async fn reindex_image(&self, path: &Path) -> Result<IndexedImage> {
        self.index_serialized(path, true).await
    }

    /// Delete the record and every entry of `path`. Unknown paths succeed.
    pub async fn remove_image(&self, path: &Path) -> Result<usize> {
        let image_id = utils::image_id(path);
        self.with_path_lock(&image_id, async {
            let removed = self.index.delete_by_image(&image_id).await?;
            if removed > 0 {
                tracing::info!(image = %image_id, removed, "image removed from index");
            }
            Ok(removed)
        })
        .await
    }

    /// Give up on `path` after repeated failures: its record is dropped.
    pub async fn abandon(&self, path: &Path) -> Result<()> {
        let image_id = utils::image_id(path);
        self.with_path_lock(&image_id, async {
            self.index.delete_by_image(&image_id).await?;
            tracing::warn!(image = %image_id, "indexing abandoned");
            Ok(())
        })
        .await
    }

    /// Drop every image recorded below `dir` whose file is gone, for a
    /// directory that was deleted or moved out of the watched tree.
    pub async fn remove_directory(&self, dir: &Path) -> Result<usize> {
        self.index.refresh().await?;
        let dir = utils::normalize_path(dir);
        let gone: Vec<PathBuf> = self
            .index
            .snapshot()
            .records()
            .filter(|r| r.is_under(&dir) && !r.path.exists())
            .map(|r| r.path.clone())
            .collect();
        if gone.is_empty() {
            return Ok(0);
        }

        for path in &gone {
            self.remove_image(path).await?;
        }
        tracing::info!(dir = %dir.display(), images = gone.len(), "directory removed from index");
        Ok(gone.len())
    }

    pub async fn index_directory(&self, dir: &Path) -> Result<IndexSummary> {
        self.index_directory_with(dir, |_, _| {}).await
    }

    /// Index every image below `dir` through the worker pool, reporting each
    /// finished path to `on_item`. Per-image failures are counted, not raised.
    pub async fn index_directory_with<F>(&self, dir: &Path, on_item: F) -> Result<IndexSummary>
    where
        F: Fn(&Path, &Result<IndexedImage>),
    {
        let dir = utils::normalize_path(dir);
        let images = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || utils::scan_images(&dir))
                .await
                .map_err(|e| IndexError::WatchEvent(format!("directory scan failed: {}", e)))?
        };
        tracing::info!(dir = %dir.display(), images = images.len(), "indexing directory");

        let mut results = stream::iter(images)
            .map(|path| async move {
                let _permit = self.workers.acquire().await.ok();
                let result = self.index_image(&path).await;
                (path, result)
            })
            .buffer_unordered(self.options.workers.max(1));

        let mut summary = IndexSummary::default();
        while let Some((path, result)) = results.next().await {
            on_item(&path, &result);
            match result {
                Ok(indexed) => summary.record(indexed.outcome),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "image failed to index");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Bring the index in line with the files below `dir`: drop records of
    /// vanished files and (re)index anything new or changed.
    pub async fn reconcile(&self, dir: &Path) -> Result<IndexSummary> {
        self.index.refresh().await?;
        let dir = utils::normalize_path(dir);
        let stale: Vec<PathBuf> = self
            .index
            .snapshot()
            .records()
            .filter(|r| r.is_under(&dir) && !r.path.exists())
            .map(|r| r.path.clone())
            .collect();

        let mut summary = IndexSummary::default();
        for path in stale {
            match self.remove_image(&path).await {
                Ok(_) => summary.removed += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to drop stale image");
                    summary.failed += 1;
                }
            }
        }

        let indexed = self.index_directory(&dir).await?;
        summary.merge(&indexed);
        tracing::info!(dir = %dir.display(), ?summary, "reconciliation finished");
        Ok(summary)
    }

    async fn index_serialized(&self, path: &Path, force: bool) -> Result<IndexedImage> {
        let image_id = utils::image_id(path);
        let path = PathBuf::from(&image_id);
        self.with_path_lock(&image_id, self.index_locked(&image_id, &path, force))
            .await
    }

    async fn index_locked(&self, image_id: &str, path: &Path, force: bool) -> Result<IndexedImage> {
        let fingerprint = {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || utils::fingerprint(&path))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
        };
        let fingerprint = match fingerprint {
            Ok(fp) => fp,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The file is gone: whatever was indexed for it is stale
                self.index.delete_by_image(image_id).await?;
                return Err(IndexError::Describe(ModelError::UnsupportedFormat(format!(
                    "{}: file not found",
                    path.display()
                ))));
            }
            Err(e) => {
                let err = IndexError::Describe(ModelError::UnsupportedFormat(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
                self.record_failure(image_id, path, &err).await;
                return Err(err);
            }
        };

        self.index.refresh().await?;
        let snapshot = self.index.snapshot();
        let previous = snapshot.record(image_id).cloned();
        if !force {
            if let Some(record) = previous.as_ref().filter(|r| r.is_indexed()) {
                if record
                    .fingerprint
                    .as_ref()
                    .map(|fp| fp.same_content(&fingerprint))
                    .unwrap_or(false)
                {
                    let facets = FacetSet::from_pairs(self.facet_names(), snapshot.captions_for(image_id))?;
                    tracing::debug!(image = %image_id, "fingerprint unchanged, using cached facets");
                    return Ok(IndexedImage {
                        image_id: image_id.to_string(),
                        outcome: IndexOutcome::Unchanged,
                        facets,
                    });
                }
            }
        }
        drop(snapshot);

        let was_indexed = previous.map(|r| r.is_indexed()).unwrap_or(false);
        let staged = self.stage_entries(image_id, path).await;
        let (facets, entries) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                self.record_failure(image_id, path, &err).await;
                return Err(err);
            }
        };

        let record = ImageRecord::pending(image_id.to_string(), path.to_path_buf())
            .indexed(fingerprint, SystemTime::now());
        if let Err(store_err) = self.index.upsert_entries(record, entries).await {
            let err = IndexError::from(store_err);
            if !err.is_fatal() {
                self.record_failure(image_id, path, &err).await;
            }
            return Err(err);
        }

        let outcome = if was_indexed {
            IndexOutcome::Updated
        } else {
            IndexOutcome::Added
        };
        tracing::info!(image = %image_id, ?outcome, facets = facets.len(), "image indexed");
        Ok(IndexedImage {
            image_id: image_id.to_string(),
            outcome,
            facets,
        })
    }

    /// Run the external models and build the full set of entries in memory.
    /// Nothing touches the store until every facet has a vector.
    async fn stage_entries(&self, image_id: &str, path: &Path) -> Result<(FacetSet, Vec<VectorEntry>)> {
        let description = self
            .bounded(self.describer.describe(path))
            .await
            .map_err(IndexError::Describe)?;

        let facets = match tokio::time::timeout(self.options.model_timeout, self.facets.generate(&description)).await {
            Ok(result) => result?,
            Err(_) => return Err(IndexError::Describe(ModelError::Timeout(self.options.model_timeout))),
        };

        let vectors = try_join_all(
            facets
                .iter()
                .map(|(_, caption)| self.bounded(self.embedder.compute_embedding(caption))),
        )
        .await
        .map_err(IndexError::Embed)?;

        let created_at = SystemTime::now();
        let entries = facets
            .iter()
            .zip(vectors)
            .map(|((facet, caption), vector)| VectorEntry {
                image_id: image_id.to_string(),
                facet: facet.to_string(),
                vector,
                caption: caption.to_string(),
                created_at,
            })
            .collect();
        Ok((facets, entries))
    }

    async fn bounded<T>(&self, call: impl Future<Output = std::result::Result<T, ModelError>>) -> std::result::Result<T, ModelError> {
        tokio::time::timeout(self.options.model_timeout, call)
            .await
            .unwrap_or(Err(ModelError::Timeout(self.options.model_timeout)))
    }

    async fn record_failure(&self, image_id: &str, path: &Path, err: &IndexError) {
        tracing::warn!(image = %image_id, error = %err, "indexing failed");
        let record = ImageRecord::pending(image_id.to_string(), path.to_path_buf()).failed(err.to_string());
        if let Err(store_err) = self.index.mark_failed(record).await {
            tracing::error!(image = %image_id, error = %store_err, "could not record indexing failure");
        }
    }

    async fn with_path_lock<T>(&self, image_id: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = {
            let mut locks = self.path_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(image_id.to_string()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        let mut locks = self.path_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this call still hold the lock: nobody is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(image_id);
        }
        result
    }
}
