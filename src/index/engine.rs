//! Nearest-neighbour engine boundary.
//!
//! The engine only knows flat `u64` ids and vectors; identity (image, facet)
//! is kept by the store layer above it.

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Vector engine operating on a flat id space.
///
/// Engines are cloned for every committed write, so implementations should
/// keep their state in plain owned collections.
pub trait AnnEngine: Clone + Default + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Insert or replace the vector stored under `id`.
    fn insert(&mut self, id: u64, vector: Vec<f32>) -> Result<(), StoreError>;

    /// Remove `id`, returning whether it was present.
    fn remove(&mut self, id: u64) -> bool;

    fn get(&self, id: u64) -> Option<&[f32]>;

    /// Up to `k` ids ordered by descending similarity to `query`.
    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exact cosine-similarity engine (brute force over every stored vector).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatEngine {
    vectors: BTreeMap<u64, Vec<f32>>,
}

impl FlatEngine {
    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
        if query.len() != target.len() {
            return 0.0;
        }
        let target_norm = Self::l2_norm(target);
        if target_norm < f32::EPSILON {
            return 0.0;
        }
        let dot: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
        dot / (query_norm * target_norm)
    }
}

impl AnnEngine for FlatEngine {
    fn insert(&mut self, id: u64, vector: Vec<f32>) -> Result<(), StoreError> {
        if Self::l2_norm(&vector) < f32::EPSILON {
            return Err(StoreError::ZeroNormVector);
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> bool {
        self.vectors.remove(&id).is_some()
    }

    fn get(&self, id: u64) -> Option<&[f32]> {
        self.vectors.get(&id).map(Vec::as_slice)
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        if k == 0 || self.vectors.is_empty() {
            return Vec::new();
        }
        let query_norm = Self::l2_norm(query);
        if query_norm < f32::EPSILON {
            return Vec::new();
        }

        let mut scored: Vec<(u64, f32)> = self
            .vectors
            .iter()
            .map(|(id, v)| (*id, Self::cosine_similarity(query, v, query_norm)))
            .collect();

        // Ties fall back to id order so results are deterministic
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }
}
