use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identity of an indexed image: its absolute, normalized path as a string.
pub type ImageId = String;

/// Content fingerprint used to decide whether an image needs re-indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprint {
    /// File size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: SystemTime,
    /// Blake3 hash of file contents
    pub hash: String,
}

impl Fingerprint {
    pub fn new(size: u64, modified: SystemTime, hash: String) -> Self {
        Self {
            size,
            modified,
            hash,
        }
    }

    /// Two fingerprints describe the same content when size and hash agree.
    /// A touched but otherwise unchanged file keeps its cached facets.
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.size == other.size && self.hash == other.hash
    }
}

/// Lifecycle of an image in the index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexStatus {
    Pending,
    Indexed,
    Failed,
}

/// Catalog row for one image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: ImageId,
    pub path: PathBuf,
    pub status: IndexStatus,
    pub fingerprint: Option<Fingerprint>,
    pub indexed_at: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ImageRecord {
    pub fn pending(id: ImageId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            status: IndexStatus::Pending,
            fingerprint: None,
            indexed_at: None,
            last_error: None,
        }
    }

    pub fn indexed(mut self, fingerprint: Fingerprint, at: SystemTime) -> Self {
        self.status = IndexStatus::Indexed;
        self.fingerprint = Some(fingerprint);
        self.indexed_at = Some(at);
        self.last_error = None;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = IndexStatus::Failed;
        self.last_error = Some(error.into());
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.status == IndexStatus::Indexed
    }

    pub fn is_under(&self, dir: &Path) -> bool {
        self.path.starts_with(dir)
    }
}

/// One embedded facet caption of one image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorEntry {
    pub image_id: ImageId,
    pub facet: String,
    pub vector: Vec<f32>,
    pub caption: String,
    pub created_at: SystemTime,
}

/// Query result: one image with its best-matching facet.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub image_id: ImageId,
    pub facet: String,
    pub score: f32,
    pub caption: String,
    pub indexed_at: Option<SystemTime>,
}

/// What `index_image` did for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// First successful indexing of the image.
    Added,
    /// Existing entries were replaced.
    Updated,
    /// Fingerprint unchanged, no model was called.
    Unchanged,
}

/// Tally of a directory indexing or reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSummary {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub removed: usize,
}

impl IndexSummary {
    pub fn record(&mut self, outcome: IndexOutcome) {
        match outcome {
            IndexOutcome::Added => self.added += 1,
            IndexOutcome::Updated => self.updated += 1,
            IndexOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: &IndexSummary) {
        self.added += other.added;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.removed += other.removed;
    }
}
