//! Directory-backed vector store with an image record catalog.
//!
//! Catalog file format (`catalog.json`):
//! - line 1: blake3 hex digest of the body
//! - rest: JSON body (format version, facet names, dims, entries, records,
//!   engine state)
//!
//! Writers are serialized, in-process by an async mutex and across processes
//! by a lock file, and work on a private copy of the latest catalog. The
//! copy is written with temp file -> fsync -> rename and only published after
//! the rename succeeded, so readers never observe a write that is not
//! durable and a failed write leaves nothing behind.

use crate::error::StoreError;
use crate::facets::FacetNames;
use crate::index::engine::{AnnEngine, FlatEngine};
use crate::index::lock::{StoreLock, LOCK_FILE};
use crate::models::{ImageId, ImageRecord, IndexStatus, VectorEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

/// Catalog file name inside the store directory
pub const CATALOG_FILE: &str = "catalog.json";

/// Current catalog format version
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    image_id: ImageId,
    facet: String,
    caption: String,
    created_at: SystemTime,
}

/// One raw nearest-neighbour hit, translated back to image/facet identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub id: u64,
    pub image_id: ImageId,
    pub facet: String,
    pub caption: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub images_indexed: usize,
    pub images_failed: usize,
    pub entries: usize,
    pub dims: Option<usize>,
}

/// Immutable view of the index as of the last committed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "E: AnnEngine")]
pub struct IndexSnapshot<E = FlatEngine> {
    version: u32,
    facet_names: Vec<String>,
    dims: Option<usize>,
    next_id: u64,
    entries: BTreeMap<u64, StoredEntry>,
    records: BTreeMap<ImageId, ImageRecord>,
    engine: E,
    #[serde(skip)]
    by_image: HashMap<ImageId, Vec<u64>>,
}

impl<E: AnnEngine> IndexSnapshot<E> {
    fn empty(names: &FacetNames) -> Self {
        Self {
            version: FORMAT_VERSION,
            facet_names: names.as_slice().to_vec(),
            dims: None,
            next_id: 0,
            entries: BTreeMap::new(),
            records: BTreeMap::new(),
            engine: E::default(),
            by_image: HashMap::new(),
        }
    }

    fn rebuild_lookup(&mut self) {
        self.by_image.clear();
        for (id, entry) in &self.entries {
            self.by_image.entry(entry.image_id.clone()).or_default().push(*id);
        }
    }

    fn facet_position(&self, facet: &str) -> usize {
        self.facet_names
            .iter()
            .position(|name| name == facet)
            .unwrap_or(usize::MAX)
    }

    pub fn record(&self, image_id: &str) -> Option<&ImageRecord> {
        self.records.get(image_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.records.values()
    }

    /// Number of stored facet entries for `image_id`.
    pub fn facet_count(&self, image_id: &str) -> usize {
        self.by_image.get(image_id).map(Vec::len).unwrap_or(0)
    }

    /// Stored entries for one image, in facet order.
    pub fn entries_for(&self, image_id: &str) -> Vec<VectorEntry> {
        let Some(ids) = self.by_image.get(image_id) else {
            return Vec::new();
        };
        let mut entries: Vec<VectorEntry> = ids
            .iter()
            .filter_map(|id| {
                let stored = self.entries.get(id)?;
                Some(VectorEntry {
                    image_id: stored.image_id.clone(),
                    facet: stored.facet.clone(),
                    vector: self.engine.get(*id).map(<[f32]>::to_vec).unwrap_or_default(),
                    caption: stored.caption.clone(),
                    created_at: stored.created_at,
                })
            })
            .collect();
        entries.sort_by_key(|e| self.facet_position(&e.facet));
        entries
    }

    /// (facet, caption) pairs for one image, in facet order.
    pub fn captions_for(&self, image_id: &str) -> Vec<(String, String)> {
        self.entries_for(image_id)
            .into_iter()
            .map(|e| (e.facet, e.caption))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            images_indexed: self.records.values().filter(|r| r.is_indexed()).count(),
            images_failed: self
                .records
                .values()
                .filter(|r| r.status == IndexStatus::Failed)
                .count(),
            entries: self.entries.len(),
            dims: self.dims,
        }
    }

    /// Nearest entries across every facet, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredEntry>, StoreError> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dims) = self.dims {
            if query.len() != dims {
                return Err(StoreError::DimensionMismatch {
                    expected: dims,
                    got: query.len(),
                });
            }
        }

        Ok(self
            .engine
            .search(query, k)
            .into_iter()
            .filter_map(|(id, score)| {
                let stored = self.entries.get(&id)?;
                Some(ScoredEntry {
                    id,
                    image_id: stored.image_id.clone(),
                    facet: stored.facet.clone(),
                    caption: stored.caption.clone(),
                    score,
                })
            })
            .collect())
    }

    fn remove_image_entries(&mut self, image_id: &str) -> usize {
        let Some(ids) = self.by_image.remove(image_id) else {
            return 0;
        };
        for id in &ids {
            self.entries.remove(id);
            self.engine.remove(*id);
        }
        ids.len()
    }

    fn insert_entries(&mut self, entries: Vec<VectorEntry>) -> Result<(), StoreError> {
        for entry in entries {
            let dims = *self.dims.get_or_insert(entry.vector.len());
            if entry.vector.len() != dims {
                return Err(StoreError::DimensionMismatch {
                    expected: dims,
                    got: entry.vector.len(),
                });
            }
            if entry.vector.iter().any(|x| !x.is_finite()) {
                return Err(StoreError::NonFiniteVector);
            }

            let id = self.next_id;
            self.next_id += 1;
            self.engine.insert(id, entry.vector)?;
            self.entries.insert(
                id,
                StoredEntry {
                    image_id: entry.image_id.clone(),
                    facet: entry.facet,
                    caption: entry.caption,
                    created_at: entry.created_at,
                },
            );
            self.by_image.entry(entry.image_id).or_default().push(id);
        }
        Ok(())
    }

    /// Structural checks run on every load.
    fn validate(&self, names: &FacetNames) -> Result<(), String> {
        if self.version != FORMAT_VERSION {
            return Err(format!(
                "unsupported catalog version {} (expected {})",
                self.version, FORMAT_VERSION
            ));
        }
        if self.facet_names != names.as_slice() {
            return Err(format!(
                "catalog was built with facets [{}] but the configuration expects [{}]; \
                 rebuild the index or restore the previous facet configuration",
                self.facet_names.join(", "),
                names.as_slice().join(", ")
            ));
        }
        if self.engine.len() != self.entries.len() {
            return Err(format!(
                "engine holds {} vectors but catalog lists {} entries",
                self.engine.len(),
                self.entries.len()
            ));
        }
        for (id, entry) in &self.entries {
            if *id >= self.next_id {
                return Err(format!("entry id {} is beyond the id counter {}", id, self.next_id));
            }
            let Some(vector) = self.engine.get(*id) else {
                return Err(format!("entry {} has no vector", id));
            };
            if Some(vector.len()) != self.dims {
                return Err(format!("entry {} has dimension {}", id, vector.len()));
            }
            match self.records.get(&entry.image_id) {
                Some(record) if record.is_indexed() => {}
                _ => {
                    return Err(format!(
                        "entry {} references '{}' which is not indexed",
                        id, entry.image_id
                    ))
                }
            }
        }
        for record in self.records.values().filter(|r| r.is_indexed()) {
            let ids = self.by_image.get(&record.id).map(Vec::as_slice).unwrap_or(&[]);
            let facets: HashSet<&str> = ids
                .iter()
                .filter_map(|id| self.entries.get(id))
                .map(|e| e.facet.as_str())
                .collect();
            if ids.len() != names.len() || facets.len() != names.len() || !names.iter().all(|n| facets.contains(n)) {
                return Err(format!(
                    "'{}' is indexed with {} facet entries, expected {}",
                    record.id,
                    ids.len(),
                    names.len()
                ));
            }
        }
        Ok(())
    }
}

/// Persistent vector index keyed by (image, facet).
pub struct VectorIndex<E: AnnEngine = FlatEngine> {
    dir: PathBuf,
    facet_names: FacetNames,
    published: RwLock<Arc<IndexSnapshot<E>>>,
    /// Held by the one in-process writer; guards the digest of the catalog
    /// that `published` was read from or written as.
    writer: tokio::sync::Mutex<Option<String>>,
}

impl<E: AnnEngine> VectorIndex<E> {
    /// Open the store in `dir`, creating an empty one when the directory or
    /// catalog does not exist yet.
    pub fn load_or_create(dir: impl AsRef<Path>, facet_names: FacetNames) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let _lock = StoreLock::acquire(&dir).map_err(|e| StoreError::io(dir.join(LOCK_FILE), e))?;

        let tmp = dir.join(format!("{}.tmp", CATALOG_FILE));
        if tmp.exists() {
            tracing::warn!(path = %tmp.display(), "discarding unfinished catalog write");
            let _ = std::fs::remove_file(&tmp);
        }

        let (snapshot, digest) = match load_if_changed(&dir, &facet_names, None)? {
            Some((snapshot, digest)) => {
                tracing::info!(
                    path = %dir.display(),
                    entries = snapshot.len(),
                    images = snapshot.records.len(),
                    "vector store loaded"
                );
                (snapshot, digest)
            }
            None => {
                tracing::info!(path = %dir.display(), "creating empty vector store");
                (IndexSnapshot::empty(&facet_names), None)
            }
        };

        Ok(Self {
            dir,
            facet_names,
            published: RwLock::new(Arc::new(snapshot)),
            writer: tokio::sync::Mutex::new(digest),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn facet_names(&self) -> &FacetNames {
        &self.facet_names
    }

    /// Last published state; never waits for an in-flight write.
    pub fn snapshot(&self) -> Arc<IndexSnapshot<E>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredEntry>, StoreError> {
        self.snapshot().search(query, k)
    }

    pub fn stats(&self) -> IndexStats {
        self.snapshot().stats()
    }

    /// Pick up writes made by other processes since this one last read or
    /// wrote the catalog. Returns whether a newer catalog was published.
    ///
    /// Skipped while a local write is in flight: that write reloads the
    /// catalog itself before mutating.
    pub async fn refresh(&self) -> Result<bool, StoreError> {
        let Ok(mut known) = self.writer.try_lock() else {
            return Ok(false);
        };
        let dir = self.dir.clone();
        let names = self.facet_names.clone();
        let seen = known.clone();
        let reloaded = tokio::task::spawn_blocking(move || load_if_changed::<E>(&dir, &names, seen.as_deref()))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;

        match reloaded {
            Some((snapshot, digest)) => {
                tracing::debug!(path = %self.dir.display(), "catalog changed on disk, reloaded");
                self.publish(Arc::new(snapshot));
                *known = digest;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace every entry of `record`'s image with `entries` and store the
    /// record, as one durable write. Old entries are purged before the new
    /// ones are inserted.
    pub async fn upsert_entries(
        &self,
        record: ImageRecord,
        entries: Vec<VectorEntry>,
    ) -> Result<(), StoreError> {
        self.check_facet_set(&record, &entries)?;
        self.commit(move |snapshot| {
            let purged = snapshot.remove_image_entries(&record.id);
            snapshot.insert_entries(entries)?;
            tracing::debug!(image = %record.id, purged, "facet entries swapped");
            snapshot.records.insert(record.id.clone(), record);
            Ok(((), true))
        })
        .await
    }

    /// Drop the record and all entries of an image. Missing images are a no-op.
    pub async fn delete_by_image(&self, image_id: &str) -> Result<usize, StoreError> {
        let image_id = image_id.to_string();
        self.commit(move |snapshot| {
            let removed = snapshot.remove_image_entries(&image_id);
            let had_record = snapshot.records.remove(&image_id).is_some();
            Ok((removed, had_record || removed > 0))
        })
        .await
    }

    /// Store a non-indexed record, purging any entries the image still had.
    pub async fn mark_failed(&self, record: ImageRecord) -> Result<usize, StoreError> {
        if record.is_indexed() {
            return Err(StoreError::Rejected(format!(
                "'{}' cannot be marked failed while Indexed",
                record.id
            )));
        }
        self.commit(move |snapshot| {
            let removed = snapshot.remove_image_entries(&record.id);
            snapshot.records.insert(record.id.clone(), record);
            Ok((removed, true))
        })
        .await
    }

    /// Write the current state to disk.
    pub async fn persist(&self) -> Result<(), StoreError> {
        self.commit(|_| Ok(((), true))).await
    }

    fn check_facet_set(&self, record: &ImageRecord, entries: &[VectorEntry]) -> Result<(), StoreError> {
        if !record.is_indexed() {
            return Err(StoreError::Rejected(format!(
                "record '{}' must be Indexed to carry entries",
                record.id
            )));
        }
        if entries.len() != self.facet_names.len() {
            return Err(StoreError::Rejected(format!(
                "'{}' has {} facet entries, expected {}",
                record.id,
                entries.len(),
                self.facet_names.len()
            )));
        }
        let mut seen = HashSet::new();
        for entry in entries {
            if entry.image_id != record.id {
                return Err(StoreError::Rejected(format!(
                    "entry for '{}' submitted under '{}'",
                    entry.image_id, record.id
                )));
            }
            if !self.facet_names.contains(&entry.facet) || !seen.insert(entry.facet.as_str()) {
                return Err(StoreError::Rejected(format!(
                    "unexpected or duplicate facet '{}'",
                    entry.facet
                )));
            }
        }
        Ok(())
    }

    fn publish(&self, snapshot: Arc<IndexSnapshot<E>>) {
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Apply `mutate` to the latest catalog and write the result. The closure
    /// reports whether it changed anything; unchanged state is not written.
    ///
    /// The directory lock is held from the freshness check until the rename,
    /// so a commit never overwrites one made by another process.
    async fn commit<T, F>(&self, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut IndexSnapshot<E>) -> Result<(T, bool), StoreError>,
    {
        let mut known = self.writer.lock().await;

        let dir = self.dir.clone();
        let names = self.facet_names.clone();
        let seen = known.clone();
        let (lock, reloaded) = tokio::task::spawn_blocking(move || {
            let lock = StoreLock::acquire(&dir).map_err(|e| StoreError::io(dir.join(LOCK_FILE), e))?;
            let reloaded = load_if_changed::<E>(&dir, &names, seen.as_deref())?;
            Ok::<_, StoreError>((lock, reloaded))
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        if let Some((snapshot, digest)) = reloaded {
            tracing::debug!(path = %self.dir.display(), "catalog changed on disk, reloaded before write");
            self.publish(Arc::new(snapshot));
            *known = digest;
        }

        let mut next = self.snapshot().as_ref().clone();
        let (out, changed) = mutate(&mut next)?;
        if !changed {
            return Ok(out);
        }

        let next = Arc::new(next);
        let dir = self.dir.clone();
        let to_write = next.clone();
        let digest = tokio::task::spawn_blocking(move || {
            let digest = write_catalog(&dir, to_write.as_ref());
            drop(lock);
            digest
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        *known = Some(digest);
        self.publish(next);
        Ok(out)
    }
}

/// Read and validate the catalog unless its digest is still `known`.
///
/// `Ok(None)` means nothing new: the digest matches, or there is no catalog
/// and none was seen before. A catalog that disappeared yields an empty store.
fn load_if_changed<E: AnnEngine>(
    dir: &Path,
    names: &FacetNames,
    known: Option<&str>,
) -> Result<Option<(IndexSnapshot<E>, Option<String>)>, StoreError> {
    let path = dir.join(CATALOG_FILE);
    let current = match read_digest(&path) {
        Ok(digest) => digest,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(known.map(|_| (IndexSnapshot::empty(names), None)));
        }
        Err(e) => return Err(StoreError::io(&path, e)),
    };
    if known == Some(current.as_str()) {
        return Ok(None);
    }

    let (snapshot, digest) = read_catalog::<E>(&path)?;
    snapshot.validate(names).map_err(StoreError::Corrupt)?;
    Ok(Some((snapshot, Some(digest))))
}

/// First line of the catalog, without reading the body.
fn read_digest(path: &Path) -> std::io::Result<String> {
    let mut header = String::new();
    BufReader::new(File::open(path)?).read_line(&mut header)?;
    Ok(header.trim().to_string())
}

fn read_catalog<E: AnnEngine>(path: &Path) -> Result<(IndexSnapshot<E>, String), StoreError> {
    let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StoreError::Corrupt(format!("{}: missing digest header", path.display())))?;
    let (header, body) = (&bytes[..newline], &bytes[newline + 1..]);

    let expected = std::str::from_utf8(header).unwrap_or_default().trim();
    let actual = blake3::hash(body).to_hex();
    if expected != actual.as_str() {
        return Err(StoreError::Corrupt(format!(
            "{}: checksum mismatch, file may be truncated or edited",
            path.display()
        )));
    }

    let mut snapshot: IndexSnapshot<E> = serde_json::from_slice(body)
        .map_err(|e| StoreError::Corrupt(format!("{}: unreadable catalog: {}", path.display(), e)))?;
    snapshot.rebuild_lookup();
    Ok((snapshot, actual.to_string()))
}

/// Write the catalog atomically and return the digest of the new body.
fn write_catalog<E: AnnEngine>(dir: &Path, snapshot: &IndexSnapshot<E>) -> Result<String, StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let body = serde_json::to_vec(snapshot)?;
    let digest = blake3::hash(&body).to_hex().to_string();

    let path = dir.join(CATALOG_FILE);
    let temp_path = dir.join(format!("{}.tmp", CATALOG_FILE));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(digest.as_bytes())?;
        file.write_all(b"\n")?;
        file.write_all(&body)?;
        file.sync_all()
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(StoreError::io(&temp_path, e));
    }

    std::fs::rename(&temp_path, &path).map_err(|e| StoreError::io(&path, e))?;

    // Make the rename itself durable where the platform allows syncing a directory
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fingerprint;
    use std::time::Duration;
    use tempfile::TempDir;

    fn names() -> FacetNames {
        FacetNames::new(&["concept", "layout"]).unwrap()
    }

    fn record(id: &str) -> ImageRecord {
        let now = SystemTime::now();
        ImageRecord::pending(id.to_string(), PathBuf::from(id))
            .indexed(Fingerprint::new(1, now, "h".to_string()), now)
    }

    fn entries(id: &str, concept: Vec<f32>, layout: Vec<f32>) -> Vec<VectorEntry> {
        let now = SystemTime::now();
        vec![
            VectorEntry {
                image_id: id.to_string(),
                facet: "concept".to_string(),
                vector: concept,
                caption: format!("{} concept", id),
                created_at: now,
            },
            VectorEntry {
                image_id: id.to_string(),
                facet: "layout".to_string(),
                vector: layout,
                caption: format!("{} layout", id),
                created_at: now,
            },
        ]
    }

    #[tokio::test]
    async fn test_upsert_replaces_instead_of_appending() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();

        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();
        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 1.0], vec![0.5, 1.0]))
            .await
            .unwrap();

        let snapshot = index.snapshot();
        assert_eq!(snapshot.facet_count("/a.png"), 2);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries_for("/a.png")[0].vector, vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_upsert_rejects_partial_facet_set() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();

        let mut partial = entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]);
        partial.pop();
        let err = index.upsert_entries(record("/a.png"), partial).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(index.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_previous_state() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        // Second vector is zero-norm: the engine refuses it halfway through the swap
        let err = index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 1.0], vec![0.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ZeroNormVector));

        let snapshot = index.snapshot();
        assert_eq!(snapshot.facet_count("/a.png"), 2);
        assert_eq!(snapshot.entries_for("/a.png")[0].vector, vec![1.0, 0.0]);

        let reloaded: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert_eq!(reloaded.snapshot().entries_for("/a.png")[0].vector, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_delete_by_image_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        assert_eq!(index.delete_by_image("/a.png").await.unwrap(), 2);
        assert_eq!(index.delete_by_image("/a.png").await.unwrap(), 0);
        assert!(index.snapshot().record("/a.png").is_none());
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_purges_entries() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        let failed = record("/a.png").failed("embed timeout");
        assert_eq!(index.mark_failed(failed).await.unwrap(), 2);

        let snapshot = index.snapshot();
        assert_eq!(snapshot.facet_count("/a.png"), 0);
        assert_eq!(snapshot.record("/a.png").unwrap().status, IndexStatus::Failed);
        assert_eq!(snapshot.stats().images_failed, 1);
    }

    #[tokio::test]
    async fn test_search_translates_ids() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());

        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        let hits = index.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].image_id, "/a.png");
        assert_eq!(hits[0].facet, "layout");
        assert_eq!(hits[0].caption, "/a.png layout");
        assert!(index.search(&[0.0, 1.0], 0).unwrap().is_empty());
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 1),
            Err(StoreError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn test_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        {
            let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
            index
                .upsert_entries(record("/a.png"), entries("/a.png", vec![0.25, 0.5], vec![0.1, 0.9]))
                .await
                .unwrap();
        }

        let reloaded: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries_for("/a.png")[1].vector, vec![0.1, 0.9]);
        assert_eq!(snapshot.stats().dims, Some(2));
    }

    #[test]
    fn test_absent_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("nested/store");
        let index: VectorIndex = VectorIndex::load_or_create(&store_dir, names()).unwrap();
        assert!(store_dir.is_dir());
        assert!(index.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_catalog_is_corrupt() {
        let dir = TempDir::new().unwrap();
        {
            let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
            index
                .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
                .await
                .unwrap();
        }

        let catalog = dir.path().join(CATALOG_FILE);
        let content = std::fs::read_to_string(&catalog).unwrap();
        std::fs::write(&catalog, content.replace("/a.png concept", "/a.png edited!")).unwrap();

        let err = VectorIndex::<FlatEngine>::load_or_create(dir.path(), names()).err().unwrap();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_truncated_catalog_is_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CATALOG_FILE), b"{\"version\":").unwrap();
        let err = VectorIndex::<FlatEngine>::load_or_create(dir.path(), names()).err().unwrap();
        assert!(err.is_corrupt());
    }

    #[tokio::test]
    async fn test_facet_schema_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        {
            let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
            index.persist().await.unwrap();
        }
        let other = FacetNames::new(&["concept", "mood"]).unwrap();
        let err = VectorIndex::<FlatEngine>::load_or_create(dir.path(), other).err().unwrap();
        assert!(err.is_corrupt());
        assert!(err.to_string().contains("mood"));
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(format!("{}.tmp", CATALOG_FILE)), b"partial").unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert!(index.snapshot().is_empty());
        assert!(!dir.path().join(format!("{}.tmp", CATALOG_FILE)).exists());
    }

    #[tokio::test]
    async fn test_two_writers_on_one_directory_keep_each_others_images() {
        let dir = TempDir::new().unwrap();
        let watcher: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        let cli: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();

        cli.upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();
        watcher
            .upsert_entries(record("/b.png"), entries("/b.png", vec![0.5, 0.5], vec![0.2, 0.8]))
            .await
            .unwrap();

        // The second writer started from the first one's catalog
        let snapshot = watcher.snapshot();
        assert!(snapshot.record("/a.png").is_some());
        assert!(snapshot.record("/b.png").is_some());
        assert_eq!(snapshot.len(), 4);

        let reloaded: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert!(reloaded.snapshot().record("/a.png").is_some());
        assert!(reloaded.snapshot().record("/b.png").is_some());
    }

    #[tokio::test]
    async fn test_removal_by_another_writer_is_not_undone() {
        let dir = TempDir::new().unwrap();
        let watcher: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        watcher
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        let cli: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert_eq!(cli.delete_by_image("/a.png").await.unwrap(), 2);

        // Still in the watcher's published view until it looks at the disk
        assert!(watcher.snapshot().record("/a.png").is_some());
        watcher
            .upsert_entries(record("/b.png"), entries("/b.png", vec![0.5, 0.5], vec![0.2, 0.8]))
            .await
            .unwrap();
        assert!(watcher.snapshot().record("/a.png").is_none());

        let reloaded: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert!(reloaded.snapshot().record("/a.png").is_none());
        assert_eq!(reloaded.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_other_writers() {
        let dir = TempDir::new().unwrap();
        let reader: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert!(!reader.refresh().await.unwrap());

        let writer: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        writer
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        assert!(reader.refresh().await.unwrap());
        assert_eq!(reader.snapshot().facet_count("/a.png"), 2);
        assert!(!reader.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_of_unknown_image_does_not_write() {
        let dir = TempDir::new().unwrap();
        let index: VectorIndex = VectorIndex::load_or_create(dir.path(), names()).unwrap();
        assert_eq!(index.delete_by_image("/never.png").await.unwrap(), 0);
        assert!(!dir.path().join(CATALOG_FILE).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readers_do_not_wait_for_a_blocked_commit() {
        let dir = TempDir::new().unwrap();
        let index: Arc<VectorIndex> = Arc::new(VectorIndex::load_or_create(dir.path(), names()).unwrap());
        index
            .upsert_entries(record("/a.png"), entries("/a.png", vec![1.0, 0.0], vec![0.0, 1.0]))
            .await
            .unwrap();

        // Another process is in the middle of a write
        let foreign = StoreLock::acquire(dir.path()).unwrap();
        let writer = index.clone();
        let pending = tokio::spawn(async move {
            writer
                .upsert_entries(record("/b.png"), entries("/b.png", vec![0.5, 0.5], vec![0.2, 0.8]))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        assert_eq!(index.search(&[1.0, 0.0], 1).unwrap()[0].image_id, "/a.png");
        assert_eq!(index.stats().images_indexed, 1);
        assert!(!index.refresh().await.unwrap());

        drop(foreign);
        pending.await.unwrap().unwrap();
        assert_eq!(index.stats().images_indexed, 2);
    }
}
