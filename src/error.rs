use std::path::PathBuf;

/// Failure of a call across one of the external model boundaries
/// (captioner, caption expander, text embedder).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("model endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("model call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// Rejected before any request was made
    #[error("empty input: {0}")]
    EmptyInput(String),
}

impl ModelError {
    /// Map a transport error from reqwest onto the boundary taxonomy.
    pub fn from_reqwest(err: reqwest::Error, timeout: std::time::Duration) -> Self {
        if err.is_timeout() {
            ModelError::Timeout(timeout)
        } else {
            ModelError::Unreachable(err.to_string())
        }
    }
}

/// Errors raised by the vector store and its on-disk catalog.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot index a zero-norm vector")]
    ZeroNormVector,

    #[error("vector contains NaN or infinite values")]
    NonFiniteVector,

    #[error("rejected write: {0}")]
    Rejected(String),

    #[error("failed to encode catalog: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("background persistence task failed: {0}")]
    Join(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt(_))
    }
}

/// Per-image and index-level failures surfaced by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("describe failed: {0}")]
    Describe(#[source] ModelError),

    #[error("facet output could not be parsed: {0}")]
    FacetParse(String),

    #[error("embedding failed: {0}")]
    Embed(#[source] ModelError),

    #[error("store write failed: {0}")]
    Store(#[source] StoreError),

    #[error("store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("watch event error: {0}")]
    WatchEvent(String),
}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(msg) => IndexError::StoreCorrupt(msg),
            other => IndexError::Store(other),
        }
    }
}

impl IndexError {
    /// Index-level failures stop the indexing subsystem; everything else is
    /// scoped to a single image.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::StoreCorrupt(_))
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_store_error_is_fatal() {
        let err: IndexError = StoreError::Corrupt("digest mismatch".into()).into();
        assert!(matches!(err, IndexError::StoreCorrupt(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_store_io_error_is_per_image() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: IndexError = StoreError::io("/tmp/catalog.json", io).into();
        assert!(matches!(err, IndexError::Store(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_model_errors_are_not_fatal() {
        let err = IndexError::Describe(ModelError::Timeout(std::time::Duration::from_secs(5)));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("timed out"));
    }
}
