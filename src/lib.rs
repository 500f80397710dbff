pub mod config;
pub mod describer;
pub mod embeddings;
pub mod error;
pub mod facets;
pub mod index;
pub mod llm;
pub mod models;
pub mod notifier;
pub mod pipeline;
pub mod search;
pub mod service;
pub mod utils;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use describer::{Describer, LlmDescriber};
pub use embeddings::EmbeddingProvider;
pub use error::{IndexError, ModelError, StoreError};
pub use facets::{FacetGenerator, FacetNames, FacetSet};
pub use index::VectorIndex;
pub use llm::LlmProvider;
pub use models::{ImageRecord, IndexOutcome, IndexSummary, SearchHit};
pub use notifier::{DesktopNotifier, LogNotifier, Notifier};
pub use pipeline::{IndexedImage, IndexingPipeline, PipelineOptions};
pub use search::{SearchAggregator, SearchOptions, SearchResults};
pub use service::LiveIndexer;
