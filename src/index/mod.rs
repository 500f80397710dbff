pub mod engine;
pub mod lock;
pub mod store;

pub use engine::{AnnEngine, FlatEngine};
pub use store::{IndexSnapshot, IndexStats, ScoredEntry, VectorIndex, CATALOG_FILE};
