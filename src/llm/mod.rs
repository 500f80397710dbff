pub mod r#trait;
pub mod ollama;

pub use ollama::OllamaLlmProvider;
pub use r#trait::{LlmProvider, LlmRequest};
