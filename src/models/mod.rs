//! Model capabilities used by the retrieval core.
//!
//! - `embeddings`: text to vector
//! - `reranker`: query/candidate relevance plus score normalization
//! - `registry`: the active embedder/reranker pair and how it gets loaded

pub mod embeddings;
pub mod registry;
pub mod reranker;

pub use embeddings::{model_fingerprint, EmbeddingBackend, EmbeddingError, FastembedEmbedder};
pub use registry::{ActiveModels, BackendLoader, FastembedLoader, ModelPaths, ModelRegistry};
pub use reranker::{normalize_scores, FastembedReranker, NormalizeMethod, RerankBackend, RerankError};
