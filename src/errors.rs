use crate::{
    catalog::MetadataError,
    index::{IndexError, IndexStorageError},
    models::{EmbeddingError, RerankError},
};

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Failures surfaced by the retrieval core.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("index not found for taxonomy '{taxonomy}': {reason}")]
    IndexNotFound { taxonomy: String, reason: String },

    #[error("{0} not loaded")]
    ModelNotLoaded(&'static str),

    #[error(
        "index dim ({index_dim}) != embedder dim ({embedder_dim}). Rebuild the index with the active embedder."
    )]
    DimensionMismatch { index_dim: usize, embedder_dim: usize },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("rerank error: {0}")]
    Rerank(#[from] RerankError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("index storage error: {0}")]
    Storage(#[from] IndexStorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn index_not_found(taxonomy: &str, reason: impl Into<String>) -> Self {
        CoreError::IndexNotFound {
            taxonomy: taxonomy.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable code reported to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::IndexNotFound { .. } => "INDEX_NOT_FOUND",
            CoreError::ModelNotLoaded(_) => "MODEL_NOT_LOADED",
            CoreError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Metadata(MetadataError::NotFound { .. }) => "NOT_FOUND",
            CoreError::Metadata(MetadataError::ActiveModelInUse { .. })
            | CoreError::Metadata(MetadataError::AlreadyExists(_)) => "CONFLICT",
            CoreError::Metadata(MetadataError::Invalid(_)) => "VALIDATION_ERROR",
            CoreError::Metadata(_) => "DB_ERROR",
            CoreError::Config(_) => "CONFIG_NOT_FOUND",
            _ => "INTERNAL_SERVER_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            CoreError::index_not_found("brsr", "missing").code(),
            "INDEX_NOT_FOUND"
        );
        assert_eq!(
            CoreError::ModelNotLoaded("active embedder").code(),
            "MODEL_NOT_LOADED"
        );
        let err = CoreError::DimensionMismatch {
            index_dim: 4,
            embedder_dim: 8,
        };
        assert_eq!(err.code(), "DIMENSION_MISMATCH");
        assert!(err.to_string().contains("Rebuild the index"));
    }

    #[test]
    fn test_index_not_found_message_carries_taxonomy() {
        let err = CoreError::index_not_found("esrs", "bad checksum");
        let msg = err.to_string();
        assert!(msg.contains("esrs"));
        assert!(msg.contains("bad checksum"));
    }
}
