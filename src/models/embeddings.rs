//! Embedding backends.
//!
//! The retrieval core only depends on `EmbeddingBackend`. `FastembedEmbedder`
//! is the production implementation and can be built either from a named
//! pretrained model (downloaded into a cache directory) or from an ONNX export
//! stored in a model directory.

use std::path::Path;
use std::sync::Mutex;

use fastembed::{
    InitOptions, InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use sha2::{Digest, Sha256};

/// Files expected in a user-defined model directory.
pub const ONNX_FILE: &str = "model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const SPECIAL_TOKENS_MAP_FILE: &str = "special_tokens_map.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),

    #[error("backend returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

/// Text embedding model. Every vector it returns has the same length.
pub trait EmbeddingBackend: Send + Sync {
    /// Identifier of the model, used to fingerprint persisted indices
    fn model_id(&self) -> &str;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// One vector per input, in input order.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn fingerprint(&self) -> [u8; 32] {
        model_fingerprint(self.model_id())
    }
}

/// SHA-256 of the model id.
pub fn model_fingerprint(model_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.finalize().into()
}

/// fastembed's `embed` takes `&mut self`, hence the mutex.
pub struct FastembedEmbedder {
    model: Mutex<TextEmbedding>,
    model_id: String,
}

impl FastembedEmbedder {
    /// Load (downloading on first use) a named pretrained model into `cache_dir`.
    pub fn from_pretrained(
        model_name: &str,
        cache_dir: &Path,
        show_download_progress: bool,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        std::fs::create_dir_all(cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("failed to create {}: {e}", cache_dir.display()))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(cache_dir.to_path_buf())
            .with_show_download_progress(show_download_progress);

        let model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        log::info!("loaded embedder {model_name} from {}", cache_dir.display());

        Ok(Self {
            model: Mutex::new(model),
            model_id: model_name.to_string(),
        })
    }

    /// Load an ONNX export plus tokenizer files from `dir`.
    pub fn from_dir(model_id: &str, dir: &Path) -> Result<Self, EmbeddingError> {
        let read = |name: &str| {
            std::fs::read(dir.join(name)).map_err(|e| {
                EmbeddingError::InitFailed(format!("failed to read {}: {e}", dir.join(name).display()))
            })
        };

        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read(TOKENIZER_FILE)?,
            config_file: read(CONFIG_FILE)?,
            special_tokens_map_file: read(SPECIAL_TOKENS_MAP_FILE)?,
            tokenizer_config_file: read(TOKENIZER_CONFIG_FILE)?,
        };
        let user_model = UserDefinedEmbeddingModel::new(read(ONNX_FILE)?, tokenizer_files);

        let model =
            TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        log::info!("loaded embedder {model_id} from {}", dir.display());

        Ok(Self {
            model: Mutex::new(model),
            model_id: model_id.to_string(),
        })
    }
}

impl EmbeddingBackend for FastembedEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("failed to acquire model lock: {e}"))
        })?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("no embedding returned".to_string()))
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("failed to acquire model lock: {e}"))
        })?;

        let vectors = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "unknown model: {name}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, multilingual-e5-small (bge models accept a -q suffix)"
        ))),
    }
}
