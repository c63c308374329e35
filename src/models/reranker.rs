//! Cross-encoder reranking and score normalization.

use std::convert::Infallible;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use fastembed::{
    RerankInitOptions, RerankInitOptionsUserDefined, RerankerModel, TextRerank, TokenizerFiles,
    UserDefinedRerankingModel,
};
use serde::{Deserialize, Serialize};

use crate::index::IndexedDocument;

#[derive(Debug, thiserror::Error)]
pub enum RerankError {
    #[error("reranker initialization failed: {0}")]
    InitFailed(String),

    #[error("reranking failed: {0}")]
    RerankFailed(String),

    #[error("invalid reranker name: {0}")]
    InvalidModel(String),

    #[error("reranker returned {got} scores for {expected} candidates")]
    CountMismatch { expected: usize, got: usize },
}

/// How raw cross-encoder scores are mapped before ranking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMethod {
    Softmax,
    Sigmoid,
    Minmax,
    #[default]
    None,
}

impl FromStr for NormalizeMethod {
    type Err = Infallible;

    /// Unknown names pass scores through unchanged.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "softmax" => NormalizeMethod::Softmax,
            "sigmoid" => NormalizeMethod::Sigmoid,
            "minmax" => NormalizeMethod::Minmax,
            _ => NormalizeMethod::None,
        })
    }
}

/// Normalize the raw scores of one query's candidate set.
pub fn normalize_scores(raw: &[f32], method: NormalizeMethod) -> Vec<f32> {
    if raw.is_empty() {
        return vec![];
    }

    match method {
        NormalizeMethod::Softmax => {
            let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f64> = raw.iter().map(|r| ((r - max) as f64).exp()).collect();
            let sum: f64 = exps.iter().sum();
            exps.into_iter().map(|e| (e / sum) as f32).collect()
        }
        NormalizeMethod::Sigmoid => raw.iter().map(|r| 1.0 / (1.0 + (-r).exp())).collect(),
        NormalizeMethod::Minmax => {
            let min = raw.iter().copied().fold(f32::INFINITY, f32::min);
            let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if max == min {
                vec![0.5; raw.len()]
            } else {
                raw.iter().map(|r| (r - min) / (max - min)).collect()
            }
        }
        NormalizeMethod::None => raw.to_vec(),
    }
}

/// Cross-encoder scoring of candidates against a query.
pub trait RerankBackend: Send + Sync {
    fn model_id(&self) -> &str;

    fn normalize_method(&self) -> NormalizeMethod;

    /// Raw scores, one per candidate, in candidate order.
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>, RerankError>;

    /// Top `top_k` candidates by normalized score, highest first.
    /// Equal scores keep their original candidate order.
    fn rerank(
        &self,
        query: &str,
        candidates: Vec<IndexedDocument>,
        top_k: usize,
    ) -> Result<Vec<(IndexedDocument, f32)>, RerankError> {
        if candidates.is_empty() || top_k == 0 {
            return Ok(vec![]);
        }

        let texts: Vec<&str> = candidates.iter().map(|d| d.content.as_str()).collect();
        let raw = self.score(query, &texts)?;
        if raw.len() != candidates.len() {
            return Err(RerankError::CountMismatch {
                expected: candidates.len(),
                got: raw.len(),
            });
        }

        let normalized = normalize_scores(&raw, self.normalize_method());
        let mut scored: Vec<(IndexedDocument, f32)> =
            candidates.into_iter().zip(normalized).collect();

        // sort_by is stable
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);
        Ok(scored)
    }
}

pub struct FastembedReranker {
    model: Mutex<TextRerank>,
    model_id: String,
    normalize_method: NormalizeMethod,
}

impl FastembedReranker {
    pub fn from_pretrained(
        model_name: &str,
        cache_dir: &Path,
        show_download_progress: bool,
        normalize_method: NormalizeMethod,
    ) -> Result<Self, RerankError> {
        let model_enum = parse_model_name(model_name)?;

        std::fs::create_dir_all(cache_dir).map_err(|e| {
            RerankError::InitFailed(format!("failed to create {}: {e}", cache_dir.display()))
        })?;

        let options = RerankInitOptions::new(model_enum)
            .with_cache_dir(cache_dir.to_path_buf())
            .with_show_download_progress(show_download_progress);

        let model =
            TextRerank::try_new(options).map_err(|e| RerankError::InitFailed(e.to_string()))?;

        log::info!("loaded reranker {model_name} from {}", cache_dir.display());

        Ok(Self {
            model: Mutex::new(model),
            model_id: model_name.to_string(),
            normalize_method,
        })
    }

    /// Cross-encoder ONNX export plus tokenizer files.
    pub fn from_dir(
        model_id: &str,
        dir: &Path,
        normalize_method: NormalizeMethod,
    ) -> Result<Self, RerankError> {
        let read = |name: &str| {
            std::fs::read(dir.join(name)).map_err(|e| {
                RerankError::InitFailed(format!("failed to read {}: {e}", dir.join(name).display()))
            })
        };

        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read("tokenizer.json")?,
            config_file: read("config.json")?,
            special_tokens_map_file: read("special_tokens_map.json")?,
            tokenizer_config_file: read("tokenizer_config.json")?,
        };
        let user_model = UserDefinedRerankingModel::new(read("model.onnx")?, tokenizer_files);

        let model = TextRerank::try_new_from_user_defined(
            user_model,
            RerankInitOptionsUserDefined::default(),
        )
        .map_err(|e| RerankError::InitFailed(e.to_string()))?;

        log::info!("loaded reranker {model_id} from {}", dir.display());

        Ok(Self {
            model: Mutex::new(model),
            model_id: model_id.to_string(),
            normalize_method,
        })
    }
}

impl RerankBackend for FastembedReranker {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn normalize_method(&self) -> NormalizeMethod {
        self.normalize_method
    }

    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>, RerankError> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|e| RerankError::RerankFailed(format!("failed to acquire model lock: {e}")))?;

        let results = model
            .rerank(query, candidates.to_vec(), false, None)
            .map_err(|e| RerankError::RerankFailed(e.to_string()))?;

        if results.len() != candidates.len() {
            return Err(RerankError::CountMismatch {
                expected: candidates.len(),
                got: results.len(),
            });
        }

        // fastembed returns results sorted by score; put them back in input order
        let mut scores = vec![f32::NEG_INFINITY; candidates.len()];
        for result in &results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

fn parse_model_name(name: &str) -> Result<RerankerModel, RerankError> {
    match name.to_lowercase().as_str() {
        "bge-reranker-base" => Ok(RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(RerankerModel::JINARerankerV1TurboEn),
        _ => Err(RerankError::InvalidModel(format!(
            "unknown reranker: {name}. Supported: bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en"
        ))),
    }
}
