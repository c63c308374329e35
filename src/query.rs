//! Query pipeline: index lookup, dimension gate, similarity search and
//! optional reranking.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};
use crate::index::{validate_taxonomy_name, IndexStore};
use crate::models::ModelRegistry;

const DEFAULT_K: usize = 5;

fn default_k() -> usize {
    DEFAULT_K
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub taxonomy: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub rerank: bool,
}

impl QueryRequest {
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(CoreError::Validation("query must not be empty".to_string()));
        }
        if self.taxonomy.trim().is_empty() {
            return Err(CoreError::Validation("taxonomy is required".to_string()));
        }
        validate_taxonomy_name(&self.taxonomy)?;
        if self.k == 0 {
            return Err(CoreError::Validation("k must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub tag: String,
    pub datatype: String,
    pub reference: String,
    pub score: f32,
    pub rank: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub taxonomy: String,
    pub results: Vec<QueryResult>,
}

pub struct QueryEngine {
    store: Arc<IndexStore>,
    /// Candidates fetched per requested result when reranking
    overfetch: usize,
}

impl QueryEngine {
    pub fn new(store: Arc<IndexStore>, overfetch: usize) -> Self {
        Self {
            store,
            overfetch: overfetch.max(1),
        }
    }

    pub fn query(&self, request: &QueryRequest, registry: &ModelRegistry) -> Result<QueryResponse> {
        request.validate()?;
        let taxonomy = request.taxonomy.as_str();

        let models = registry.snapshot();
        let embedder = models.embedder()?;
        let reranker = if request.rerank {
            Some(models.reranker()?)
        } else {
            None
        };

        let index = match self.store.get(taxonomy, Some(&**embedder)) {
            Ok(Some(index)) => index,
            Ok(None) => return Err(CoreError::index_not_found(taxonomy, "no index")),
            Err(err @ CoreError::IndexNotFound { .. }) => return Err(err),
            Err(err) => return Err(CoreError::index_not_found(taxonomy, err.to_string())),
        };

        let embedder_dim = models.embedding_dimension()?;
        if embedder_dim != index.dimensions() {
            return Err(CoreError::DimensionMismatch {
                index_dim: index.dimensions(),
                embedder_dim,
            });
        }

        let k = request.k;
        let breadth = match reranker {
            Some(_) => k.saturating_mul(self.overfetch).max(k),
            None => k,
        };

        let query_vector = embedder.embed_query(&request.query)?;
        let hits = index.search(&query_vector, breadth)?;
        log::debug!(
            "query on {taxonomy}: {} candidates (breadth {breadth})",
            hits.len()
        );

        let results = match reranker {
            None => hits
                .into_iter()
                .take(k)
                .enumerate()
                .map(|(i, (doc, distance))| QueryResult {
                    tag: doc.meta.tag.clone(),
                    datatype: doc.meta.datatype.clone(),
                    reference: doc.meta.reference.clone(),
                    score: 1.0 / (1.0 + distance),
                    rank: i + 1,
                })
                .collect(),
            Some(reranker) => {
                let candidates = hits.into_iter().map(|(doc, _)| doc.clone()).collect();
                reranker
                    .rerank(&request.query, candidates, k)?
                    .into_iter()
                    .enumerate()
                    .map(|(i, (doc, score))| QueryResult {
                        tag: doc.meta.tag,
                        datatype: doc.meta.datatype,
                        reference: doc.meta.reference,
                        score,
                        rank: i + 1,
                    })
                    .collect()
            }
        };

        Ok(QueryResponse {
            query: request.query.clone(),
            taxonomy: request.taxonomy.clone(),
            results,
        })
    }
}
