//! Flat in-memory vector index with exact squared-L2 search.
//!
//! Vectors are stored contiguously (`len * dimensions` floats) next to a
//! parallel array of documents. An index is never mutated while shared: the
//! store clones, merges, and publishes a new value instead.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Payload returned with every hit. Never embedded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub tag: String,
    pub datatype: String,
    pub reference: String,
    pub taxonomy: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    /// The exact text that was embedded
    pub content: String,
    pub meta: EntryMeta,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("cannot build an index without documents")]
    Empty,

    #[error("{documents} documents but {vectors} vectors")]
    CountMismatch { documents: usize, vectors: usize },
}

#[derive(Clone, Debug)]
pub struct VectorIndex {
    dimensions: usize,
    vectors: Vec<f32>,
    documents: Vec<IndexedDocument>,
    /// SHA-256 of the embedder id that produced the vectors
    fingerprint: [u8; 32],
}

impl VectorIndex {
    /// Build an index from documents and their embeddings (same order).
    pub fn from_embeddings(
        documents: Vec<IndexedDocument>,
        embeddings: Vec<Vec<f32>>,
        fingerprint: [u8; 32],
    ) -> Result<Self, IndexError> {
        if documents.len() != embeddings.len() {
            return Err(IndexError::CountMismatch {
                documents: documents.len(),
                vectors: embeddings.len(),
            });
        }
        let dimensions = match embeddings.first() {
            Some(first) if !first.is_empty() => first.len(),
            Some(_) => {
                return Err(IndexError::DimensionMismatch {
                    expected: 1,
                    got: 0,
                })
            }
            None => return Err(IndexError::Empty),
        };

        let mut vectors = Vec::with_capacity(dimensions * embeddings.len());
        for embedding in embeddings {
            if embedding.len() != dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: dimensions,
                    got: embedding.len(),
                });
            }
            vectors.extend_from_slice(&embedding);
        }

        Ok(Self {
            dimensions,
            vectors,
            documents,
            fingerprint,
        })
    }

    /// Reassemble an index from its persisted parts.
    pub(crate) fn from_parts(
        dimensions: usize,
        vectors: Vec<f32>,
        documents: Vec<IndexedDocument>,
        fingerprint: [u8; 32],
    ) -> Result<Self, IndexError> {
        if dimensions == 0 || documents.is_empty() {
            return Err(IndexError::Empty);
        }
        if vectors.len() != dimensions * documents.len() {
            return Err(IndexError::CountMismatch {
                documents: documents.len(),
                vectors: vectors.len() / dimensions,
            });
        }
        Ok(Self {
            dimensions,
            vectors,
            documents,
            fingerprint,
        })
    }

    /// Append every vector and document of `other`. Nothing is deduplicated.
    pub fn merge(&mut self, other: VectorIndex) -> Result<(), IndexError> {
        if other.dimensions != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: other.dimensions,
            });
        }
        self.vectors.extend(other.vectors);
        self.documents.extend(other.documents);
        Ok(())
    }

    /// Up to `k` nearest documents with their squared L2 distance, nearest
    /// first. Equal distances keep insertion order.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(&IndexedDocument, f32)>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(vec![]);
        }

        let distances: Vec<f32> = self
            .vectors
            .par_chunks(self.dimensions)
            .map(|v| squared_l2(query, v))
            .collect();

        let mut order: Vec<usize> = (0..distances.len()).collect();
        order.sort_by(|a, b| distances[*a].total_cmp(&distances[*b]));
        order.truncate(k);

        Ok(order
            .into_iter()
            .map(|i| (&self.documents[i], distances[i]))
            .collect())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[IndexedDocument] {
        &self.documents
    }

    /// All vectors, row-major.
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
