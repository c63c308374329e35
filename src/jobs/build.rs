//! Full index build for one taxonomy.

use std::sync::Arc;

use crate::catalog::{MetadataStore, TaxonomyEntry};
use crate::errors::{CoreError, Result};
use crate::index::{EntryMeta, IndexStore, IndexedDocument, VectorIndex};
use crate::jobs::tracker::{JobId, JobTracker, JobUpdate};
use crate::models::ModelRegistry;

/// Recorded on the job when a build fails for an unexpected reason.
pub const GENERIC_BUILD_FAILURE: &str = "index build failed; see server logs";

/// Embeddable document for a catalog entry: the trimmed reference text.
pub fn entry_document(entry: &TaxonomyEntry, taxonomy: &str) -> IndexedDocument {
    let reference = entry.reference.clone().unwrap_or_default();
    IndexedDocument {
        content: reference.trim().to_string(),
        meta: EntryMeta {
            tag: entry.tag.clone(),
            datatype: entry.datatype.clone(),
            reference,
            taxonomy: taxonomy.to_string(),
        },
    }
}

pub struct IndexBuildPipeline {
    store: Arc<IndexStore>,
    metadata: Arc<dyn MetadataStore>,
    batch_size: usize,
}

impl IndexBuildPipeline {
    pub fn new(store: Arc<IndexStore>, metadata: Arc<dyn MetadataStore>, batch_size: usize) -> Self {
        Self {
            store,
            metadata,
            batch_size: batch_size.max(1),
        }
    }

    /// Run the build and record the outcome on `job_id`. Never returns an error:
    /// every failure ends up on the job record.
    pub fn build(&self, job_id: &JobId, taxonomy: &str, registry: &ModelRegistry, jobs: &JobTracker) {
        match self.run(job_id, taxonomy, registry, jobs) {
            Ok(count) => {
                jobs.update(job_id, JobUpdate::completed());
                log::info!("job {job_id}: built index {taxonomy} with {count} entries");
            }
            Err(CoreError::Validation(msg)) => {
                log::warn!("job {job_id}: {msg}");
                jobs.update(job_id, JobUpdate::failed(msg));
            }
            Err(err @ CoreError::ModelNotLoaded(_)) => {
                log::warn!("job {job_id}: {err}");
                jobs.update(job_id, JobUpdate::failed(err.to_string()));
            }
            Err(err) => {
                log::error!("job {job_id}: building index {taxonomy} failed: {err:?}");
                jobs.update(job_id, JobUpdate::failed(GENERIC_BUILD_FAILURE));
            }
        }
    }

    fn run(
        &self,
        job_id: &JobId,
        taxonomy: &str,
        registry: &ModelRegistry,
        jobs: &JobTracker,
    ) -> Result<usize> {
        let row = self
            .metadata
            .get_taxonomy_by_name(taxonomy)?
            .ok_or_else(|| CoreError::Validation(format!("taxonomy '{taxonomy}' not found")))?;

        let total = self.metadata.count_entries(row.id)?;
        if total == 0 {
            return Err(CoreError::Validation(format!(
                "taxonomy '{taxonomy}' has no entries"
            )));
        }

        let models = registry.snapshot();
        let embedder = models.embedder()?;

        jobs.update(job_id, JobUpdate::running(total));
        log::info!("job {job_id}: indexing {total} entries of {taxonomy}");

        let mut index: Option<VectorIndex> = None;
        let mut done = 0;
        loop {
            let batch = self
                .metadata
                .list_entries(row.id, done, self.batch_size)?;
            if batch.is_empty() {
                break;
            }

            let documents: Vec<IndexedDocument> =
                batch.iter().map(|e| entry_document(e, taxonomy)).collect();
            let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();

            let vectors = embedder.embed_documents(&texts)?;
            let partial = VectorIndex::from_embeddings(documents, vectors, embedder.fingerprint())?;
            match index.as_mut() {
                Some(base) => base.merge(partial)?,
                None => index = Some(partial),
            }

            done += batch.len();
            jobs.update(job_id, JobUpdate::progress(done, total));
            log::debug!("job {job_id}: {done}/{total}");

            if batch.len() < self.batch_size {
                break;
            }
        }

        let index = Arc::new(
            index.ok_or_else(|| CoreError::Validation("no documents indexed".to_string()))?,
        );
        self.store.publish(taxonomy, index.clone())?;
        Ok(index.len())
    }
}
