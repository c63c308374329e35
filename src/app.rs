use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{
        self, CatalogStore, MetadataError, MetadataStore, ModelDescriptor, ModelKind, NewEntry,
        Taxonomy,
    },
    config::Config,
    errors::{CoreError, Result},
    index::{validate_taxonomy_name, IndexStats, IndexStore},
    jobs::{
        entry_document, start_queue, Admission, IndexBuildPipeline, JobId, JobRecord, JobStatus,
        JobTarget, JobTracker, JobUpdate, Task, Worker,
    },
    models::{BackendLoader, FastembedLoader, ModelPaths, ModelRegistry},
    query::{QueryEngine, QueryRequest, QueryResponse},
    storage::BackendLocal,
};

const WARM_PROBE: &str = "warmup";

/// Answer to a build request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildAdmission {
    pub message: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub already_running: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveModelsView {
    pub active_embedder_id: Option<u64>,
    pub active_reranker_id: Option<u64>,
    pub embedder: Option<ModelDescriptor>,
    pub reranker: Option<ModelDescriptor>,
    /// Ids of the pair the running process actually serves with
    pub loaded_embedder_id: Option<u64>,
    pub loaded_reranker_id: Option<u64>,
}

/// Long-lived service object shared by the daemon and the CLI.
pub struct App {
    config: Config,
    metadata: Arc<dyn MetadataStore>,
    store: Arc<IndexStore>,
    registry: Arc<ModelRegistry>,
    jobs: Arc<JobTracker>,
    pipeline: Arc<IndexBuildPipeline>,
    engine: QueryEngine,

    task_tx: Option<mpsc::Sender<Task>>,
    task_queue_handle: Option<JoinHandle<()>>,

    ready: AtomicBool,
}

impl App {
    /// Open the catalog under the configured base path with the fastembed loader.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let storage = BackendLocal::new(config.base_path())
            .with_context(|| format!("opening {}", config.base_path().display()))?;
        let metadata = CatalogStore::open(Arc::new(storage)).context("opening catalog")?;
        let loader = FastembedLoader {
            show_download_progress: config.models.show_download_progress,
        };

        Self::new(config, Arc::new(metadata), Arc::new(loader))
    }

    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        loader: Arc<dyn BackendLoader>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let index_dir = config.index_dir();
        let store = Arc::new(
            IndexStore::new(index_dir.clone())
                .with_context(|| format!("creating index root {}", index_dir.display()))?,
        );

        let paths = ModelPaths {
            model_dir: config.model_dir(),
            runtime_dir: config.runtime_model_dir(),
            base_embedder: config.models.base_embedder.clone(),
            base_reranker: config.models.base_reranker.clone(),
        };
        let registry = Arc::new(ModelRegistry::new(loader, paths));

        let pipeline = Arc::new(IndexBuildPipeline::new(
            store.clone(),
            metadata.clone(),
            config.build.batch_size,
        ));
        let engine = QueryEngine::new(store.clone(), config.query.rerank_overfetch);

        Ok(Self {
            config,
            metadata,
            store,
            registry,
            jobs: Arc::new(JobTracker::new()),
            pipeline,
            engine,
            task_tx: None,
            task_queue_handle: None,
            ready: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn run_queue(&mut self) {
        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let worker = Worker {
            pipeline: self.pipeline.clone(),
            registry: self.registry.clone(),
            jobs: self.jobs.clone(),
            max_threads: self.config.task_queue_max_threads,
        };

        let handle = std::thread::spawn(move || start_queue(task_rx, worker));

        self.task_queue_handle = Some(handle);
        self.task_tx = Some(task_tx);
    }

    /// Stop accepting tasks and wait for running ones to finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.task_tx.take() {
            let _ = tx.send(Task::Shutdown);
        }
        if let Some(handle) = self.task_queue_handle.take() {
            log::warn!("waiting for task queue to stop");
            if handle.join().is_err() {
                log::error!("task queue thread panicked");
            }
        }
    }

    /// Admit a build for `taxonomy` and hand it to the task queue.
    ///
    /// A second request for a taxonomy whose build is still queued or running
    /// gets the existing job back instead of a new one.
    pub fn start_build(&self, taxonomy: &str) -> Result<BuildAdmission> {
        if taxonomy.trim().is_empty() {
            return Err(CoreError::Validation("taxonomy is required".to_string()));
        }
        validate_taxonomy_name(taxonomy)?;
        self.registry.snapshot().embedder()?;

        let job_id = match self.jobs.admit(JobTarget::Taxonomy(taxonomy.to_string())) {
            Admission::AlreadyActive(job_id, record) => {
                log::info!("build of {taxonomy} already active as job {job_id}");
                return Ok(BuildAdmission {
                    message: "Build already running".to_string(),
                    job_id,
                    status: record.status,
                    already_running: true,
                });
            }
            Admission::Started(job_id) => job_id,
        };

        let task = Task::BuildIndex {
            job_id: job_id.clone(),
            taxonomy: taxonomy.to_string(),
        };
        let sent = match &self.task_tx {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        };
        if !sent {
            self.jobs
                .update(&job_id, JobUpdate::failed("task queue is not running"));
            return Err(CoreError::Config("task queue is not running".to_string()));
        }

        log::info!("queued build of {taxonomy} as job {job_id}");
        Ok(BuildAdmission {
            message: "Index build started".to_string(),
            job_id,
            status: JobStatus::Queued,
            already_running: false,
        })
    }

    pub fn job(&self, job_id: &JobId) -> Option<JobRecord> {
        self.jobs.get(job_id)
    }

    pub fn cache_stats(&self) -> IndexStats {
        self.store.stats()
    }

    pub fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.engine.query(request, &self.registry)
    }

    pub fn reload_models(&self) -> Result<()> {
        let models = self.registry.load_models(self.metadata.as_ref())?;
        log::info!(
            "reloaded models (embedder {:?}, reranker {:?})",
            models.embedder_id,
            models.reranker_id
        );
        Ok(())
    }

    /// Point the active setting at a new pair. Takes effect on the next reload.
    pub fn set_active_models(&self, embedder_id: u64, reranker_id: u64) -> Result<()> {
        catalog::write(self.metadata.as_ref(), |c| {
            c.set_active(embedder_id, reranker_id)
        })?;
        log::info!("active models set to embedder {embedder_id}, reranker {reranker_id}");
        Ok(())
    }

    pub fn active_models(&self) -> Result<ActiveModelsView> {
        let setting = self.metadata.get_active_setting()?;
        let embedder_id = setting.as_ref().and_then(|s| s.active_embedder_id);
        let reranker_id = setting.as_ref().and_then(|s| s.active_reranker_id);

        let embedder = match embedder_id {
            Some(id) => self.metadata.get_model(ModelKind::Embedder, id)?,
            None => None,
        };
        let reranker = match reranker_id {
            Some(id) => self.metadata.get_model(ModelKind::Reranker, id)?,
            None => None,
        };

        let loaded = self.registry.snapshot();
        Ok(ActiveModelsView {
            active_embedder_id: embedder_id,
            active_reranker_id: reranker_id,
            embedder,
            reranker,
            loaded_embedder_id: loaded.embedder_id,
            loaded_reranker_id: loaded.reranker_id,
        })
    }

    pub fn list_models(&self, kind: ModelKind) -> Result<Vec<ModelDescriptor>> {
        Ok(self.metadata.list_models(kind)?)
    }

    pub fn delete_model(&self, kind: ModelKind, id: u64) -> Result<()> {
        catalog::write(self.metadata.as_ref(), |c| c.delete_model(kind, id))?;
        log::info!("deleted {} {id}", kind.as_str());
        Ok(())
    }

    pub fn list_taxonomies(&self) -> Result<Vec<Taxonomy>> {
        Ok(self.metadata.list_taxonomies()?)
    }

    /// Create a taxonomy with its entries in one transaction.
    pub fn import_taxonomy(
        &self,
        name: &str,
        entries: Vec<NewEntry>,
        description: Option<String>,
        source_file: Option<String>,
    ) -> Result<Taxonomy> {
        validate_taxonomy_name(name)?;
        if entries.is_empty() {
            return Err(CoreError::Validation(format!(
                "taxonomy '{name}' has no entries to import"
            )));
        }

        let count = entries.len();
        let taxonomy = catalog::write(self.metadata.as_ref(), |c| {
            let taxonomy = c.create_taxonomy(name, description, source_file)?;
            c.add_entries(taxonomy.id, entries)?;
            Ok(taxonomy)
        })?;
        log::info!("imported taxonomy {name} with {count} entries");
        Ok(taxonomy)
    }

    /// Add entries to an existing taxonomy. If it already has an index the new
    /// entries are embedded and merged into it.
    pub fn add_entries(&self, taxonomy: &str, entries: Vec<NewEntry>) -> Result<usize> {
        let added = catalog::write(self.metadata.as_ref(), |c| {
            let id = c
                .taxonomy_by_name(taxonomy)
                .map(|t| t.id)
                .ok_or_else(|| MetadataError::NotFound {
                    kind: "taxonomy",
                    name: taxonomy.to_string(),
                })?;
            c.add_entries(id, entries)
        })?;
        log::info!("added {} entries to {taxonomy}", added.len());

        if self.store.exists(taxonomy) {
            let models = self.registry.snapshot();
            let embedder = models.embedder()?;
            let documents = added.iter().map(|e| entry_document(e, taxonomy)).collect();
            let index = self.store.update(taxonomy, documents, &**embedder)?;
            log::info!("index {taxonomy} now holds {} entries", index.len());
        }

        Ok(added.len())
    }

    /// Drop the taxonomy rows and its index, in memory and on disk.
    pub fn delete_taxonomy(&self, taxonomy: &str) -> Result<()> {
        catalog::write(self.metadata.as_ref(), |c| c.delete_taxonomy(taxonomy))?;
        let removed = self.store.remove(taxonomy, true)?;
        log::info!("deleted taxonomy {taxonomy} (index removed: {removed})");
        Ok(())
    }

    /// Force-load one index and run every model once against it.
    pub fn warm_taxonomy(&self, taxonomy: &str) -> Result<()> {
        let index = self.store.load(taxonomy, true)?;
        let models = self.registry.snapshot();
        let embedder = models.embedder()?;

        let probe = embedder.embed_query(WARM_PROBE)?;
        if probe.len() != index.dimensions() {
            return Err(CoreError::DimensionMismatch {
                index_dim: index.dimensions(),
                embedder_dim: probe.len(),
            });
        }
        let hits = index.search(&probe, 1)?;

        if let Ok(reranker) = models.reranker() {
            let candidates: Vec<&str> = hits.iter().map(|(doc, _)| doc.content.as_str()).collect();
            if !candidates.is_empty() {
                reranker.score(WARM_PROBE, &candidates)?;
            }
        }

        log::info!("warmed {taxonomy} ({} entries)", index.len());
        Ok(())
    }

    /// Returns how many indices warmed successfully.
    pub fn warm_all_disk_indices(&self) -> usize {
        let mut warmed = 0;
        for taxonomy in self.store.disk_indices() {
            match self.warm_taxonomy(&taxonomy) {
                Ok(()) => warmed += 1,
                Err(err) => log::warn!("skipping warm-up of {taxonomy}: {err}"),
            }
        }
        warmed
    }

    /// Load the active models from their runtime copies, warm indices and
    /// flip the readiness flag.
    pub fn startup(&self) -> Result<()> {
        self.registry
            .copy_active_models_to_local_runtime_and_load(self.metadata.as_ref())?;

        if self.config.warm_on_startup {
            let warmed = self.warm_all_disk_indices();
            log::info!("warm-up finished, {warmed} index(es) ready");
        }

        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
