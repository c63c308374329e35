//! Owns the active embedder/reranker pair.
//!
//! Readers take an `Arc<ActiveModels>` snapshot and keep using it for the
//! whole request. A reload builds a complete new pair first and then swaps the
//! pointer, so a query never sees an embedder from one generation and a
//! reranker from another.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use crate::catalog::{self, MetadataStore, ModelDescriptor, ModelKind};
use crate::errors::{CoreError, Result};
use crate::models::embeddings::{EmbeddingBackend, FastembedEmbedder, ONNX_FILE};
use crate::models::reranker::{FastembedReranker, NormalizeMethod, RerankBackend};

/// Fixed text embedded once per model generation to learn its output dimension.
const DIMENSION_PROBE: &str = "test";

const BASE_MODEL_VERSION: &str = "base";

pub struct ActiveModels {
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    reranker: Option<Arc<dyn RerankBackend>>,
    pub embedder_id: Option<u64>,
    pub reranker_id: Option<u64>,
    dimension: OnceLock<usize>,
}

impl ActiveModels {
    pub fn empty() -> Self {
        Self::new(None, None)
    }

    pub fn new(
        embedder: Option<Arc<dyn EmbeddingBackend>>,
        reranker: Option<Arc<dyn RerankBackend>>,
    ) -> Self {
        Self {
            embedder,
            reranker,
            embedder_id: None,
            reranker_id: None,
            dimension: OnceLock::new(),
        }
    }

    fn with_ids(mut self, embedder_id: u64, reranker_id: u64) -> Self {
        self.embedder_id = Some(embedder_id);
        self.reranker_id = Some(reranker_id);
        self
    }

    pub fn embedder(&self) -> Result<&Arc<dyn EmbeddingBackend>> {
        self.embedder
            .as_ref()
            .ok_or(CoreError::ModelNotLoaded("active embedder"))
    }

    pub fn reranker(&self) -> Result<&Arc<dyn RerankBackend>> {
        self.reranker
            .as_ref()
            .ok_or(CoreError::ModelNotLoaded("active reranker"))
    }

    /// Output length of the active embedder, probed on first call.
    pub fn embedding_dimension(&self) -> Result<usize> {
        if let Some(dim) = self.dimension.get() {
            return Ok(*dim);
        }
        let probe = self.embedder()?.embed_query(DIMENSION_PROBE)?;
        Ok(*self.dimension.get_or_init(|| probe.len()))
    }
}

/// Constructs concrete backends for descriptors and fetches base models.
pub trait BackendLoader: Send + Sync {
    fn load_embedder(
        &self,
        descriptor: &ModelDescriptor,
        dir: &Path,
    ) -> Result<Arc<dyn EmbeddingBackend>>;

    fn load_reranker(&self, descriptor: &ModelDescriptor, dir: &Path)
        -> Result<Arc<dyn RerankBackend>>;

    /// Download the named base model into `dest` and load it.
    fn fetch_base_embedder(&self, name: &str, dest: &Path) -> Result<Arc<dyn EmbeddingBackend>>;

    fn fetch_base_reranker(&self, name: &str, dest: &Path) -> Result<Arc<dyn RerankBackend>>;
}

pub struct FastembedLoader {
    pub show_download_progress: bool,
}

impl BackendLoader for FastembedLoader {
    fn load_embedder(
        &self,
        descriptor: &ModelDescriptor,
        dir: &Path,
    ) -> Result<Arc<dyn EmbeddingBackend>> {
        let embedder = if dir.join(ONNX_FILE).exists() {
            FastembedEmbedder::from_dir(&descriptor.name, dir)?
        } else {
            FastembedEmbedder::from_pretrained(&descriptor.name, dir, self.show_download_progress)?
        };
        Ok(Arc::new(embedder))
    }

    fn load_reranker(
        &self,
        descriptor: &ModelDescriptor,
        dir: &Path,
    ) -> Result<Arc<dyn RerankBackend>> {
        let method = descriptor.normalize_method.unwrap_or_default();
        let reranker = if dir.join(ONNX_FILE).exists() {
            FastembedReranker::from_dir(&descriptor.name, dir, method)?
        } else {
            FastembedReranker::from_pretrained(
                &descriptor.name,
                dir,
                self.show_download_progress,
                method,
            )?
        };
        Ok(Arc::new(reranker))
    }

    fn fetch_base_embedder(&self, name: &str, dest: &Path) -> Result<Arc<dyn EmbeddingBackend>> {
        Ok(Arc::new(FastembedEmbedder::from_pretrained(
            name,
            dest,
            self.show_download_progress,
        )?))
    }

    fn fetch_base_reranker(&self, name: &str, dest: &Path) -> Result<Arc<dyn RerankBackend>> {
        Ok(Arc::new(FastembedReranker::from_pretrained(
            name,
            dest,
            self.show_download_progress,
            NormalizeMethod::Softmax,
        )?))
    }
}

#[derive(Clone, Debug)]
pub struct ModelPaths {
    /// Where bootstrap downloads base models
    pub model_dir: PathBuf,
    /// Local copies of the active models
    pub runtime_dir: PathBuf,
    pub base_embedder: String,
    pub base_reranker: String,
}

pub struct ModelRegistry {
    loader: Arc<dyn BackendLoader>,
    paths: ModelPaths,
    active: RwLock<Arc<ActiveModels>>,
    reload_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn BackendLoader>, paths: ModelPaths) -> Self {
        Self {
            loader,
            paths,
            active: RwLock::new(Arc::new(ActiveModels::empty())),
            reload_lock: Mutex::new(()),
        }
    }

    /// Current pair. Stays valid even if a reload swaps in a new one.
    pub fn snapshot(&self) -> Arc<ActiveModels> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, models: ActiveModels) -> Arc<ActiveModels> {
        let models = Arc::new(models);
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = models.clone();
        models
    }

    pub fn get_active_model_paths(
        &self,
        metadata: &dyn MetadataStore,
    ) -> Result<(PathBuf, PathBuf)> {
        let (embedder, reranker) = active_descriptors(metadata)?;
        Ok((PathBuf::from(embedder.path), PathBuf::from(reranker.path)))
    }

    /// Load the active pair from its recorded paths, bootstrapping base models
    /// when no usable active pair exists.
    pub fn load_models(&self, metadata: &dyn MetadataStore) -> Result<Arc<ActiveModels>> {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_models_locked(metadata)
    }

    /// Startup path: copy active model directories into the runtime dir on
    /// first touch and load from those copies.
    pub fn copy_active_models_to_local_runtime_and_load(
        &self,
        metadata: &dyn MetadataStore,
    ) -> Result<Arc<ActiveModels>> {
        let _guard = self.reload_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (embedder, reranker) = match active_descriptors(metadata) {
            Ok(pair) => pair,
            Err(CoreError::Config(msg)) => {
                log::warn!("{msg}; falling back to bootstrap");
                return self.bootstrap(metadata);
            }
            Err(err) => return Err(err),
        };

        let embedder_rt = self
            .paths
            .runtime_dir
            .join(format!("embedder-{}", embedder.id));
        let reranker_rt = self
            .paths
            .runtime_dir
            .join(format!("reranker-{}", reranker.id));

        let copied = copy_dir(Path::new(&embedder.path), &embedder_rt).and_then(|a| {
            copy_dir(Path::new(&reranker.path), &reranker_rt).map(|b| a || b)
        });
        match copied {
            Ok(true) => log::info!(
                "copied active models into {}",
                self.paths.runtime_dir.display()
            ),
            Ok(false) => log::debug!("runtime model copies already present"),
            Err(err) => {
                log::warn!("failed to copy active models to runtime dir: {err}");
                return self.load_models_locked(metadata);
            }
        }

        let models = self.load_pair(&embedder, &embedder_rt, &reranker, &reranker_rt)?;
        Ok(self.publish(models))
    }

    fn load_models_locked(&self, metadata: &dyn MetadataStore) -> Result<Arc<ActiveModels>> {
        match active_descriptors(metadata) {
            Ok((embedder, reranker))
                if dir_has_entries(Path::new(&embedder.path))
                    && dir_has_entries(Path::new(&reranker.path)) =>
            {
                let models = self.load_pair(
                    &embedder,
                    Path::new(&embedder.path),
                    &reranker,
                    Path::new(&reranker.path),
                )?;
                Ok(self.publish(models))
            }
            Ok((embedder, reranker)) => {
                log::warn!(
                    "active model files missing ({}, {}); bootstrapping base models",
                    embedder.path,
                    reranker.path
                );
                self.bootstrap(metadata)
            }
            Err(CoreError::Config(msg)) => {
                log::info!("{msg}; bootstrapping base models");
                self.bootstrap(metadata)
            }
            Err(err) => Err(err),
        }
    }

    fn load_pair(
        &self,
        embedder: &ModelDescriptor,
        embedder_dir: &Path,
        reranker: &ModelDescriptor,
        reranker_dir: &Path,
    ) -> Result<ActiveModels> {
        let e = self.loader.load_embedder(embedder, embedder_dir)?;
        let r = self.loader.load_reranker(reranker, reranker_dir)?;
        log::info!(
            "active models: embedder {} (id {}), reranker {} (id {})",
            embedder.name,
            embedder.id,
            reranker.name,
            reranker.id
        );
        Ok(ActiveModels::new(Some(e), Some(r)).with_ids(embedder.id, reranker.id))
    }

    /// Download base models, record them and point the active setting at them.
    ///
    /// Safe to rerun after a partial failure: descriptors already recorded for
    /// the base model directories are reused instead of duplicated.
    fn bootstrap(&self, metadata: &dyn MetadataStore) -> Result<Arc<ActiveModels>> {
        let embedder_name = self.paths.base_embedder.clone();
        let reranker_name = self.paths.base_reranker.clone();
        let embedder_dir = self.paths.model_dir.join(&embedder_name);
        let reranker_dir = self.paths.model_dir.join(&reranker_name);

        log::info!("bootstrapping base models {embedder_name} and {reranker_name}");
        let embedder = self.loader.fetch_base_embedder(&embedder_name, &embedder_dir)?;
        let reranker = self.loader.fetch_base_reranker(&reranker_name, &reranker_dir)?;

        let embedder_path = embedder_dir.to_string_lossy().to_string();
        let reranker_path = reranker_dir.to_string_lossy().to_string();

        let (embedder_id, reranker_id) = catalog::write(metadata, |c| {
            let embedder_id = match find_by_path(c, ModelKind::Embedder, &embedder_path) {
                Some(id) => c
                    .update_model(
                        ModelKind::Embedder,
                        id,
                        &embedder_name,
                        BASE_MODEL_VERSION,
                        &embedder_path,
                    )?
                    .id,
                None => {
                    c.create_model(
                        ModelKind::Embedder,
                        &embedder_name,
                        BASE_MODEL_VERSION,
                        &embedder_path,
                        None,
                    )
                    .id
                }
            };
            let reranker_id = match find_by_path(c, ModelKind::Reranker, &reranker_path) {
                Some(id) => c
                    .update_model(
                        ModelKind::Reranker,
                        id,
                        &reranker_name,
                        BASE_MODEL_VERSION,
                        &reranker_path,
                    )?
                    .id,
                None => {
                    c.create_model(
                        ModelKind::Reranker,
                        &reranker_name,
                        BASE_MODEL_VERSION,
                        &reranker_path,
                        Some(NormalizeMethod::Softmax),
                    )
                    .id
                }
            };
            c.set_active(embedder_id, reranker_id)?;
            Ok((embedder_id, reranker_id))
        })?;

        Ok(self.publish(
            ActiveModels::new(Some(embedder), Some(reranker)).with_ids(embedder_id, reranker_id),
        ))
    }
}

fn find_by_path(catalog: &catalog::Catalog, kind: ModelKind, path: &str) -> Option<u64> {
    let setting = catalog.active_setting();
    let active_id = setting.and_then(|s| match kind {
        ModelKind::Embedder => s.active_embedder_id,
        ModelKind::Reranker => s.active_reranker_id,
    });

    // prefer the currently referenced descriptor if it already points there
    if let Some(id) = active_id {
        if catalog.model(kind, id).is_some_and(|m| m.path == path) {
            return Some(id);
        }
    }
    catalog.find_model_by_path(kind, path).map(|m| m.id)
}

fn active_descriptors(metadata: &dyn MetadataStore) -> Result<(ModelDescriptor, ModelDescriptor)> {
    let setting = metadata
        .get_active_setting()?
        .ok_or_else(|| CoreError::Config("no active model setting".to_string()))?;

    let embedder_id = setting
        .active_embedder_id
        .ok_or_else(|| CoreError::Config("active embedder is not set".to_string()))?;
    let reranker_id = setting
        .active_reranker_id
        .ok_or_else(|| CoreError::Config("active reranker is not set".to_string()))?;

    let embedder = metadata
        .get_model(ModelKind::Embedder, embedder_id)?
        .ok_or_else(|| CoreError::Config(format!("active embedder {embedder_id} has no descriptor")))?;
    let reranker = metadata
        .get_model(ModelKind::Reranker, reranker_id)?
        .ok_or_else(|| CoreError::Config(format!("active reranker {reranker_id} has no descriptor")))?;

    Ok((embedder, reranker))
}

fn dir_has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Copy `src` into `dst` unless `dst` already has content.
///
/// Returns whether a copy happened. The copy lands in a sibling staging
/// directory first so an interrupted copy never looks complete.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<bool> {
    if dir_has_entries(dst) {
        return Ok(false);
    }
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", src.display()),
        ));
    }

    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = parent.join(format!(
        ".{name}.partial-{}",
        rusty_ulid::generate_ulid_string()
    ));

    if let Err(err) = copy_recursive(src, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(err);
    }

    if dst.exists() {
        std::fs::remove_dir(dst)?;
    }
    std::fs::rename(&staging, dst)?;
    Ok(true)
}

fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
