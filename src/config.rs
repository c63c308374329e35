use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";
pub const BASE_PATH_ENV: &str = "TAGREC_BASE_PATH";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const TASK_QUEUE_MAX_THREADS: u16 = 2;
const DEFAULT_BASE_EMBEDDER: &str = "bge-small-en-v1.5";
const DEFAULT_BASE_RERANKER: &str = "bge-reranker-base";
const DEFAULT_BATCH_SIZE: usize = 200;
const DEFAULT_RERANK_OVERFETCH: usize = 5;
const DEFAULT_K: usize = 5;

/// Base models used when no active model is configured or its files are gone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_base_embedder")]
    pub base_embedder: String,

    #[serde(default = "default_base_reranker")]
    pub base_reranker: String,

    #[serde(default)]
    pub show_download_progress: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            base_embedder: default_base_embedder(),
            base_reranker: default_base_reranker(),
            show_download_progress: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Entries embedded per `embed_documents` call during a full build
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Candidates fetched per requested result when reranking
    #[serde(default = "default_rerank_overfetch")]
    pub rerank_overfetch: usize,

    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            rerank_overfetch: default_rerank_overfetch(),
            default_k: default_k(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "task_queue_max_threads")]
    pub task_queue_max_threads: u16,

    /// Defaults to `<base>/indices`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_dir: Option<PathBuf>,

    /// Defaults to `<base>/models`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,

    /// Defaults to `<base>/runtime`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_model_dir: Option<PathBuf>,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default = "default_true")]
    pub warm_on_startup: bool,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            task_queue_max_threads: task_queue_max_threads(),
            index_dir: None,
            model_dir: None,
            runtime_model_dir: None,
            models: ModelsConfig::default(),
            build: BuildConfig::default(),
            query: QueryConfig::default(),
            warm_on_startup: true,
            base_path: PathBuf::new(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn task_queue_max_threads() -> u16 {
    TASK_QUEUE_MAX_THREADS
}

fn default_base_embedder() -> String {
    DEFAULT_BASE_EMBEDDER.to_string()
}

fn default_base_reranker() -> String {
    DEFAULT_BASE_RERANKER.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_rerank_overfetch() -> usize {
    DEFAULT_RERANK_OVERFETCH
}

fn default_k() -> usize {
    DEFAULT_K
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Resolve the data directory from `TAGREC_BASE_PATH` or `~/.local/share/tagrec`.
    pub fn base_path_from_env() -> anyhow::Result<PathBuf> {
        if let Ok(path) = std::env::var(BASE_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .context("could not determine home directory")?
            .context("home directory path is empty")?;
        Ok(home.join(".local/share/tagrec"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.task_queue_max_threads == 0 {
            bail!("task_queue_max_threads must be greater than 0");
        }
        if self.build.batch_size == 0 {
            bail!("build.batch_size must be greater than 0");
        }
        if self.query.rerank_overfetch == 0 {
            bail!("query.rerank_overfetch must be greater than 0");
        }
        if self.query.default_k == 0 {
            bail!("query.default_k must be greater than 0");
        }
        if self.models.base_embedder.trim().is_empty() || self.models.base_reranker.trim().is_empty()
        {
            bail!("models.base_embedder and models.base_reranker must be set");
        }
        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;
        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case new fields were added since the file was written
        let normalized = serde_yml::to_string(&config)?;
        if config_str != normalized {
            store.write(CONFIG_FILE, normalized.as_bytes())?;
        }

        Ok(config)
    }

    /// In-memory configuration rooted at `base_path`; nothing is written.
    pub fn with_base_path(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("indices"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("models"))
    }

    pub fn runtime_model_dir(&self) -> PathBuf {
        self.runtime_model_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("runtime"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.build.batch_size, 200);
        assert_eq!(config.query.rerank_overfetch, 5);
        assert_eq!(config.index_dir(), tmp.path().join("indices"));
        assert_eq!(config.runtime_model_dir(), tmp.path().join("runtime"));
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "build:\n  batch_size: 50\nindex_dir: /srv/indices\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.build.batch_size, 50);
        assert_eq!(config.index_dir(), PathBuf::from("/srv/indices"));
        assert_eq!(config.models.base_reranker, DEFAULT_BASE_RERANKER);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "build:\n  batch_size: 0\n").unwrap();

        assert!(Config::load_with(tmp.path()).is_err());
    }
}
