//! Two-tier index store: an in-memory cache in front of per-taxonomy
//! directories under the index root.
//!
//! Cache entries are immutable `Arc<VectorIndex>` snapshots. A writer builds a
//! new index, persists it and then swaps the map entry; readers holding the
//! previous `Arc` keep a consistent view. Disk access for one taxonomy is
//! serialized by a per-key mutex, so a load never races a save of the same key
//! inside this process (the data directory lock covers other processes).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::errors::{CoreError, Result};
use crate::index::storage::IndexDirectory;
use crate::index::vectors::{IndexedDocument, VectorIndex};
use crate::models::{EmbeddingBackend, EmbeddingError};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct IndexStats {
    pub cached_indices: usize,
    pub disk_indices: usize,
    pub cache_keys: Vec<String>,
    pub disk_keys: Vec<String>,
    pub index_path: String,
}

pub struct IndexStore {
    root: PathBuf,
    cache: RwLock<HashMap<String, Arc<VectorIndex>>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    disk_loads: AtomicU64,
}

impl IndexStore {
    pub fn new(root: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cache: RwLock::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            disk_loads: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of successful index reads from disk since startup.
    pub fn disk_loads(&self) -> u64 {
        self.disk_loads.load(Ordering::Relaxed)
    }

    /// Memory first, then disk.
    ///
    /// Without an embedder a missing or unreadable index is reported as
    /// `Ok(None)`. With one, the caller needs the index and gets
    /// `IndexNotFound` instead.
    pub fn get(
        &self,
        taxonomy: &str,
        embedder: Option<&dyn EmbeddingBackend>,
    ) -> Result<Option<Arc<VectorIndex>>> {
        if let Some(index) = self.cached(taxonomy) {
            return Ok(Some(index));
        }

        let dir = self.directory(taxonomy)?;
        if !dir.exists() {
            return match embedder {
                None => Ok(None),
                Some(_) => Err(CoreError::index_not_found(taxonomy, "no index on disk")),
            };
        }

        let lock = self.key_lock(taxonomy);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // another thread may have loaded it while we waited
        if let Some(index) = self.cached(taxonomy) {
            return Ok(Some(index));
        }
        if !dir.exists() {
            return match embedder {
                None => Ok(None),
                Some(_) => Err(CoreError::index_not_found(taxonomy, "no index on disk")),
            };
        }

        match self.load_locked(taxonomy, &dir, embedder) {
            Ok(index) => Ok(Some(index)),
            Err(err) if embedder.is_none() => {
                log::warn!("{err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Overwrite the memory entry. Nothing is written to disk.
    pub fn set(&self, taxonomy: &str, index: Arc<VectorIndex>) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(taxonomy.to_string(), index);
    }

    /// Cached entry unless `force_reload`, otherwise read from disk.
    pub fn load(&self, taxonomy: &str, force_reload: bool) -> Result<Arc<VectorIndex>> {
        if !force_reload {
            if let Some(index) = self.cached(taxonomy) {
                return Ok(index);
            }
        }

        let dir = self.directory(taxonomy)?;
        let missing = || {
            CoreError::index_not_found(
                taxonomy,
                format!("{} has no index file", dir.path().display()),
            )
        };
        if !dir.exists() {
            return Err(missing());
        }

        let lock = self.key_lock(taxonomy);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !dir.exists() {
            return Err(missing());
        }
        self.load_locked(taxonomy, &dir, None)
    }

    /// Persist `index`, or the cached one when `None`.
    pub fn save(&self, taxonomy: &str, index: Option<Arc<VectorIndex>>) -> Result<()> {
        let index = match index {
            Some(index) => index,
            None => self
                .cached(taxonomy)
                .ok_or_else(|| CoreError::index_not_found(taxonomy, "nothing to save"))?,
        };

        let dir = self.directory(taxonomy)?;
        let lock = self.key_lock(taxonomy);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        dir.save(&index)?;
        log::info!(
            "saved index {taxonomy} ({} entries, dim {})",
            index.len(),
            index.dimensions()
        );
        Ok(())
    }

    /// Persist `index` and make it the cached entry as one step, so a
    /// concurrent `update` of the same taxonomy sees either the previous
    /// index on both tiers or this one on both.
    pub fn publish(&self, taxonomy: &str, index: Arc<VectorIndex>) -> Result<()> {
        let dir = self.directory(taxonomy)?;
        let lock = self.key_lock(taxonomy);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        dir.save(&index)?;
        self.set(taxonomy, index.clone());
        log::info!(
            "published index {taxonomy} ({} entries, dim {})",
            index.len(),
            index.dimensions()
        );
        Ok(())
    }

    /// Evict from memory and optionally delete from disk.
    pub fn remove(&self, taxonomy: &str, from_disk: bool) -> Result<bool> {
        let dir = self.directory(taxonomy)?;
        let lock = self.key_lock(taxonomy);
        let removed = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

            let mut removed = self
                .cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(taxonomy)
                .is_some();

            if from_disk {
                removed |= dir.delete()?;
            }
            removed
        };
        drop(lock);
        self.prune_key_locks();
        Ok(removed)
    }

    pub fn clear(&self, from_disk: bool) -> Result<()> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.prune_key_locks();

        if from_disk {
            if self.root.exists() {
                std::fs::remove_dir_all(&self.root)?;
            }
            std::fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// Embed `new_entries` one at a time, merge them into the existing index,
    /// persist, then publish.
    pub fn update(
        &self,
        taxonomy: &str,
        new_entries: Vec<IndexedDocument>,
        embedder: &dyn EmbeddingBackend,
    ) -> Result<Arc<VectorIndex>> {
        let dir = self.directory(taxonomy)?;
        let lock = self.key_lock(taxonomy);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = match self.cached(taxonomy) {
            Some(index) => index,
            None if dir.exists() => self.load_locked(taxonomy, &dir, Some(embedder))?,
            None => return Err(CoreError::index_not_found(taxonomy, "no index to update")),
        };
        if new_entries.is_empty() {
            return Ok(current);
        }

        let mut vectors = Vec::with_capacity(new_entries.len());
        for entry in &new_entries {
            let vector = embedder
                .embed_documents(std::slice::from_ref(&entry.content))?
                .pop()
                .ok_or(CoreError::Embedding(EmbeddingError::CountMismatch {
                    expected: 1,
                    got: 0,
                }))?;
            vectors.push(vector);
        }

        let delta = VectorIndex::from_embeddings(new_entries, vectors, embedder.fingerprint())?;
        if delta.dimensions() != current.dimensions() {
            return Err(CoreError::DimensionMismatch {
                index_dim: current.dimensions(),
                embedder_dim: delta.dimensions(),
            });
        }

        let added = delta.len();
        let mut merged = VectorIndex::clone(&current);
        merged.merge(delta)?;

        dir.save(&merged)?;
        let merged = Arc::new(merged);
        self.set(taxonomy, merged.clone());

        log::info!(
            "added {added} entries to index {taxonomy} (now {})",
            merged.len()
        );
        Ok(merged)
    }

    pub fn exists_in_cache(&self, taxonomy: &str) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(taxonomy)
    }

    pub fn exists_on_disk(&self, taxonomy: &str) -> bool {
        self.directory(taxonomy)
            .map(|dir| dir.exists())
            .unwrap_or(false)
    }

    pub fn exists(&self, taxonomy: &str) -> bool {
        self.exists_in_cache(taxonomy) || self.exists_on_disk(taxonomy)
    }

    /// Taxonomies with a complete index directory, sorted.
    pub fn disk_indices(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("failed to list {}: {err}", self.root.display());
                return vec![];
            }
        };

        let mut keys: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| !name.starts_with('.'))
            .filter(|name| IndexDirectory::new(self.root.join(name)).exists())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> IndexStats {
        let mut cache_keys: Vec<String> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        cache_keys.sort();
        let disk_keys = self.disk_indices();

        IndexStats {
            cached_indices: cache_keys.len(),
            disk_indices: disk_keys.len(),
            cache_keys,
            disk_keys,
            index_path: self.root.to_string_lossy().to_string(),
        }
    }

    fn cached(&self, taxonomy: &str) -> Option<Arc<VectorIndex>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(taxonomy)
            .cloned()
    }

    fn key_lock(&self, taxonomy: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(taxonomy.to_string())
            .or_default()
            .clone()
    }

    /// Drop per-key locks nobody holds. Clones are only handed out under the
    /// map mutex, so a count of one means the map has the sole reference.
    fn prune_key_locks(&self) {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn key_lock_count(&self) -> usize {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn directory(&self, taxonomy: &str) -> Result<IndexDirectory> {
        validate_taxonomy_name(taxonomy)?;
        Ok(IndexDirectory::new(self.root.join(taxonomy)))
    }

    /// Read from disk and publish into the cache. Caller holds the key lock.
    fn load_locked(
        &self,
        taxonomy: &str,
        dir: &IndexDirectory,
        embedder: Option<&dyn EmbeddingBackend>,
    ) -> Result<Arc<VectorIndex>> {
        let index = dir
            .load()
            .map_err(|err| CoreError::index_not_found(taxonomy, err.to_string()))?;
        self.disk_loads.fetch_add(1, Ordering::Relaxed);

        if let Some(embedder) = embedder {
            if index.fingerprint() != &embedder.fingerprint() {
                log::warn!(
                    "index {taxonomy} was built by a different embedder than {}",
                    embedder.model_id()
                );
            }
        }

        log::info!(
            "loaded index {taxonomy} from disk ({} entries, dim {})",
            index.len(),
            index.dimensions()
        );
        let index = Arc::new(index);
        self.set(taxonomy, index.clone());
        Ok(index)
    }
}

/// Taxonomy names become directory names under the index root.
pub fn validate_taxonomy_name(taxonomy: &str) -> Result<()> {
    let valid = !taxonomy.is_empty()
        && !taxonomy.starts_with('.')
        && !taxonomy.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "invalid taxonomy name '{taxonomy}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_names() {
        assert!(validate_taxonomy_name("brsr").is_ok());
        assert!(validate_taxonomy_name("esrs 2024").is_ok());
        assert!(validate_taxonomy_name("").is_err());
        assert!(validate_taxonomy_name("..").is_err());
        assert!(validate_taxonomy_name(".hidden").is_err());
        assert!(validate_taxonomy_name("a/b").is_err());
    }

    #[test]
    fn test_missing_index_is_none_without_embedder() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().join("indices")).unwrap();
        assert!(store.get("brsr", None).unwrap().is_none());
        assert!(matches!(
            store.load("brsr", false),
            Err(CoreError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn test_lookups_of_unknown_names_keep_no_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().join("indices")).unwrap();

        for i in 0..50 {
            let name = format!("unknown-{i}");
            assert!(store.get(&name, None).unwrap().is_none());
            assert!(store.load(&name, true).is_err());
        }
        assert_eq!(store.key_lock_count(), 0);

        assert!(!store.remove("unknown-0", true).unwrap());
        assert_eq!(store.key_lock_count(), 0);
    }

    #[test]
    fn test_clear_from_disk_recreates_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("indices");
        let store = IndexStore::new(root.clone()).unwrap();
        std::fs::create_dir_all(root.join("junk")).unwrap();

        store.clear(true).unwrap();
        assert!(root.exists());
        assert!(!root.join("junk").exists());
    }

    #[test]
    fn test_save_without_index_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf()).unwrap();
        assert!(matches!(
            store.save("brsr", None),
            Err(CoreError::IndexNotFound { .. })
        ));
    }
}
