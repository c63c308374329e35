//! Relational metadata behind the retrieval core.
//!
//! Taxonomies, their entries, model descriptors and the active-model pointer
//! live in a `Catalog`. Every write goes through `MetadataStore::transaction`,
//! which applies the mutation to a copy, persists it, and only then publishes it.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::NormalizeMethod;
use crate::storage::StorageManager;

const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{kind} {id} is active; switch the active model first")]
    ActiveModelInUse { kind: &'static str, id: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid metadata: {0}")]
    Invalid(String),
}

impl MetadataError {
    fn not_found(kind: &'static str, name: impl ToString) -> Self {
        MetadataError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Embedder,
    Reranker,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Embedder => "embedder",
            ModelKind::Reranker => "reranker",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub id: u64,
    pub taxonomy_id: u64,
    pub tag: String,
    pub datatype: String,
    /// Text that gets embedded; `tag` and `datatype` are payload only
    #[serde(default)]
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Entry as supplied by an import or an API client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub tag: String,
    #[serde(alias = "type", default)]
    pub datatype: String,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: u64,
    pub name: String,
    pub version: String,
    pub path: String,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize_method: Option<NormalizeMethod>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveModelSetting {
    pub active_embedder_id: Option<u64>,
    pub active_reranker_id: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

/// The full metadata state. Mutated only inside a transaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    taxonomies: Vec<Taxonomy>,
    #[serde(default)]
    entries: Vec<TaxonomyEntry>,
    #[serde(default)]
    embedders: Vec<ModelDescriptor>,
    #[serde(default)]
    rerankers: Vec<ModelDescriptor>,
    #[serde(default)]
    active: Option<ActiveModelSetting>,
    #[serde(default)]
    next_id: u64,
}

impl Catalog {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn models(&self, kind: ModelKind) -> &Vec<ModelDescriptor> {
        match kind {
            ModelKind::Embedder => &self.embedders,
            ModelKind::Reranker => &self.rerankers,
        }
    }

    fn models_mut(&mut self, kind: ModelKind) -> &mut Vec<ModelDescriptor> {
        match kind {
            ModelKind::Embedder => &mut self.embedders,
            ModelKind::Reranker => &mut self.rerankers,
        }
    }

    pub fn taxonomy_by_name(&self, name: &str) -> Option<&Taxonomy> {
        self.taxonomies.iter().find(|t| t.name == name)
    }

    pub fn model(&self, kind: ModelKind, id: u64) -> Option<&ModelDescriptor> {
        self.models(kind).iter().find(|m| m.id == id)
    }

    pub fn find_model_by_path(&self, kind: ModelKind, path: &str) -> Option<&ModelDescriptor> {
        self.models(kind).iter().find(|m| m.path == path)
    }

    pub fn active_setting(&self) -> Option<&ActiveModelSetting> {
        self.active.as_ref()
    }

    pub fn create_taxonomy(
        &mut self,
        name: &str,
        description: Option<String>,
        source_file: Option<String>,
    ) -> Result<Taxonomy, MetadataError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MetadataError::Invalid("taxonomy name is empty".to_string()));
        }
        if self.taxonomy_by_name(name).is_some() {
            return Err(MetadataError::AlreadyExists(format!("taxonomy '{name}'")));
        }

        let taxonomy = Taxonomy {
            id: self.next_id(),
            name: name.to_string(),
            description,
            source_file,
            created_at: Utc::now(),
        };
        self.taxonomies.push(taxonomy.clone());
        Ok(taxonomy)
    }

    /// Removes the taxonomy together with all of its entries.
    pub fn delete_taxonomy(&mut self, name: &str) -> Result<Taxonomy, MetadataError> {
        let pos = self
            .taxonomies
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| MetadataError::not_found("taxonomy", name))?;
        let taxonomy = self.taxonomies.remove(pos);
        self.entries.retain(|e| e.taxonomy_id != taxonomy.id);
        Ok(taxonomy)
    }

    pub fn add_entries(
        &mut self,
        taxonomy_id: u64,
        entries: Vec<NewEntry>,
    ) -> Result<Vec<TaxonomyEntry>, MetadataError> {
        if !self.taxonomies.iter().any(|t| t.id == taxonomy_id) {
            return Err(MetadataError::not_found("taxonomy", taxonomy_id));
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.tag.trim().is_empty() {
                return Err(MetadataError::Invalid("entry tag is empty".to_string()));
            }
            let row = TaxonomyEntry {
                id: self.next_id(),
                taxonomy_id,
                tag: entry.tag,
                datatype: entry.datatype,
                reference: entry.reference,
                created_at: now,
            };
            self.entries.push(row.clone());
            created.push(row);
        }
        Ok(created)
    }

    pub fn update_entry(
        &mut self,
        entry_id: u64,
        update: NewEntry,
    ) -> Result<TaxonomyEntry, MetadataError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| MetadataError::not_found("entry", entry_id))?;
        entry.tag = update.tag;
        entry.datatype = update.datatype;
        entry.reference = update.reference;
        Ok(entry.clone())
    }

    pub fn delete_entry(&mut self, entry_id: u64) -> Result<(), MetadataError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == entry_id)
            .ok_or_else(|| MetadataError::not_found("entry", entry_id))?;
        self.entries.remove(pos);
        Ok(())
    }

    pub fn create_model(
        &mut self,
        kind: ModelKind,
        name: &str,
        version: &str,
        path: &str,
        normalize_method: Option<NormalizeMethod>,
    ) -> ModelDescriptor {
        let descriptor = ModelDescriptor {
            id: self.next_id(),
            name: name.to_string(),
            version: version.to_string(),
            path: path.to_string(),
            is_active: false,
            normalize_method: match kind {
                ModelKind::Embedder => None,
                ModelKind::Reranker => normalize_method,
            },
            created_at: Utc::now(),
        };
        self.models_mut(kind).push(descriptor.clone());
        descriptor
    }

    /// Overwrite a descriptor in place, keeping its id and active flag.
    pub fn update_model(
        &mut self,
        kind: ModelKind,
        id: u64,
        name: &str,
        version: &str,
        path: &str,
    ) -> Result<ModelDescriptor, MetadataError> {
        let descriptor = self
            .models_mut(kind)
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| MetadataError::not_found(kind.as_str(), id))?;
        descriptor.name = name.to_string();
        descriptor.version = version.to_string();
        descriptor.path = path.to_string();
        Ok(descriptor.clone())
    }

    pub fn delete_model(&mut self, kind: ModelKind, id: u64) -> Result<(), MetadataError> {
        let active_id = self.active.as_ref().and_then(|a| match kind {
            ModelKind::Embedder => a.active_embedder_id,
            ModelKind::Reranker => a.active_reranker_id,
        });
        if active_id == Some(id) {
            return Err(MetadataError::ActiveModelInUse {
                kind: kind.as_str(),
                id,
            });
        }

        let models = self.models_mut(kind);
        let pos = models
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MetadataError::not_found(kind.as_str(), id))?;
        models.remove(pos);
        Ok(())
    }

    /// Point the singleton setting at a new pair. Both ids must exist.
    pub fn set_active(
        &mut self,
        embedder_id: u64,
        reranker_id: u64,
    ) -> Result<ActiveModelSetting, MetadataError> {
        if self.model(ModelKind::Embedder, embedder_id).is_none() {
            return Err(MetadataError::not_found("embedder", embedder_id));
        }
        if self.model(ModelKind::Reranker, reranker_id).is_none() {
            return Err(MetadataError::not_found("reranker", reranker_id));
        }

        for m in self.embedders.iter_mut() {
            m.is_active = m.id == embedder_id;
        }
        for m in self.rerankers.iter_mut() {
            m.is_active = m.id == reranker_id;
        }

        let setting = ActiveModelSetting {
            active_embedder_id: Some(embedder_id),
            active_reranker_id: Some(reranker_id),
            updated_at: Utc::now(),
        };
        self.active = Some(setting.clone());
        Ok(setting)
    }
}

/// Narrow repository interface consumed by the retrieval core.
pub trait MetadataStore: Send + Sync {
    fn get_taxonomy_by_name(&self, name: &str) -> Result<Option<Taxonomy>, MetadataError>;
    fn list_taxonomies(&self) -> Result<Vec<Taxonomy>, MetadataError>;
    fn count_entries(&self, taxonomy_id: u64) -> Result<usize, MetadataError>;
    /// Entries of one taxonomy in insertion order.
    fn list_entries(
        &self,
        taxonomy_id: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TaxonomyEntry>, MetadataError>;
    fn get_active_setting(&self) -> Result<Option<ActiveModelSetting>, MetadataError>;
    fn get_model(&self, kind: ModelKind, id: u64) -> Result<Option<ModelDescriptor>, MetadataError>;
    fn list_models(&self, kind: ModelKind) -> Result<Vec<ModelDescriptor>, MetadataError>;

    /// Run `f` against a private copy; commit only if it and persistence succeed.
    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut Catalog) -> Result<(), MetadataError>,
    ) -> Result<(), MetadataError>;
}

/// Typed wrapper around `MetadataStore::transaction`.
pub fn write<T>(
    store: &dyn MetadataStore,
    f: impl FnOnce(&mut Catalog) -> Result<T, MetadataError>,
) -> Result<T, MetadataError> {
    let mut f = Some(f);
    let mut out = None;
    store.transaction(&mut |catalog: &mut Catalog| {
        let f = f
            .take()
            .ok_or_else(|| MetadataError::Invalid("transaction body reused".to_string()))?;
        out = Some(f(catalog)?);
        Ok(())
    })?;
    out.ok_or_else(|| MetadataError::Invalid("transaction produced no value".to_string()))
}

pub struct CatalogStore {
    catalog: RwLock<Catalog>,
    storage: Option<Arc<dyn StorageManager>>,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    /// Catalog that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            storage: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Catalog persisted as `catalog.json` through `storage`.
    pub fn open(storage: Arc<dyn StorageManager>) -> Result<Self, MetadataError> {
        let catalog = if storage.exists(CATALOG_FILE) {
            let data = storage.read(CATALOG_FILE)?;
            serde_json::from_slice(&data)?
        } else {
            log::info!("creating new catalog");
            let catalog = Catalog::default();
            storage.write(CATALOG_FILE, &serde_json::to_vec_pretty(&catalog)?)?;
            catalog
        };

        Ok(Self {
            catalog: RwLock::new(catalog),
            storage: Some(storage),
            write_lock: Mutex::new(()),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Catalog) -> T) -> T {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        f(&catalog)
    }

    fn persist(&self, catalog: &Catalog) -> Result<(), MetadataError> {
        if let Some(storage) = &self.storage {
            storage.write(CATALOG_FILE, &serde_json::to_vec_pretty(catalog)?)?;
        }
        Ok(())
    }
}

impl MetadataStore for CatalogStore {
    fn get_taxonomy_by_name(&self, name: &str) -> Result<Option<Taxonomy>, MetadataError> {
        Ok(self.read(|c| c.taxonomy_by_name(name).cloned()))
    }

    fn list_taxonomies(&self) -> Result<Vec<Taxonomy>, MetadataError> {
        Ok(self.read(|c| c.taxonomies.clone()))
    }

    fn count_entries(&self, taxonomy_id: u64) -> Result<usize, MetadataError> {
        Ok(self.read(|c| {
            c.entries
                .iter()
                .filter(|e| e.taxonomy_id == taxonomy_id)
                .count()
        }))
    }

    fn list_entries(
        &self,
        taxonomy_id: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TaxonomyEntry>, MetadataError> {
        Ok(self.read(|c| {
            c.entries
                .iter()
                .filter(|e| e.taxonomy_id == taxonomy_id)
                .skip(offset)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    fn get_active_setting(&self) -> Result<Option<ActiveModelSetting>, MetadataError> {
        Ok(self.read(|c| c.active.clone()))
    }

    fn get_model(&self, kind: ModelKind, id: u64) -> Result<Option<ModelDescriptor>, MetadataError> {
        Ok(self.read(|c| c.model(kind, id).cloned()))
    }

    fn list_models(&self, kind: ModelKind) -> Result<Vec<ModelDescriptor>, MetadataError> {
        Ok(self.read(|c| c.models(kind).clone()))
    }

    fn transaction(
        &self,
        f: &mut dyn FnMut(&mut Catalog) -> Result<(), MetadataError>,
    ) -> Result<(), MetadataError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut draft = self.read(Catalog::clone);
        if let Err(err) = f(&mut draft) {
            log::debug!("rolling back catalog transaction: {err}");
            return Err(err);
        }

        if let Err(err) = self.persist(&draft) {
            log::error!("failed to persist catalog, rolling back: {err}");
            return Err(err);
        }

        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = draft;
        Ok(())
    }
}

/// Parse `tag,type,reference` rows. The `datatype` header is accepted too.
pub fn read_entries_csv<R: io::Read>(reader: R) -> Result<Vec<NewEntry>, MetadataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut entries = vec![];
    for record in csv_reader.deserialize::<NewEntry>() {
        let mut entry = record?;
        if entry.tag.is_empty() {
            continue;
        }
        if entry.reference.as_deref().is_some_and(str::is_empty) {
            entry.reference = None;
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendLocal;

    struct FailingStorage;

    impl StorageManager for FailingStorage {
        fn write(&self, _ident: &str, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn read(&self, _ident: &str) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        }
        fn exists(&self, _ident: &str) -> bool {
            false
        }
        fn delete(&self, _ident: &str) -> io::Result<()> {
            Ok(())
        }
    }

    fn entries(n: usize) -> Vec<NewEntry> {
        (0..n)
            .map(|i| NewEntry {
                tag: format!("tag{i}"),
                datatype: "text".to_string(),
                reference: Some(format!("reference {i}")),
            })
            .collect()
    }

    #[test]
    fn test_entries_paginate_in_insertion_order() {
        let store = CatalogStore::in_memory();
        let tax = write(&store, |c| c.create_taxonomy("brsr", None, None)).unwrap();
        write(&store, |c| c.add_entries(tax.id, entries(5))).unwrap();

        assert_eq!(store.count_entries(tax.id).unwrap(), 5);
        let page = store.list_entries(tax.id, 2, 2).unwrap();
        let tags: Vec<_> = page.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["tag2", "tag3"]);
        assert!(store.list_entries(tax.id, 5, 10).unwrap().is_empty());
    }

    #[test]
    fn test_failed_body_rolls_back() {
        let store = CatalogStore::in_memory();
        let result = write(&store, |c| {
            c.create_taxonomy("brsr", None, None)?;
            c.create_taxonomy("brsr", None, None)
        });

        assert!(matches!(result, Err(MetadataError::AlreadyExists(_))));
        assert!(store.get_taxonomy_by_name("brsr").unwrap().is_none());
    }

    #[test]
    fn test_failed_persist_rolls_back_and_propagates() {
        let store = CatalogStore {
            catalog: RwLock::new(Catalog::default()),
            storage: Some(Arc::new(FailingStorage)),
            write_lock: Mutex::new(()),
        };

        let result = write(&store, |c| c.create_taxonomy("esrs", None, None));
        assert!(matches!(result, Err(MetadataError::Io(_))));
        assert!(store.list_taxonomies().unwrap().is_empty());
    }

    #[test]
    fn test_catalog_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(tmp.path()).unwrap());

        {
            let store = CatalogStore::open(storage.clone()).unwrap();
            let tax = write(&store, |c| c.create_taxonomy("brsr", None, None)).unwrap();
            write(&store, |c| c.add_entries(tax.id, entries(3))).unwrap();
        }

        let store = CatalogStore::open(storage).unwrap();
        let tax = store.get_taxonomy_by_name("brsr").unwrap().unwrap();
        assert_eq!(store.count_entries(tax.id).unwrap(), 3);
    }

    #[test]
    fn test_delete_taxonomy_cascades() {
        let store = CatalogStore::in_memory();
        let a = write(&store, |c| c.create_taxonomy("a", None, None)).unwrap();
        let b = write(&store, |c| c.create_taxonomy("b", None, None)).unwrap();
        write(&store, |c| c.add_entries(a.id, entries(2))).unwrap();
        write(&store, |c| c.add_entries(b.id, entries(3))).unwrap();

        write(&store, |c| c.delete_taxonomy("a")).unwrap();
        assert_eq!(store.count_entries(a.id).unwrap(), 0);
        assert_eq!(store.count_entries(b.id).unwrap(), 3);
    }

    #[test]
    fn test_active_model_cannot_be_deleted() {
        let store = CatalogStore::in_memory();
        let (emb, rr) = write(&store, |c| {
            let emb = c.create_model(ModelKind::Embedder, "e", "1", "/m/e", None);
            let rr = c.create_model(
                ModelKind::Reranker,
                "r",
                "1",
                "/m/r",
                Some(NormalizeMethod::Sigmoid),
            );
            c.set_active(emb.id, rr.id)?;
            Ok((emb, rr))
        })
        .unwrap();

        let err = write(&store, |c| c.delete_model(ModelKind::Embedder, emb.id)).unwrap_err();
        assert!(matches!(err, MetadataError::ActiveModelInUse { .. }));

        let other = write(&store, |c| {
            Ok(c.create_model(ModelKind::Embedder, "e2", "1", "/m/e2", None))
        })
        .unwrap();
        write(&store, |c| c.set_active(other.id, rr.id)).unwrap();
        write(&store, |c| c.delete_model(ModelKind::Embedder, emb.id)).unwrap();

        let active = store.get_active_setting().unwrap().unwrap();
        assert_eq!(active.active_embedder_id, Some(other.id));
        assert!(store.get_model(ModelKind::Embedder, other.id).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_set_active_rejects_unknown_ids() {
        let store = CatalogStore::in_memory();
        let err = write(&store, |c| c.set_active(1, 2)).unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
        assert!(store.get_active_setting().unwrap().is_none());
    }

    #[test]
    fn test_read_entries_csv_accepts_type_header() {
        let data = "tag,type,reference\nA1, text ,Revenue from operations\nA2,number,\n,,skipped\n";
        let parsed = read_entries_csv(data.as_bytes()).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].datatype, "text");
        assert_eq!(parsed[0].reference.as_deref(), Some("Revenue from operations"));
        assert_eq!(parsed[1].reference, None);
    }
}
