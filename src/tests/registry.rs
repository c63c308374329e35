use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::catalog::{self, CatalogStore, MetadataStore, ModelKind};
use crate::errors::CoreError;
use crate::models::{ModelPaths, ModelRegistry, NormalizeMethod};
use crate::tests::stubs::StubLoader;

fn registry(tmp: &tempfile::TempDir, loader: Arc<StubLoader>) -> ModelRegistry {
    ModelRegistry::new(
        loader,
        ModelPaths {
            model_dir: tmp.path().join("models"),
            runtime_dir: tmp.path().join("runtime"),
            base_embedder: "bge-small-en-v1.5".to_string(),
            base_reranker: "bge-reranker-base".to_string(),
        },
    )
}

fn model_dir(root: &Path, name: &str, content: &[u8]) -> String {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("model.onnx"), content).unwrap();
    dir.to_string_lossy().to_string()
}

#[test]
fn test_bootstrap_on_empty_catalog() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    let models = registry.load_models(&metadata).unwrap();
    assert_eq!(loader.fetches.load(Ordering::SeqCst), 2);
    assert!(models.embedder().is_ok());
    assert!(models.reranker().is_ok());
    assert_eq!(models.embedding_dimension().unwrap(), 4);

    let embedders = metadata.list_models(ModelKind::Embedder).unwrap();
    let rerankers = metadata.list_models(ModelKind::Reranker).unwrap();
    assert_eq!(embedders.len(), 1);
    assert_eq!(rerankers.len(), 1);
    assert_eq!(embedders[0].name, "bge-small-en-v1.5");
    assert_eq!(embedders[0].version, "base");
    assert!(embedders[0].is_active);
    assert_eq!(rerankers[0].normalize_method, Some(NormalizeMethod::Softmax));

    let setting = metadata.get_active_setting().unwrap().unwrap();
    assert_eq!(setting.active_embedder_id, Some(embedders[0].id));
    assert_eq!(setting.active_reranker_id, Some(rerankers[0].id));
    assert_eq!(models.embedder_id, Some(embedders[0].id));
    assert_eq!(models.reranker_id, Some(rerankers[0].id));
}

#[test]
fn test_reload_after_bootstrap_fetches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    let first = registry.load_models(&metadata).unwrap();
    let second = registry.load_models(&metadata).unwrap();

    assert_eq!(loader.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(first.embedder_id, second.embedder_id);
    assert_eq!(metadata.list_models(ModelKind::Embedder).unwrap().len(), 1);
    // the earlier snapshot is still usable
    assert!(first.embedder().is_ok());
    assert!(Arc::ptr_eq(&registry.snapshot(), &second));
}

#[test]
fn test_bootstrap_retry_after_partial_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    *loader.fail_reranker_fetch.lock().unwrap() = true;
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    assert!(registry.load_models(&metadata).is_err());
    assert!(metadata.get_active_setting().unwrap().is_none());
    assert!(registry.snapshot().embedder().is_err());

    registry.load_models(&metadata).unwrap();
    assert_eq!(metadata.list_models(ModelKind::Embedder).unwrap().len(), 1);
    assert_eq!(metadata.list_models(ModelKind::Reranker).unwrap().len(), 1);
    assert!(metadata.get_active_setting().unwrap().is_some());
}

#[test]
fn test_bootstrap_reuses_descriptor_at_base_path() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    let base_path = tmp
        .path()
        .join("models")
        .join("bge-small-en-v1.5")
        .to_string_lossy()
        .to_string();
    let missing = tmp.path().join("gone").to_string_lossy().to_string();
    let (embedder_id, reranker_id) = catalog::write(&metadata, |c| {
        let e = c.create_model(ModelKind::Embedder, "old", "1", &base_path, None);
        let r = c.create_model(ModelKind::Reranker, "old", "1", &missing, None);
        c.set_active(e.id, r.id)?;
        Ok((e.id, r.id))
    })
    .unwrap();

    // model files are missing on disk, so this bootstraps
    let models = registry.load_models(&metadata).unwrap();
    assert_eq!(loader.fetches.load(Ordering::SeqCst), 2);

    let embedders = metadata.list_models(ModelKind::Embedder).unwrap();
    assert_eq!(embedders.len(), 1);
    assert_eq!(embedders[0].id, embedder_id);
    assert_eq!(embedders[0].name, "bge-small-en-v1.5");

    let rerankers = metadata.list_models(ModelKind::Reranker).unwrap();
    assert_eq!(rerankers.len(), 2);
    let setting = metadata.get_active_setting().unwrap().unwrap();
    assert_eq!(setting.active_embedder_id, Some(embedder_id));
    assert_ne!(setting.active_reranker_id, Some(reranker_id));
    assert_eq!(models.reranker_id, setting.active_reranker_id);
}

#[test]
fn test_active_model_paths_require_setting() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = registry(&tmp, Arc::new(StubLoader::new(4)));
    let metadata = CatalogStore::in_memory();

    assert!(matches!(
        registry.get_active_model_paths(&metadata),
        Err(CoreError::Config(_))
    ));

    let e_path = model_dir(tmp.path(), "e", b"e");
    let r_path = model_dir(tmp.path(), "r", b"r");
    catalog::write(&metadata, |c| {
        let e = c.create_model(ModelKind::Embedder, "e", "1", &e_path, None);
        let r = c.create_model(ModelKind::Reranker, "r", "1", &r_path, None);
        c.set_active(e.id, r.id)
    })
    .unwrap();

    let (embedder, reranker) = registry.get_active_model_paths(&metadata).unwrap();
    assert_eq!(embedder, tmp.path().join("e"));
    assert_eq!(reranker, tmp.path().join("r"));
}

#[test]
fn test_runtime_copy_is_made_once() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    let e_path = model_dir(tmp.path(), "finetuned-e", b"v1");
    let r_path = model_dir(tmp.path(), "finetuned-r", b"v1");
    let (e_id, r_id) = catalog::write(&metadata, |c| {
        let e = c.create_model(ModelKind::Embedder, "finetuned-e", "1", &e_path, None);
        let r = c.create_model(
            ModelKind::Reranker,
            "finetuned-r",
            "1",
            &r_path,
            Some(NormalizeMethod::Sigmoid),
        );
        c.set_active(e.id, r.id)?;
        Ok((e.id, r.id))
    })
    .unwrap();

    let models = registry
        .copy_active_models_to_local_runtime_and_load(&metadata)
        .unwrap();
    assert_eq!(models.reranker().unwrap().normalize_method(), NormalizeMethod::Sigmoid);
    assert_eq!(loader.fetches.load(Ordering::SeqCst), 0);

    let embedder_rt = tmp.path().join("runtime").join(format!("embedder-{e_id}"));
    let reranker_rt = tmp.path().join("runtime").join(format!("reranker-{r_id}"));
    assert_eq!(
        *loader.loaded_from.lock().unwrap(),
        vec![embedder_rt.clone(), reranker_rt.clone()]
    );
    assert_eq!(std::fs::read(embedder_rt.join("model.onnx")).unwrap(), b"v1");

    std::fs::write(tmp.path().join("finetuned-e").join("model.onnx"), b"v2").unwrap();
    registry
        .copy_active_models_to_local_runtime_and_load(&metadata)
        .unwrap();
    assert_eq!(std::fs::read(embedder_rt.join("model.onnx")).unwrap(), b"v1");
}

#[test]
fn test_runtime_copy_without_setting_bootstraps() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    let models = registry
        .copy_active_models_to_local_runtime_and_load(&metadata)
        .unwrap();
    assert_eq!(loader.fetches.load(Ordering::SeqCst), 2);
    assert!(models.embedder_id.is_some());
}

#[test]
fn test_reload_switches_active_pair() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = Arc::new(StubLoader::new(4));
    let registry = registry(&tmp, loader.clone());
    let metadata = CatalogStore::in_memory();

    let before = registry.load_models(&metadata).unwrap();

    let e_path = model_dir(tmp.path(), "finetuned-e", b"e");
    let r_path = model_dir(tmp.path(), "finetuned-r", b"r");
    let (e_id, r_id) = catalog::write(&metadata, |c| {
        let e = c.create_model(ModelKind::Embedder, "finetuned-e", "2", &e_path, None);
        let r = c.create_model(ModelKind::Reranker, "finetuned-r", "2", &r_path, None);
        c.set_active(e.id, r.id)?;
        Ok((e.id, r.id))
    })
    .unwrap();

    let after = registry.load_models(&metadata).unwrap();
    assert_eq!(after.embedder_id, Some(e_id));
    assert_eq!(after.reranker_id, Some(r_id));
    assert_eq!(after.embedder().unwrap().model_id(), "finetuned-e");
    assert_ne!(before.embedder_id, after.embedder_id);
    // previous generation untouched
    assert_eq!(before.embedder().unwrap().model_id(), "bge-small-en-v1.5");
}
