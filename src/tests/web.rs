use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower::ServiceExt;

use crate::app::App;
use crate::tests::stubs::{
    create_app, entries, publish_models, seed_taxonomy, HashEmbedder, StubLoader,
};
use crate::web::router;

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// App with a running queue, stub models and one seeded taxonomy.
fn serving_app(tmp: &tempfile::TempDir) -> Arc<RwLock<App>> {
    let mut app = create_app(tmp.path(), Arc::new(StubLoader::new(4)));
    publish_models(&app, Arc::new(HashEmbedder::new(4)));
    seed_taxonomy(app.metadata().as_ref(), "brsr", entries(12));
    app.run_queue();
    Arc::new(RwLock::new(app))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ready_flips_after_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let app = Arc::new(RwLock::new(create_app(
        tmp.path(),
        Arc::new(StubLoader::new(4)),
    )));
    let router = router(app.clone());

    let (status, body) = send(&router, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);

    let (status, body) = send(&router, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["embedder_loaded"], false);

    {
        let app = app.read().await;
        tokio::task::block_in_place(|| app.startup()).unwrap();
    }

    let (status, body) = send(&router, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_errors_map_to_status() {
    let tmp = tempfile::tempdir().unwrap();
    let router = router(serving_app(&tmp));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/query",
        Some(json!({"query": "energy", "taxonomy": "unknown"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "INDEX_NOT_FOUND");
    assert!(body["error"]["id"].is_string());

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/query",
        Some(json!({"query": "  ", "taxonomy": "brsr"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_then_query() {
    let tmp = tempfile::tempdir().unwrap();
    let router = router(serving_app(&tmp));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/jobs/build_index",
        Some(json!({"taxonomy": "brsr"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["already_running"], false);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let uri = format!("/api/v1/jobs/status/{job_id}");
    let mut record = Value::Null;
    for _ in 0..500 {
        let (status, body) = send(&router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        record = body;
        if record["status"] == "completed" || record["status"] == "failed" {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(record["status"], "completed");
    assert_eq!(record["progress"], 100);
    assert_eq!(record["total"], 12);

    let (status, body) = send(&router, Method::GET, "/api/v1/jobs/status/all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get(job_id.as_str()).is_some());

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/query",
        Some(json!({"query": "reference text number 7", "taxonomy": "brsr", "k": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["tag"], "TAG_0007");
    assert_eq!(results[0]["score"], 1.0);
    assert_eq!(results[0]["rank"], 1);

    let (status, body) = send(&router, Method::GET, "/api/v1/jobs/index_cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached_indices"], 1);
    assert_eq!(body["cache_keys"], json!(["brsr"]));
    assert_eq!(body["disk_keys"], json!(["brsr"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_validation_and_unknown_job() {
    let tmp = tempfile::tempdir().unwrap();
    let router = router(serving_app(&tmp));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/jobs/build_index",
        Some(json!({"taxonomy": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(&router, Method::GET, "/api/v1/jobs/status/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_model_settings_routes() {
    let tmp = tempfile::tempdir().unwrap();
    let router = router(serving_app(&tmp));

    let (status, body) = send(&router, Method::GET, "/api/v1/models/active_models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["active_embedder_id"].is_null());

    let (status, _) = send(&router, Method::POST, "/api/v1/models/reload_models", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&router, Method::GET, "/api/v1/models/active_models", None).await;
    assert_eq!(status, StatusCode::OK);
    let embedder_id = body["active_embedder_id"].as_u64().unwrap();
    let reranker_id = body["active_reranker_id"].as_u64().unwrap();
    assert_eq!(body["loaded_embedder_id"], embedder_id);
    assert_eq!(body["reranker"]["normalize_method"], "softmax");

    let (status, body) = send(
        &router,
        Method::PUT,
        "/api/v1/models/settings",
        Some(json!({"active_embedder_id": 9998, "active_reranker_id": 9999})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = send(
        &router,
        Method::PUT,
        "/api/v1/models/settings",
        Some(json!({"active_embedder_id": embedder_id, "active_reranker_id": reranker_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!("/api/v1/models/embedders/{embedder_id}");
    let (status, body) = send(&router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, body) = send(&router, Method::GET, "/api/v1/models/rerankers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_taxonomy_routes() {
    let tmp = tempfile::tempdir().unwrap();
    let router = router(serving_app(&tmp));

    let (status, body) = send(&router, Method::GET, "/api/v1/taxonomies", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "brsr");

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/v1/taxonomies/brsr/entries",
        Some(json!({"entries": [{"tag": "NEW_TAG", "datatype": "text", "reference": "new"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], 1);

    let (status, _) = send(&router, Method::DELETE, "/api/v1/taxonomies/brsr", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&router, Method::DELETE, "/api/v1/taxonomies/brsr", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
