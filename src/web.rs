use crate::{
    app::{ActiveModelsView, App, BuildAdmission},
    catalog::{ModelDescriptor, ModelKind, NewEntry, Taxonomy},
    eid::Eid,
    errors::CoreError,
    index::IndexStats,
    jobs::{JobId, JobRecord},
    query::{QueryRequest, QueryResponse},
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{signal, sync::RwLock};

#[derive(Clone)]
struct SharedState {
    app: Arc<RwLock<App>>,
}

async fn shutdown_signal(app: Arc<RwLock<App>>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
    let mut app = app.write().await;
    tokio::task::block_in_place(|| app.shutdown());
}

pub fn router(app: Arc<RwLock<App>>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/v1/jobs/build_index", post(build_index))
        .route("/api/v1/jobs/status/all", get(job_status_all))
        .route("/api/v1/jobs/status/:job_id", get(job_status))
        .route("/api/v1/jobs/index_cache/stats", get(index_cache_stats))
        .route("/api/v1/query", post(query))
        .route("/api/v1/models/active_models", get(active_models))
        .route("/api/v1/models/embedders", get(list_embedders))
        .route("/api/v1/models/rerankers", get(list_rerankers))
        .route("/api/v1/models/embedders/:id", delete(delete_embedder))
        .route("/api/v1/models/rerankers/:id", delete(delete_reranker))
        .route("/api/v1/models/settings", put(update_settings))
        .route("/api/v1/models/reload_models", post(reload_models))
        .route("/api/v1/taxonomies", get(list_taxonomies))
        .route("/api/v1/taxonomies/:name", delete(delete_taxonomy))
        .route("/api/v1/taxonomies/:name/entries", post(add_entries))
        .route("/api/v1/health", get(health))
        .route("/ready", get(ready))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(app: App) -> anyhow::Result<()> {
    let listen_addr = app.config().listen_addr.clone();
    let app = Arc::new(RwLock::new(app));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    log::info!("listening on {listen_addr}");

    // serve health checks while models load; /ready flips once this is done
    tokio::task::spawn_blocking({
        let app = app.clone();
        move || {
            let app = app.blocking_read();
            match app.startup() {
                Ok(()) => log::info!("startup complete"),
                Err(err) => log::error!("startup failed: {err:?}"),
            }
        }
    });

    axum::serve(listener, router(app.clone()))
        .with_graceful_shutdown(shutdown_signal(app))
        .await
        .context("serving http")?;

    Ok(())
}

pub fn start_daemon(app: App) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(start_app(app))
}

#[derive(Debug)]
struct HttpError(CoreError);

impl HttpError {
    fn status(&self) -> StatusCode {
        match self.0.code() {
            "INDEX_NOT_FOUND" | "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONFLICT" | "DIMENSION_MISMATCH" => StatusCode::CONFLICT,
            "VALIDATION_ERROR" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{:?}", self.0);
        } else {
            log::debug!("{}", self.0);
        }

        let body = json!({
            "error": {
                "id": Eid::new(),
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<CoreError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BuildIndexRequest {
    #[serde(default)]
    pub taxonomy: String,
}

async fn build_index(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<BuildIndexRequest>,
) -> Result<Json<BuildAdmission>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.start_build(&payload.taxonomy)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn job_status_all(
    State(state): State<Arc<SharedState>>,
) -> Json<BTreeMap<JobId, JobRecord>> {
    let app = state.app.read().await;
    Json(app.jobs().all())
}

async fn job_status(
    State(state): State<Arc<SharedState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, HttpError> {
    let app = state.app.read().await;
    app.job(&Eid::from(job_id.as_str()))
        .map(Json)
        .ok_or_else(|| {
            HttpError(CoreError::Metadata(crate::catalog::MetadataError::NotFound {
                kind: "job",
                name: job_id,
            }))
        })
}

async fn index_cache_stats(State(state): State<Arc<SharedState>>) -> Json<IndexStats> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || Json(app.blocking_read().cache_stats()))
}

async fn query(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.query(&payload).map(Json).map_err(Into::into)
    })
}

async fn active_models(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<ActiveModelsView>, HttpError> {
    let app = state.app.read().await;
    Ok(Json(app.active_models()?))
}

async fn list_embedders(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<ModelDescriptor>>, HttpError> {
    let app = state.app.read().await;
    Ok(Json(app.list_models(ModelKind::Embedder)?))
}

async fn list_rerankers(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<ModelDescriptor>>, HttpError> {
    let app = state.app.read().await;
    Ok(Json(app.list_models(ModelKind::Reranker)?))
}

async fn delete_embedder(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.blocking_read().delete_model(ModelKind::Embedder, id)?;
        Ok(Json(json!({"message": "Embedder deleted successfully"})))
    })
}

async fn delete_reranker(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.blocking_read().delete_model(ModelKind::Reranker, id)?;
        Ok(Json(json!({"message": "Reranker deleted successfully"})))
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateSettingsRequest {
    pub active_embedder_id: u64,
    pub active_reranker_id: u64,
}

async fn update_settings(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<UpdateSettingsRequest>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.blocking_read()
            .set_active_models(payload.active_embedder_id, payload.active_reranker_id)?;
        Ok(Json(json!({"message": "Settings updated successfully"})))
    })
}

async fn reload_models(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.blocking_read().reload_models()?;
        Ok(Json(json!({"message": "Active models reloaded."})))
    })
}

async fn list_taxonomies(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<Taxonomy>>, HttpError> {
    let app = state.app.read().await;
    Ok(Json(app.list_taxonomies()?))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddEntriesRequest {
    pub entries: Vec<NewEntry>,
}

async fn add_entries(
    State(state): State<Arc<SharedState>>,
    Path(name): Path<String>,
    Json(payload): Json<AddEntriesRequest>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        let added = app.blocking_read().add_entries(&name, payload.entries)?;
        Ok(Json(json!({"taxonomy": name, "added": added})))
    })
}

async fn delete_taxonomy(
    State(state): State<Arc<SharedState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();
    tokio::task::block_in_place(move || {
        app.blocking_read().delete_taxonomy(&name)?;
        Ok(Json(json!({"message": format!("Taxonomy '{name}' deleted")})))
    })
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let app = state.app.read().await;
    let models = app.registry().snapshot();
    Json(json!({
        "status": "ok",
        "app_name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "ready": app.is_ready(),
        "embedder_loaded": models.embedder().is_ok(),
        "reranker_loaded": models.reranker().is_ok(),
    }))
}

async fn ready(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    let app = state.app.read().await;
    if app.is_ready() {
        (StatusCode::OK, Json(json!({"ready": true})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ready": false})))
    }
}
