//! HTTP server.
//!
//! Exposes refresh jobs, the knowledge base and the semantic router as a
//! JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/projects/{project_id}/agents/{agent_kind}/refresh` | Start (or join) a refresh job; `202` |
//! | `GET`  | `/projects/{project_id}/agents/{agent_kind}/status` | Job snapshot, or `{"status": "none"}` |
//! | `GET`  | `/projects/{project_id}/entities` | Entities; `kind`, `category`, `priority`, `source_document_id` filters |
//! | `GET`  | `/entities/{entity_id}/details` | An entity and its detail records |
//! | `POST` | `/route` | Route a data request between agents |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown agent kind" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `rejected` (429),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::PipelineError;
use crate::jobs::JobManager;
use crate::models::{EntityFilter, EntityKind};
use crate::pipeline::{Pipeline, Services};
use crate::router::{register_store_functions, SemanticRouter};
use crate::store::KnowledgeStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KnowledgeStore>,
    pub jobs: JobManager,
    pub router: Arc<SemanticRouter>,
}

impl AppState {
    /// Wire the pipeline, job manager and router over one set of services.
    pub async fn build(services: Services, config: &Config) -> anyhow::Result<Self> {
        let pipeline = Arc::new(Pipeline::new(services.clone(), config));
        let jobs = JobManager::new(pipeline, &config.jobs);

        let mut router = SemanticRouter::new(services.embedder.clone(), config.router.threshold);
        register_store_functions(&mut router, services.store.clone()).await?;

        Ok(Self {
            store: services.store,
            jobs,
            router: Arc::new(router),
        })
    }
}

/// Build the axum application for `state`.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/projects/{project_id}/agents/{agent_kind}/refresh",
            post(handle_refresh),
        )
        .route(
            "/projects/{project_id}/agents/{agent_kind}/status",
            get(handle_status),
        )
        .route("/projects/{project_id}/entities", get(handle_entities))
        .route("/entities/{entity_id}/details", get(handle_details))
        .route("/route", post(handle_route))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::open(config).await?;
    let state = AppState::build(services, config).await?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    println!("Listening on http://{}", config.server.bind);

    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %format!("{:#}", err), "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{:#}", err),
    }
}

fn parse_kind(raw: &str) -> Result<EntityKind, AppError> {
    raw.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Refresh jobs ============

async fn handle_refresh(
    State(state): State<AppState>,
    Path((project_id, agent_kind)): Path<(String, String)>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let kind = parse_kind(&agent_kind)?;
    match state.jobs.start(&project_id, kind, true) {
        Ok(job) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job.job_id, "status": job.status })),
        )),
        Err(err @ PipelineError::JobRejected { .. }) => Err(AppError {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "rejected",
            message: err.to_string(),
        }),
        Err(err) => Err(internal(err.into())),
    }
}

async fn handle_status(
    State(state): State<AppState>,
    Path((project_id, agent_kind)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let kind = parse_kind(&agent_kind)?;
    let body = match state.jobs.poll(&project_id, kind) {
        Some(snapshot) => serde_json::to_value(snapshot).map_err(|e| internal(e.into()))?,
        None => json!({ "status": "none" }),
    };
    Ok(Json(body))
}

// ============ Knowledge base ============

#[derive(Deserialize)]
struct EntitiesQuery {
    kind: Option<String>,
    category: Option<String>,
    priority: Option<String>,
    source_document_id: Option<String>,
}

async fn handle_entities(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<Value>, AppError> {
    let kinds = match query.kind.as_deref() {
        Some(raw) => vec![parse_kind(raw)?],
        None => EntityKind::ALL.to_vec(),
    };
    let filter = EntityFilter {
        category: query.category,
        priority: query.priority,
        source_document_id: query.source_document_id,
    };

    let mut entities = Vec::new();
    for kind in kinds {
        entities.extend(
            state
                .store
                .get_entities(&project_id, kind, &filter)
                .await
                .map_err(internal)?,
        );
    }
    Ok(Json(json!({ "entities": entities })))
}

async fn handle_details(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let entity = state
        .store
        .get_entity(&entity_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("entity not found: {}", entity_id)))?;
    let details = state
        .store
        .get_details(&entity_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "entity": entity, "details": details })))
}

// ============ POST /route ============

#[derive(Deserialize)]
struct RouteRequest {
    query: String,
    requesting_agent: String,
    project_id: String,
    #[serde(default)]
    kwargs: Value,
}

async fn handle_route(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Result<Json<Value>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let hit = state
        .router
        .route(&req.query, &req.requesting_agent, &req.project_id, &req.kwargs)
        .await
        .map_err(internal)?;

    let body = match hit {
        Some(hit) => json!({
            "result": hit.data,
            "function": format!("{}.{}", hit.agent_name, hit.function_name),
            "score": hit.score,
        }),
        None => json!({ "result": null }),
    };
    Ok(Json(body))
}
