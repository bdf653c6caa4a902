//! HTTP API server.
//!
//! Exposes the knowledge-base engine as a JSON API. Identity is resolved
//! upstream (gateway or reverse proxy) and passed down as headers:
//! `x-user-id` carries the caller's integer id, `x-admin` is `true`/`1`
//! for administrators. The server trusts these headers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Upload a document (base64 body) |
//! | `GET`  | `/documents` | List the caller's documents (`?all=true` for admins) |
//! | `GET`  | `/documents/{id}/status` | Poll a document's lifecycle status |
//! | `POST` | `/documents/{id}/rename` | Set a document's display name |
//! | `DELETE` | `/documents/{id}` | Delete a document (owner or admin) |
//! | `POST` | `/query` | Hybrid retrieval over the knowledge base |
//! | `GET`  | `/admin/consistency` | Consistency report (admin) |
//! | `POST` | `/admin/clear` | Wipe the knowledge base (admin) |
//! | `POST` | `/admin/rebuild` | Rebuild index from stored files (admin) |
//! | `GET`  | `/health` | Health check (version, model, index size) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document not found: ..." } }
//! ```
//!
//! Codes: `bad_request` (400), `unsupported_format` (400),
//! `extraction_failed` (400), `empty_knowledge_base` (400),
//! `forbidden` (403), `not_found` (404), `oversized_upload` (413),
//! `embedding_failed` (502), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::{Engine, UploadRequest};
use crate::error::Error;
use crate::models::{ConsistencyReport, DocumentRecord, QueryOutcome};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(engine);

    tracing::info!(addr = %bind_addr, "server listening");
    println!("kbase server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table. Split out so tests can drive it without a socket.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_upload).get(handle_list))
        .route("/documents/{id}/status", get(handle_status))
        .route("/documents/{id}/rename", post(handle_rename))
        .route("/documents/{id}", delete(handle_delete))
        .route("/query", post(handle_query))
        .route("/admin/consistency", get(handle_consistency))
        .route("/admin/clear", post(handle_clear))
        .route("/admin/rebuild", post(handle_rebuild))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine })
}

// ============ Identity ============

/// Caller identity as asserted by the upstream proxy.
#[derive(Debug, Clone, Copy)]
struct Identity {
    user_id: i64,
    admin: bool,
}

fn identity(headers: &HeaderMap) -> Result<Identity, AppError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| bad_request("missing or invalid x-user-id header"))?;
    let admin = headers
        .get("x-admin")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    Ok(Identity { user_id, admin })
}

fn require_admin(identity: Identity) -> Result<(), AppError> {
    if identity.admin {
        Ok(())
    } else {
        Err(AppError {
            status: StatusCode::FORBIDDEN,
            code: "forbidden".to_string(),
            message: "admin access required".to_string(),
        })
    }
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
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        let (status, code) = match &err {
            Error::UnsupportedFormat(_) => (StatusCode::BAD_REQUEST, "unsupported_format"),
            Error::ExtractionFailed(_) => (StatusCode::BAD_REQUEST, "extraction_failed"),
            Error::OversizedUpload { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "oversized_upload"),
            Error::EmptyKnowledgeBase => (StatusCode::BAD_REQUEST, "empty_knowledge_base"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            Error::EmbeddingFailed(_) => (StatusCode::BAD_GATEWAY, "embedding_failed"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if !err.is_client_error() {
            tracing::error!(error = %message, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message,
        }
    }
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct UploadBody {
    filename: String,
    content_base64: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    background: bool,
}

#[derive(Serialize)]
struct UploadResponse {
    document_id: String,
    status: String,
    chunk_count: u64,
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UploadBody>,
) -> Result<Response, AppError> {
    let who = identity(&headers)?;
    if body.filename.trim().is_empty() {
        return Err(bad_request("filename must not be empty"));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&body.content_base64)
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;

    let request = UploadRequest {
        user_id: who.user_id,
        filename: body.filename,
        bytes,
        display_name: body.display_name,
    };

    if body.background {
        let pending = state.engine.register_upload(&request).await?;
        let document_id = pending.document_id.clone();
        let engine = state.engine.clone();
        tokio::spawn(async move {
            // Errors are already logged and the row is marked failed.
            let _ = engine.process_document(pending).await;
        });
        let response = UploadResponse {
            document_id,
            status: "processing".to_string(),
            chunk_count: 0,
        };
        return Ok((StatusCode::ACCEPTED, Json(response)).into_response());
    }

    let receipt = state.engine.ingest(request).await?;
    let response = UploadResponse {
        document_id: receipt.document_id,
        status: receipt.status.as_str().to_string(),
        chunk_count: receipt.chunk_count,
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    all: bool,
}

#[derive(Serialize)]
struct DocumentSummary {
    id: String,
    name: String,
    status: String,
    chunk_count: i64,
    uploaded_at: i64,
}

#[derive(Serialize)]
struct ListResponse {
    documents: Vec<DocumentSummary>,
}

fn summarize(record: &DocumentRecord) -> DocumentSummary {
    DocumentSummary {
        id: record.id.clone(),
        name: record.shown_name().to_string(),
        status: record.status.as_str().to_string(),
        chunk_count: record.chunk_count,
        uploaded_at: record.uploaded_at,
    }
}

async fn handle_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, AppError> {
    let who = identity(&headers)?;
    if params.all {
        require_admin(who)?;
    }
    let records = state.engine.list_documents(who.user_id, params.all).await?;
    Ok(Json(ListResponse {
        documents: records.iter().map(summarize).collect(),
    }))
}

// ============ GET /documents/{id}/status ============

async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DocumentSummary>, AppError> {
    let who = identity(&headers)?;
    let record = state
        .engine
        .document_status(&id, who.user_id, who.admin)
        .await?;
    Ok(Json(summarize(&record)))
}

// ============ POST /documents/{id}/rename ============

#[derive(Deserialize)]
struct RenameBody {
    name: String,
}

async fn handle_rename(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<StatusCode, AppError> {
    let who = identity(&headers)?;
    if body.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    state
        .engine
        .rename_document(&id, who.user_id, who.admin, body.name.trim())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ DELETE /documents/{id} ============

async fn handle_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let who = identity(&headers)?;
    state
        .engine
        .delete_document(&id, who.user_id, who.admin)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryBody {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<Json<QueryOutcome>, AppError> {
    identity(&headers)?;
    if body.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let outcome = state.engine.query(&body.question, body.top_k).await?;
    Ok(Json(outcome))
}

// ============ Admin ============

async fn handle_consistency(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConsistencyReport>, AppError> {
    let who = identity(&headers)?;
    require_admin(who)?;
    Ok(Json(state.engine.consistency_report().await?))
}

#[derive(Serialize)]
struct ClearResponse {
    documents_removed: u64,
}

async fn handle_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearResponse>, AppError> {
    let who = identity(&headers)?;
    require_admin(who)?;
    let documents_removed = state.engine.clear_all().await?;
    Ok(Json(ClearResponse { documents_removed }))
}

#[derive(Serialize)]
struct RebuildResponse {
    rebuilt: Vec<String>,
    failed: Vec<RebuildFailure>,
}

#[derive(Serialize)]
struct RebuildFailure {
    document_id: String,
    reason: String,
}

async fn handle_rebuild(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RebuildResponse>, AppError> {
    let who = identity(&headers)?;
    require_admin(who)?;
    let summary = state.engine.rebuild_from_catalog().await?;
    Ok(Json(RebuildResponse {
        rebuilt: summary.rebuilt,
        failed: summary
            .failed
            .into_iter()
            .map(|d| RebuildFailure {
                document_id: d.document_id,
                reason: d.reason,
            })
            .collect(),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    model: String,
    index_len: u64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.engine.model_name().to_string(),
        index_len: state.engine.index_len().await,
    })
}
