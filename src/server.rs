//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/files` | Files in the data directory, grouped by folder |
//! | `GET`    | `/files/{id_or_name}` | File record by numeric id, or converted file bytes by name |
//! | `POST`   | `/upload` | Multipart upload; ingestion continues in the background |
//! | `POST`   | `/doc_ingestion` | Index a directory into a named collection |
//! | `POST`   | `/query` | Answer a question |
//! | `DELETE` | `/delete` | Remove an uploaded file from disk |
//! | `GET`    | `/folders` | Top-level folders of the data directory |
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/static/*` | Raw files from the data directory |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "text must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::convert;
use crate::db;
use crate::embedding::{EmbedderRegistry, EMBEDDINGS_NAMES};
use crate::files::{self, InvalidName, MissingFolder};
use crate::index::{EmbeddingsMismatch, SqliteVectorIndex, VectorIndex};
use crate::ingest;
use crate::llm::OpenAIChat;
use crate::migrate;
use crate::pipeline::{QueryPipeline, QueryRequest, QueryResponse};
use crate::session::SqliteSessionStore;

const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<QueryPipeline>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        index: Arc<dyn VectorIndex>,
        pipeline: Arc<QueryPipeline>,
    ) -> Self {
        Self {
            config,
            pool,
            index,
            pipeline,
        }
    }

    /// Production wiring: SQLite sessions and index, HTTP embedders and chat model.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let config = Arc::new(config.clone());
        let embedders = Arc::new(EmbedderRegistry::from_config(config.as_ref().clone()));
        let index: Arc<dyn VectorIndex> = Arc::new(SqliteVectorIndex::new(
            pool.clone(),
            embedders,
            config.embedding.batch_size,
        ));
        let llm = Arc::new(OpenAIChat::new(&config.llm)?);
        let sessions = Arc::new(SqliteSessionStore::new(pool.clone()));
        let pipeline = Arc::new(QueryPipeline::new(
            sessions,
            index.clone(),
            llm,
            config.as_ref().clone(),
        ));
        Ok(Self::new(config, pool, index, pipeline))
    }
}

/// Starts the HTTP server.
///
/// Runs migrations, converts files already in the data directory, then
/// binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let data_dir = config.storage.data_dir.clone();
    let converted_dir = config.storage.converted_dir.clone();
    tokio::task::spawn_blocking(move || convert::convert_existing_files(&data_dir, &converted_dir))
        .await??;

    let state = AppState::from_config(config, pool)?;
    let app = router(state);

    let bind_addr = config.server.bind.clone();
    info!(bind = %bind_addr, "listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    let static_files = ServeDir::new(&state.config.storage.data_dir);

    Router::new()
        .route("/health", get(handle_health))
        .route("/files", get(handle_list_files))
        .route("/files/{id_or_name}", get(handle_get_file))
        .route("/upload", post(handle_upload))
        .route("/doc_ingestion", post(handle_doc_ingestion))
        .route("/query", post(handle_query))
        .route("/delete", delete(handle_delete))
        .route("/folders", get(handle_folders))
        .nest_service("/static", static_files)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
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

/// Internal error type that converts into an Axum HTTP response.
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<InvalidName>().is_some()
            || err.downcast_ref::<MissingFolder>().is_some()
            || err.downcast_ref::<EmbeddingsMismatch>().is_some()
        {
            return bad_request(err.to_string());
        }
        error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: format!("{:#}", err),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

fn message(text: impl Into<String>) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: text.into(),
    })
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

// ============ GET /files ============

async fn handle_list_files(State(state): State<AppState>) -> Result<Response, AppError> {
    let grouped = files::list_files(
        &state.config.storage.data_dir,
        &state.config.storage.public_base_url,
    )?
    .ok_or_else(|| not_found("Directory not found"))?;

    if grouped.is_empty() {
        return Ok(message("No files found").into_response());
    }
    Ok(Json(serde_json::json!({ "files": grouped })).into_response())
}

// ============ GET /files/{id_or_name} ============

#[derive(Serialize)]
struct FileRecordResponse {
    file_name: String,
    chunks: Vec<String>,
    state: crate::models::FileState,
}

/// All-digit segments are record ids; anything else names a converted file.
async fn handle_get_file(
    State(state): State<AppState>,
    Path(id_or_name): Path<String>,
) -> Result<Response, AppError> {
    if !id_or_name.is_empty() && id_or_name.bytes().all(|b| b.is_ascii_digit()) {
        let id: i64 = id_or_name
            .parse()
            .map_err(|_| bad_request(format!("invalid file id: {}", id_or_name)))?;
        let record = files::get_record(&state.pool, id)
            .await?
            .ok_or_else(|| not_found("File not found"))?;
        return Ok(Json(FileRecordResponse {
            file_name: record.file_name,
            chunks: record.chunks,
            state: record.state,
        })
        .into_response());
    }

    let bytes = files::read_converted(&state.config.storage.converted_dir, &id_or_name)?
        .ok_or_else(|| not_found("File not found"))?;
    let disposition = format!("inline; filename=\"{}\"", id_or_name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    message: String,
    static_url: String,
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut folder: Option<String> = None;
    let mut create_new_folder = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("").to_string();
                let data = field.bytes().await.map_err(|e| bad_request(e.to_string()))?;
                file = Some((file_name, data.to_vec()));
            }
            "folder" => {
                folder = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
            }
            "create_new_folder" => {
                let value = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                create_new_folder = parse_flag(&value);
            }
            _ => continue,
        }
    }

    let (file_name, data) = file.ok_or_else(|| bad_request("missing 'file' field"))?;
    if file_name.is_empty() {
        return Err(bad_request("uploaded file has no name"));
    }
    let folder = folder.ok_or_else(|| bad_request("missing 'folder' field"))?;

    let path = files::save_upload(
        &state.config.storage.data_dir,
        &folder,
        create_new_folder,
        &file_name,
        &data,
    )?;

    let relative = if folder.is_empty() {
        file_name.clone()
    } else {
        format!("{}/{}", folder.trim_matches('/'), file_name)
    };
    let static_url = files::static_url(&state.config.storage.public_base_url, &relative);
    info!(file_name = %file_name, folder = %folder, "upload saved");

    spawn_ingestion(state, path, file_name, static_url.clone());

    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
        static_url,
    }))
}

fn spawn_ingestion(state: AppState, path: PathBuf, file_name: String, static_url: String) {
    tokio::spawn(async move {
        let result = ingest::ingest_document(
            &state.pool,
            state.index.as_ref(),
            &state.config,
            &path,
            &file_name,
            &static_url,
        )
        .await;
        if let Err(e) = result {
            error!(file_name = %file_name, error = %format!("{:#}", e), "ingestion failed");
        }
    });
}

// ============ POST /doc_ingestion ============

#[derive(Deserialize)]
struct DocIngestionRequest {
    dir_path: String,
    collection_name: String,
    embeddings_name: String,
}

async fn handle_doc_ingestion(
    State(state): State<AppState>,
    Json(req): Json<DocIngestionRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    if !EMBEDDINGS_NAMES.contains(&req.embeddings_name.as_str()) {
        return Err(bad_request(format!(
            "unknown embeddings_name '{}'; expected one of: {}",
            req.embeddings_name,
            EMBEDDINGS_NAMES.join(", ")
        )));
    }
    if req.collection_name.trim().is_empty() {
        return Err(bad_request("collection_name must not be empty"));
    }
    let dir = PathBuf::from(&req.dir_path);
    if !dir.exists() {
        return Err(bad_request(format!("dir_path does not exist: {}", req.dir_path)));
    }

    ingest::add_documents(
        state.index.as_ref(),
        &state.config,
        &dir,
        &req.collection_name,
        &req.embeddings_name,
    )
    .await?;

    Ok(message("Documents added successfully"))
}

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let response = state.pipeline.answer(req).await?;
    Ok(Json(response))
}

// ============ DELETE /delete ============

#[derive(Deserialize)]
struct DeleteRequest {
    folder: String,
    #[serde(rename = "fileName")]
    file_name: String,
}

async fn handle_delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let deleted = files::delete_file(&state.config.storage.data_dir, &req.folder, &req.file_name)?;
    if !deleted {
        return Err(not_found("File not found"));
    }
    info!(folder = %req.folder, file_name = %req.file_name, "file deleted");
    Ok(message(format!(
        "File '{}' deleted successfully from {}.",
        req.file_name, req.folder
    )))
}

// ============ GET /folders ============

#[derive(Serialize)]
struct FoldersResponse {
    folders: Vec<String>,
}

async fn handle_folders(State(state): State<AppState>) -> Result<Json<FoldersResponse>, AppError> {
    let folders = files::list_folders(&state.config.storage.data_dir)?;
    Ok(Json(FoldersResponse { folders }))
}
