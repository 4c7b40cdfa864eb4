//! HTTP API surface (C11, §4.11).
//!
//! New relative to the teacher, which has no server process at all —
//! its `MailStore` is only ever driven in-process by the mobile shell.
//! Built on `axum`, the one async/tokio boundary in this workspace: the
//! core engines stay synchronous (`DESIGN.md`), and every handler here
//! hands blocking work off to `tokio::task::spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use msgvault_core::deletion::DeletionEngine;
use msgvault_core::error::MsgVaultError;
use msgvault_core::models::{ExecutionMethod, SourceType};
use msgvault_core::query::QueryEngine;
use msgvault_core::scheduler::Scheduler;
use msgvault_core::storage::RelationalStore;

use crate::remote_factory::AccountRemoteFactory;
use crate::token_store::FileTokenSource;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RelationalStore>,
    pub blobs: Arc<msgvault_core::blob::BlobStore>,
    pub scheduler: Arc<Scheduler>,
    pub home: PathBuf,
    pub settings: Arc<msgvault_config::Settings>,
    pub api_key: Option<String>,
}

impl AppState {
    fn cache_root(&self) -> PathBuf {
        self.home.join("analytics")
    }

    fn deletions_root(&self) -> PathBuf {
        self.home.join("deletions")
    }

    fn query_engine(&self) -> QueryEngine<'_> {
        QueryEngine::with_cache(&self.store, self.cache_root())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/accounts", get(list_accounts).post(add_account))
        .route("/api/v1/messages", get(list_messages))
        .route("/api/v1/messages/:id", get(get_message))
        .route("/api/v1/search", get(list_messages))
        .route("/api/v1/auth/token/:email", post(set_token))
        .route("/api/v1/sync/:email", post(trigger_sync))
        .route("/api/v1/deletions/:email", post(stage_and_run_deletion))
        .with_state(state)
}

fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid API key"))
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<MsgVaultError> for ApiError {
    fn from(e: MsgVaultError) -> Self {
        let status = match e {
            MsgVaultError::NotFound => StatusCode::NOT_FOUND,
            MsgVaultError::Conflict => StatusCode::CONFLICT,
            MsgVaultError::InsufficientScope => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let stats = tokio::task::spawn_blocking(move || state.query_engine().get_total_stats())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(stats))
}

async fn list_accounts(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let accounts = tokio::task::spawn_blocking(move || state.query_engine().list_accounts())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(accounts))
}

#[derive(Deserialize)]
struct AddAccountRequest {
    source_type: String,
    identifier: String,
    display_name: Option<String>,
    #[serde(default = "default_account_schedule")]
    schedule: String,
}

fn default_account_schedule() -> String {
    "0 */15 * * * *".to_string()
}

fn parse_source_type(s: &str) -> Option<SourceType> {
    match s {
        "gmail" => Some(SourceType::Gmail),
        "imap" => Some(SourceType::Imap),
        "mbox" => Some(SourceType::Mbox),
        "apple-mail" => Some(SourceType::AppleMail),
        _ => None,
    }
}

async fn add_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AddAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let Some(source_type) = parse_source_type(&req.source_type) else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, format!("unknown source_type {:?}", req.source_type)));
    };
    let store = state.store.clone();
    let display_name = req.display_name.clone();
    let source = tokio::task::spawn_blocking(move || store.upsert_source(source_type, &req.identifier, display_name.as_deref()))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    if source_type != SourceType::Mbox && source_type != SourceType::AppleMail {
        register_account_with_scheduler(&state, &source, &req.schedule);
    }
    Ok((StatusCode::CREATED, Json(source)))
}

#[derive(Deserialize)]
struct MessagesQuery {
    q: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<MessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let query = q.q.unwrap_or_default();
    let limit = q.limit.unwrap_or(50).min(500);
    let offset = q.offset.unwrap_or(0);
    let results = tokio::task::spawn_blocking(move || state.query_engine().search(&query, limit, offset))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok(Json(results))
}

async fn get_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let detail = tokio::task::spawn_blocking(move || state.query_engine().get_message(id))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    match detail {
        Some(d) => Ok(Json(MessageDetailJson::from(d)).into_response()),
        None => Ok((StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" }))).into_response()),
    }
}

#[derive(Serialize)]
struct MessageDetailJson {
    message: msgvault_core::models::Message,
    labels: Vec<msgvault_core::models::Label>,
    attachments: Vec<msgvault_core::models::Attachment>,
    body_text: Option<String>,
    body_html: Option<String>,
}

impl From<msgvault_core::storage::MessageDetail> for MessageDetailJson {
    fn from(d: msgvault_core::storage::MessageDetail) -> Self {
        Self {
            message: d.message,
            labels: d.labels,
            attachments: d.attachments,
            body_text: d.body_text,
            body_html: d.body_html,
        }
    }
}

#[derive(Deserialize)]
struct SetTokenRequest {
    token: String,
}

async fn set_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(email): AxumPath<String>,
    Json(req): Json<SetTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let tokens_dir = state.home.join("tokens");
    tokio::task::spawn_blocking(move || FileTokenSource::write(&tokens_dir, &email, &req.token))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `202 Accepted` once the sync is queued on the scheduler's next poll
/// tick, `409 Conflict` if one is already running, `404` if the
/// account isn't registered (§4.11).
async fn trigger_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(email): AxumPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let source = {
        let store = state.store.clone();
        let email = email.clone();
        tokio::task::spawn_blocking(move || store.get_source_by_identifier_any(&email))
            .await
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??
    };
    let Some(source) = source else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("no account registered for {email}")));
    };
    if state.scheduler.trigger_sync(source.id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::new(StatusCode::CONFLICT, "sync already in progress"))
    }
}

#[derive(Deserialize)]
struct StageDeletionRequest {
    provider_ids: Vec<String>,
    description: String,
    #[serde(default)]
    permanent: bool,
}

#[derive(Serialize)]
struct DeletionResponse {
    manifest_id: String,
    status: msgvault_core::models::ManifestStatus,
}

/// Stages a manifest and runs it to completion inline. Blocking work
/// stays on one `spawn_blocking` call since both the remote connect
/// and the delete calls need to share the same borrowed engine.
async fn stage_and_run_deletion(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(email): AxumPath<String>,
    Json(req): Json<StageDeletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_api_key(&state, &headers)?;
    let deletions_root = state.deletions_root();
    let home = state.home.clone();
    let settings = state.settings.clone();
    let store = state.store.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<(String, msgvault_core::models::ManifestStatus), MsgVaultError> {
        let source = store
            .get_source_by_identifier_any(&email)?
            .ok_or(MsgVaultError::NotFound)?;
        let factory = AccountRemoteFactory::new(&home, &settings, &source);
        let remote = factory.connect()?;
        let engine = DeletionEngine::new(&deletions_root, &store, remote.as_ref());
        let mut manifest = engine.stage(source.id, req.provider_ids, req.description, serde_json::Value::Null)?;
        let method = if req.permanent {
            ExecutionMethod::BatchPermanent
        } else {
            ExecutionMethod::Trash
        };
        let cancel = tokio_util::sync::CancellationToken::new();
        engine.execute(&mut manifest, method, &cancel)?;
        Ok((manifest.id, manifest.status))
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    Ok(Json(DeletionResponse {
        manifest_id: result.0,
        status: result.1,
    }))
}

/// Used by [`crate::main`] to wire a newly added account into the
/// scheduler at startup and after `POST /api/v1/accounts`.
pub fn register_account_with_scheduler(state: &AppState, source: &msgvault_core::models::Source, cron_expr: &str) {
    let factory = Arc::new(AccountRemoteFactory::new(&state.home, &state.settings, source));
    if let Err(e) = state
        .scheduler
        .add_account(source.id, cron_expr, state.store.clone(), state.blobs.clone(), factory)
    {
        log::warn!("msgvault: failed to schedule account {}: {e}", source.identifier);
    }
}
