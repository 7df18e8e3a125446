//! HTTP surface: request payloads, error mapping, and route handlers.
//!
//! Everything is schema-validated by the extractors before any component
//! runs, so malformed JSON and oversized bodies never mutate state.
//! Daemon-identity mismatches are reported as `{accepted: false, reason:
//! "unknown_daemon"}` with a 200 status — a signal the daemon answers by
//! re-registering, not an HTTP error.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::errors::TokenError;
use crate::hub::{IngestOutcome, Monitor};
use crate::models::{DaemonRecord, SessionRecord, TokenClaims};
use crate::registry::{HeartbeatOutcome, RegisterDaemon};
use crate::sessions::MAX_BATCH;
use crate::stream::{self, StreamLimiter};
use crate::tokens::TokenIssuer;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub tokens: Arc<TokenIssuer>,
    pub stream_limiter: StreamLimiter,
    pub config: ServerConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub daemon_id: String,
    #[serde(default)]
    pub session_count: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterRequest {
    pub daemon_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub daemon_id: String,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    #[serde(default)]
    pub removed_session_ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct SessionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenRequest {
    pub user_id: String,
    pub stream_id: String,
    #[serde(default)]
    pub scopes: Option<BTreeSet<String>>,
}

#[derive(Deserialize)]
pub struct ValidateTokenRequest {
    pub token: String,
}

// ── Response types ────────────────────────────────────────────────────

/// Accept/reject envelope for daemon calls.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn unknown_daemon() -> Self {
        Self {
            accepted: false,
            reason: Some("unknown_daemon"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonRecord>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionRecord>,
    pub total: usize,
    pub connected: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    BatchTooLarge { field: &'static str, len: usize },
    Token(TokenError),
    StreamLimitReached,
    Internal(String),
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        Self::Token(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::BatchTooLarge { field, len } => (
                StatusCode::BAD_REQUEST,
                "BATCH_TOO_LARGE",
                format!("{} holds {} entries (max {})", field, len, MAX_BATCH),
            ),
            ApiError::Token(err) => {
                let status = match err {
                    TokenError::MaxTokensExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                    _ => StatusCode::UNAUTHORIZED,
                };
                (status, err.code(), err.to_string())
            }
            ApiError::StreamLimitReached => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STREAM_LIMIT_REACHED",
                "Too many concurrent stream connections".to_string(),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "Internal server error".to_string(),
                )
            }
        };
        (
            status,
            Json(serde_json::json!({"error": message, "code": code})),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/daemon/register", post(register_daemon))
        .route("/api/daemon/heartbeat", post(heartbeat))
        .route("/api/daemon/deregister", post(deregister_daemon))
        .route("/api/daemon/ingest", post(ingest_sessions))
        .route("/api/daemon/status", get(daemon_status))
        .route("/api/sessions", get(list_sessions))
        .route("/api/stream/token", post(issue_token))
        .route("/api/stream/token/validate", post(validate_token))
        .route("/api/stream", get(stream::stream_handler))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn register_daemon(
    State(state): State<SharedState>,
    Json(req): Json<RegisterDaemon>,
) -> Json<Ack> {
    state.monitor.register(req);
    Json(Ack::ok())
}

async fn heartbeat(
    State(state): State<SharedState>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<Ack> {
    match state.monitor.heartbeat(&req.daemon_id, req.session_count) {
        HeartbeatOutcome::Accepted => Json(Ack::ok()),
        HeartbeatOutcome::UnknownDaemon => Json(Ack::unknown_daemon()),
    }
}

async fn deregister_daemon(
    State(state): State<SharedState>,
    Json(req): Json<DeregisterRequest>,
) -> Json<Ack> {
    state.monitor.deregister(&req.daemon_id);
    Json(Ack::ok())
}

async fn ingest_sessions(
    State(state): State<SharedState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<Ack>, ApiError> {
    if req.sessions.len() > MAX_BATCH {
        return Err(ApiError::BatchTooLarge {
            field: "sessions",
            len: req.sessions.len(),
        });
    }
    if req.removed_session_ids.len() > MAX_BATCH {
        return Err(ApiError::BatchTooLarge {
            field: "removedSessionIds",
            len: req.removed_session_ids.len(),
        });
    }

    match state
        .monitor
        .ingest(&req.daemon_id, req.sessions, req.removed_session_ids)
    {
        IngestOutcome::Accepted { .. } => Ok(Json(Ack::ok())),
        IngestOutcome::UnknownDaemon => Ok(Json(Ack::unknown_daemon())),
    }
}

async fn daemon_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    let status = state.monitor.status();
    Json(StatusResponse {
        connected: status.connected,
        daemon: status.daemon,
    })
}

async fn list_sessions(
    State(state): State<SharedState>,
    Query(query): Query<SessionsQuery>,
) -> Json<SessionsResponse> {
    let page = state.monitor.list_sessions(query.limit, query.offset);
    Json(SessionsResponse {
        sessions: page.sessions,
        total: page.total,
        connected: page.connected,
    })
}

async fn issue_token(
    State(state): State<SharedState>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.user_id.is_empty() || req.stream_id.is_empty() {
        return Err(ApiError::BadRequest(
            "userId and streamId must be non-empty".to_string(),
        ));
    }
    let token = state
        .tokens
        .generate(&req.user_id, &req.stream_id, req.scopes, None)?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn validate_token(
    State(state): State<SharedState>,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<Json<TokenClaims>, ApiError> {
    let claims = state.tokens.validate(&req.token)?;
    Ok(Json(claims))
}
