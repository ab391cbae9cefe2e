//! Admin API for credential management
//!
//! Runs on a separate listener, only when `admin.listen_addr` is configured.
//!
//! Endpoints:
//! - GET    /admin/credentials            list credentials with status, never tokens
//! - POST   /admin/credentials            enroll a token `{token, name?, id?}`
//! - DELETE /admin/credentials/{id}       remove a persisted credential
//! - POST   /admin/credentials/{id}/valid clear marks, optionally rotating `{token?}`
//! - GET    /admin/pool                   pool status summary

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use qwen_pool::CredentialPool;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    credentials: Arc<CredentialPool>,
}

impl AdminState {
    pub fn new(credentials: Arc<CredentialPool>) -> Self {
        Self { credentials }
    }
}

/// Build the admin axum router with all credential management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials).post(add_credential))
        .route("/admin/credentials/{id}", delete(delete_credential))
        .route("/admin/credentials/{id}/valid", post(mark_valid))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, json!({ "error": message.into() }))
}

fn pool_error_response(error: qwen_pool::Error) -> Response {
    let status = match &error {
        qwen_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        qwen_pool::Error::Duplicate(_) | qwen_pool::Error::EnvManaged(_) => StatusCode::CONFLICT,
        qwen_pool::Error::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        qwen_pool::Error::Credential(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %error, "credential operation failed");
    }
    error_response(status, error.to_string())
}

/// GET /admin/credentials
async fn list_credentials(State(state): State<AdminState>) -> Response {
    let now = Utc::now();
    let credentials: Vec<Value> = state
        .credentials
        .list()
        .await
        .iter()
        .map(|c| c.summary(now))
        .collect();
    json_response(StatusCode::OK, json!({ "credentials": credentials }))
}

#[derive(Debug, Deserialize)]
struct AddCredentialBody {
    token: String,
    name: Option<String>,
    id: Option<String>,
}

/// POST /admin/credentials: enroll a token into the persisted store.
async fn add_credential(State(state): State<AdminState>, body: Bytes) -> Response {
    let body: AddCredentialBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")),
    };
    let token = body.token.trim().to_string();
    if token.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "token is required");
    }

    match state.credentials.add(token, body.name, body.id).await {
        Ok(credential) => {
            info!(credential_id = %credential.id, "credential added");
            json_response(StatusCode::CREATED, credential.summary(Utc::now()))
        }
        Err(e) => pool_error_response(e),
    }
}

/// DELETE /admin/credentials/{id}
async fn delete_credential(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.credentials.remove(&id).await {
        Ok(()) => {
            info!(credential_id = %id, "credential removed");
            json_response(StatusCode::OK, json!({ "id": id, "status": "removed" }))
        }
        Err(e) => pool_error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MarkValidBody {
    token: Option<String>,
}

/// POST /admin/credentials/{id}/valid: return a credential to rotation.
async fn mark_valid(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let body: MarkValidBody = if body.is_empty() {
        MarkValidBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {e}"));
            }
        }
    };
    let token = body
        .token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    match state.credentials.mark_valid(&id, token).await {
        Ok(()) => json_response(StatusCode::OK, json!({ "id": id, "status": "available" })),
        Err(e) => pool_error_response(e),
    }
}

/// GET /admin/pool: same shape as the health endpoint's pool object.
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.credentials.health().await)
}
