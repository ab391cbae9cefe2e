//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;

/// Terminal outcome of a dispatched request.
///
/// Credential failures only surface here once the retry budget or the
/// eligible pool is used up; while either remains they are handled by the
/// dispatcher itself.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to create conversation: {0}")]
    ConversationCreate(String),

    #[error("no eligible credential and the provider session is not authenticated")]
    AuthRequired,

    #[error("credential rejected by the provider after {attempts} attempts")]
    CredentialInvalid { attempts: u32 },

    #[error("all credentials exhausted: {0}")]
    CredentialsExhausted(String),

    #[error("credential rate limited for {retry_after_hours}h after {attempts} attempts")]
    RateLimited {
        retry_after_hours: u64,
        attempts: u32,
    },

    #[error("provider requires interactive verification; complete it and retry")]
    VerificationRequired,

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("task failed: {message}")]
    TaskFailed {
        task_id: Option<String>,
        message: String,
        data: Value,
    },

    #[error("task {task_id} did not finish after {attempts} status checks")]
    TaskTimeout { task_id: String, attempts: u32 },

    #[error("request cancelled")]
    Cancelled,

    #[error("service is shutting down: no credential can serve requests")]
    ServiceHalted,
}

impl DispatchError {
    /// Machine-readable `type` for the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "invalid_request_error",
            DispatchError::ConversationCreate(_) => "conversation_create_error",
            DispatchError::AuthRequired => "authentication_required",
            DispatchError::CredentialInvalid { .. } => "credential_invalid",
            DispatchError::CredentialsExhausted(_) => "credentials_exhausted",
            DispatchError::RateLimited { .. } => "rate_limit_error",
            DispatchError::VerificationRequired => "verification_required",
            DispatchError::Upstream { .. } => "upstream_error",
            DispatchError::Transport(_) => "transport_error",
            DispatchError::TaskFailed { .. } => "task_failed",
            DispatchError::TaskTimeout { .. } => "task_timeout",
            DispatchError::Cancelled => "request_cancelled",
            DispatchError::ServiceHalted => "service_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::ConversationCreate(_) => StatusCode::BAD_GATEWAY,
            DispatchError::AuthRequired => StatusCode::UNAUTHORIZED,
            DispatchError::CredentialInvalid { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::CredentialsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::VerificationRequired => StatusCode::SERVICE_UNAVAILABLE,
            // Provider status is relayed when it is an error status
            DispatchError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
            DispatchError::TaskFailed { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::TaskTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            DispatchError::ServiceHalted => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// `{"error":{"message","type"}}`, with the task id and last raw task
    /// data attached for task failures.
    pub fn body(&self) -> Value {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.kind(),
        });
        match self {
            DispatchError::TaskFailed { task_id, data, .. } => {
                error["task_id"] = json!(task_id);
                error["task_data"] = data.clone();
            }
            DispatchError::TaskTimeout { task_id, .. } => {
                error["task_id"] = json!(task_id);
            }
            DispatchError::RateLimited {
                retry_after_hours, ..
            } => {
                error["retry_after_hours"] = json!(retry_after_hours);
            }
            _ => {}
        }
        json!({ "error": error })
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.body().to_string(),
        )
            .into_response()
    }
}

/// Result alias for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        assert_eq!(
            DispatchError::Validation("message is required".into()).to_string(),
            "message is required"
        );
        assert!(
            DispatchError::ConversationCreate("timeout".into())
                .to_string()
                .contains("timeout")
        );
        assert!(
            DispatchError::TaskTimeout {
                task_id: "task-1".into(),
                attempts: 90
            }
            .to_string()
            .contains("task-1")
        );
    }

    #[test]
    fn upstream_status_is_relayed() {
        let err = DispatchError::Upstream {
            status: 418,
            body: "teapot".into(),
        };
        assert_eq!(err.status(), StatusCode::IM_A_TEAPOT);

        let ok_status = DispatchError::Upstream {
            status: 200,
            body: String::new(),
        };
        assert_eq!(ok_status.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn body_has_message_and_type() {
        let body = DispatchError::AuthRequired.body();
        assert_eq!(body["error"]["type"], "authentication_required");
        assert!(body["error"]["message"].as_str().unwrap().contains("credential"));
    }

    #[test]
    fn task_failure_carries_task_data() {
        let err = DispatchError::TaskFailed {
            task_id: Some("task-9".into()),
            message: "content policy".into(),
            data: json!({"task_status": "failed"}),
        };
        let body = err.body();
        assert_eq!(body["error"]["task_id"], "task-9");
        assert_eq!(body["error"]["task_data"]["task_status"], "failed");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn error_debug_includes_variant_name() {
        let err = DispatchError::Transport("reset".into());
        let debug = format!("{err:?}");
        assert!(
            debug.contains("Transport"),
            "Debug output must include variant name, got: {debug}"
        );
    }
}
