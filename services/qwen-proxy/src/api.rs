//! Public chat API
//!
//! Thin shaping over the dispatcher, mounted under `/api`, `/api/v1` and
//! `/api/v2`:
//! - POST /chat               native chat request
//! - POST /chat/completions   OpenAI-style request, optionally streamed as SSE
//! - POST /chats              create a conversation
//! - GET  /models             model catalog in OpenAI list shape
//! - GET  /tasks/status/{id}  one status query for an asynchronous job
//! - GET  /status             credential probe
//!
//! Every request runs under its own cancellation token, cancelled when the
//! client goes away or the request timeout expires.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::auth::{ApiKeys, require_api_key};
use crate::dispatcher::{ChatCompletion, ChatOutcome, ChatRequest, DeferredTask, Dispatcher};
use crate::error::{DispatchError, Result};
use crate::metrics;
use crate::service::ServiceMetrics;

/// Code points per re-emitted SSE chunk
const STREAM_CHUNK_CHARS: usize = 16;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: ServiceMetrics,
    pub request_timeout: Duration,
    /// Pause between re-emitted SSE chunks
    pub chunk_delay: Duration,
}

/// Build the public API router. `keys` gates every route when non-empty.
pub fn build_api_router(state: ApiState, keys: ApiKeys) -> Router {
    let routes = || {
        Router::new()
            .route("/chat", post(chat_handler))
            .route("/chat/completions", post(completions_handler))
            .route("/chats", post(create_chat_handler))
            .route("/models", get(models_handler))
            .route("/tasks/status/{task_id}", get(task_status_handler))
            .route("/status", get(status_handler))
    };
    Router::new()
        .nest("/api", routes())
        .nest("/api/v1", routes())
        .nest("/api/v2", routes())
        .layer(axum::middleware::from_fn_with_state(keys, require_api_key))
        .with_state(state)
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn error_response(error: DispatchError) -> Response {
    if error.status().is_server_error() {
        warn!(error_type = error.kind(), error = %error, "request failed");
    } else {
        info!(error_type = error.kind(), error = %error, "request rejected");
    }
    error.into_response()
}

/// Decrements the in-flight counter even when the client disconnects.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Count and time one request.
async fn observed(state: &ApiState, route: &'static str, handler: impl Future<Output = Response>) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.metrics.in_flight);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = handler.await;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(route, status.as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Run `fut` under the request timeout; on expiry the request's token is
/// cancelled so in-flight provider work stops.
async fn bounded<T>(
    state: &ApiState,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(state.request_timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            warn!(
                timeout_secs = state.request_timeout.as_secs(),
                "request timed out"
            );
            Err(DispatchError::Cancelled)
        }
    }
}

fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| DispatchError::Validation(format!("invalid request body: {e}")))
}

/// One entry of an OpenAI-style `messages` array.
#[derive(Debug, Clone, Deserialize)]
struct RoleMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

/// System message is the first `system` entry, the message the last `user` entry.
fn split_messages(messages: &[RoleMessage]) -> (Option<Value>, Option<String>) {
    let system = messages
        .iter()
        .find(|m| m.role == "system")
        .and_then(|m| match &m.content {
            Value::String(text) => Some(text.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        });
    let user = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .filter(|c| !c.is_null());
    (user, system)
}

fn completion_body(completion: &ChatCompletion) -> Value {
    let mut body = json!({
        "id": completion.id,
        "object": "chat.completion",
        "created": completion.created,
        "model": completion.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": completion.content},
            "finish_reason": "stop",
        }],
        "usage": completion.usage,
        "response_id": completion.response_id,
        "chatId": completion.chat_id,
        "parentId": completion.parent_id,
    });
    if let Some(task_id) = &completion.task_id {
        body["task_id"] = json!(task_id);
    }
    body
}

fn deferred_body(task: &DeferredTask) -> Value {
    json!({
        "id": task.task_id,
        "object": "chat.completion.task",
        "created": Utc::now().timestamp(),
        "model": task.model,
        "task_id": task.task_id,
        "chatId": task.chat_id,
        "parentId": task.parent_id,
        "status": "processing",
        "message": format!(
            "Task created. Use GET /api/tasks/status/{} to check progress.",
            task.task_id
        ),
    })
}

fn outcome_response(outcome: &ChatOutcome) -> Response {
    match outcome {
        ChatOutcome::Completed(completion) => json_response(StatusCode::OK, &completion_body(completion)),
        ChatOutcome::Deferred(task) => json_response(StatusCode::OK, &deferred_body(task)),
    }
}

// --- POST /chat ---

/// Native chat body; an OpenAI `messages` array is accepted in place of `message`.
#[derive(Debug, Default, Deserialize)]
struct ChatBody {
    #[serde(flatten)]
    request: ChatRequest,
    #[serde(default)]
    messages: Option<Vec<RoleMessage>>,
}

async fn chat_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    observed(&state, "chat", chat(&state, body, new_request_id())).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn chat(state: &ApiState, body: Bytes, request_id: String) -> Response {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let ChatBody {
        mut request,
        messages,
    } = match parse_body::<ChatBody>(&body) {
        Ok(body) => body,
        Err(e) => return error_response(e),
    };
    if let Some(messages) = messages.filter(|m| !m.is_empty()) {
        let (user, system) = split_messages(&messages);
        if user.is_some() {
            request.message = user;
        }
        if request.system_message.is_none() {
            request.system_message = system;
        }
    }

    match bounded(state, &cancel, state.dispatcher.dispatch(request, &cancel)).await {
        Ok(outcome) => {
            info!("chat request completed");
            outcome_response(&outcome)
        }
        Err(e) => error_response(e),
    }
}

// --- POST /chat/completions ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompletionsBody {
    messages: Option<Vec<RoleMessage>>,
    model: Option<String>,
    stream: bool,
    tools: Option<Vec<Value>>,
    /// Legacy function list, wrapped into tools
    functions: Option<Vec<Value>>,
    tool_choice: Option<Value>,
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
}

impl CompletionsBody {
    fn into_request(self) -> Result<(ChatRequest, bool)> {
        let messages = self
            .messages
            .filter(|m| !m.is_empty())
            .ok_or_else(|| DispatchError::Validation("messages are required".into()))?;
        let (user, system) = split_messages(&messages);
        let Some(message) = user else {
            return Err(DispatchError::Validation(
                "request has no user message".into(),
            ));
        };
        let tools = self.tools.or_else(|| {
            self.functions.map(|functions| {
                functions
                    .into_iter()
                    .map(|function| json!({"type": "function", "function": function}))
                    .collect()
            })
        });
        let request = ChatRequest {
            message: Some(message),
            model: self.model,
            chat_id: self.chat_id,
            parent_id: self.parent_id,
            tools,
            tool_choice: self.tool_choice,
            system_message: system,
            ..ChatRequest::default()
        };
        Ok((request, self.stream))
    }
}

async fn completions_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    observed(&state, "chat_completions", completions(&state, body, new_request_id())).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn completions(state: &ApiState, body: Bytes, request_id: String) -> Response {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let parsed = parse_body::<CompletionsBody>(&body).and_then(CompletionsBody::into_request);
    let (request, stream) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => return error_response(e),
    };

    match bounded(state, &cancel, state.dispatcher.dispatch(request, &cancel)).await {
        Ok(ChatOutcome::Completed(completion)) if stream => {
            info!(chars = completion.content.chars().count(), "streaming completion");
            sse_response(completion, state.chunk_delay)
        }
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => error_response(e),
    }
}

/// Split text into chunks of at most `size` code points.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Re-emit a finished completion as `chat.completion.chunk` records, then `[DONE]`.
fn sse_response(completion: ChatCompletion, delay: Duration) -> Response {
    let chunk = |delta: Value, finish_reason: Option<&str>| {
        json!({
            "id": completion.id,
            "object": "chat.completion.chunk",
            "created": completion.created,
            "model": completion.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
        .to_string()
    };

    // (payload, pause before sending)
    let mut records = vec![(chunk(json!({"role": "assistant"}), None), false)];
    for (i, text) in chunk_text(&completion.content, STREAM_CHUNK_CHARS)
        .into_iter()
        .enumerate()
    {
        records.push((chunk(json!({ "content": text }), None), i > 0));
    }
    records.push((chunk(json!({}), Some("stop")), false));
    records.push(("[DONE]".to_string(), false));

    let events = futures_util::stream::iter(records).then(move |(data, pause)| async move {
        if pause && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(Event::default().data(data))
    });
    Sse::new(events).into_response()
}

// --- POST /chats ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateChatBody {
    name: Option<String>,
    model: Option<String>,
}

async fn create_chat_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    observed(&state, "chats", create_chat(&state, body, new_request_id())).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn create_chat(state: &ApiState, body: Bytes, request_id: String) -> Response {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let body = match parse_body::<CreateChatBody>(&body) {
        Ok(body) => body,
        Err(e) => return error_response(e),
    };
    let created = bounded(
        state,
        &cancel,
        state
            .dispatcher
            .create_conversation(body.name, body.model.as_deref(), &cancel),
    )
    .await;
    match created {
        Ok(chat_id) => {
            info!(chat_id = %chat_id, "conversation created");
            json_response(StatusCode::OK, &json!({"chatId": chat_id, "success": true}))
        }
        Err(e) => error_response(e),
    }
}

// --- GET /models ---

async fn models_handler(State(state): State<ApiState>) -> Response {
    observed(&state, "models", async {
        let data: Vec<Value> = state
            .dispatcher
            .models()
            .available()
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": 0,
                    "owned_by": "qwen",
                    "permission": [],
                })
            })
            .collect();
        json_response(StatusCode::OK, &json!({"object": "list", "data": data}))
    })
    .await
}

// --- GET /tasks/status/{task_id} ---

async fn task_status_handler(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    observed(&state, "task_status", task_status(&state, task_id, new_request_id())).await
}

#[instrument(skip_all, fields(request_id = %request_id, task_id = %task_id))]
async fn task_status(state: &ApiState, task_id: String, request_id: String) -> Response {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match bounded(state, &cancel, state.dispatcher.task_status(&task_id, &cancel)).await {
        Ok(status) => json_response(StatusCode::OK, &status),
        Err(e) => error_response(e),
    }
}

// --- GET /status ---

async fn status_handler(State(state): State<ApiState>) -> Response {
    observed(&state, "status", status(&state, new_request_id())).await
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn status(state: &ApiState, request_id: String) -> Response {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match bounded(state, &cancel, state.dispatcher.probe_credentials(&cancel)).await {
        Ok(accounts) => json_response(
            StatusCode::OK,
            &json!({
                "authenticated": state.dispatcher.is_authenticated(),
                "accounts": accounts,
            }),
        ),
        Err(e) => error_response(e),
    }
}
