//! Request dispatcher
//!
//! Drives one chat request from validation to a normalized result:
//! credential and session resolution, conversation creation, payload
//! construction, execution, stream decoding or task polling, and failure
//! recovery. Retry decisions are delegated to the pure machine in
//! `dispatch`; this module only performs the I/O each action asks for.
//!
//! Credential resolution prefers the pool. When nothing in the pool is
//! eligible the credential the execution context is logged in with (the
//! ambient credential) is used, running the interactive authenticator first
//! if the context has lost its login.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use common::Secret;
use provider::task::extract_task_id;
use provider::{
    Authenticator, ChatPayload, ChatType, ContentPart, ErrorClassification, ExecuteOutcome,
    MessageContent, NewConversation, PayloadParams, ProviderError, Session, StreamDecoder,
    TaskOutcome, TaskPoller, UpstreamFailure, Usage, cancellable,
};
use qwen_auth::CredentialStatus;
use qwen_pool::{CredentialPool, SessionLease, SessionPool, classify_status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{
    CredentialSlot, DispatchAction, DispatchEvent, DispatchState, FailReason, handle_event,
};
use crate::error::{DispatchError, Result};
use crate::metrics;
use crate::models::ModelCatalog;

const NEW_CHAT_TITLE: &str = "New Chat";
const PROBE_MESSAGE: &str = "ping";

/// Chat request as accepted on the native route.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRequest {
    /// String or array of typed parts; validated by the dispatcher
    pub message: Option<Value>,
    pub model: Option<String>,
    pub chat_id: Option<String>,
    pub parent_id: Option<String>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub system_message: Option<String>,
    pub chat_type: Option<ChatType>,
    pub size: Option<String>,
    pub wait_for_completion: Option<bool>,
    pub files: Vec<Value>,
}

/// Normalized result of a finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub content: String,
    pub usage: Usage,
    pub response_id: Option<String>,
    pub chat_id: String,
    /// Pass back as `parentId` to continue the conversation
    pub parent_id: Option<String>,
    pub task_id: Option<String>,
}

/// An asynchronous job returned without waiting for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredTask {
    pub task_id: String,
    pub chat_id: String,
    pub parent_id: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Completed(ChatCompletion),
    Deferred(DeferredTask),
}

/// Result of checking one credential against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeStatus {
    Ok,
    /// Still cooling down; not contacted
    Wait,
    Unauthorized,
    #[serde(rename = "RATELIMIT")]
    RateLimit,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub id: String,
    pub name: String,
    pub status: ProbeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_retries: u32,
    pub default_rate_limit_hours: u64,
    pub poller: TaskPoller,
    /// An interactive login can recover from total credential loss
    pub interactive: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            default_rate_limit_hours: qwen_auth::DEFAULT_RATE_LIMIT_HOURS,
            poller: TaskPoller::default(),
            interactive: false,
        }
    }
}

/// Request fields that stay fixed across attempts.
struct Prepared {
    content: MessageContent,
    model: String,
    chat_type: ChatType,
    parent_id: Option<String>,
    system_message: Option<String>,
    tools: Option<Vec<Value>>,
    tool_choice: Option<Value>,
    size: Option<String>,
    files: Vec<Value>,
    wait_for_completion: bool,
}

/// Why one attempt did not produce a result.
enum AttemptError {
    /// Provider failure the state machine decides about
    Classified {
        classification: ErrorClassification,
        failure: UpstreamFailure,
    },
    Terminal(DispatchError),
}

/// A credential and the session it will be used on.
struct Resolved {
    slot: CredentialSlot,
    token: Secret<String>,
    lease: SessionLease,
}

pub struct Dispatcher {
    credentials: Arc<CredentialPool>,
    sessions: SessionPool,
    authenticator: Option<Arc<dyn Authenticator>>,
    models: ModelCatalog,
    config: DispatcherConfig,
    /// Whether the execution context is believed to be logged in
    authenticated: AtomicBool,
    /// Single-flights the interactive login
    auth_gate: tokio::sync::Mutex<()>,
    /// Cancelled when no credential can serve traffic any more
    halt: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        credentials: Arc<CredentialPool>,
        sessions: SessionPool,
        authenticator: Option<Arc<dyn Authenticator>>,
        models: ModelCatalog,
        config: DispatcherConfig,
        halt: CancellationToken,
    ) -> Self {
        Self {
            credentials,
            sessions,
            authenticator,
            models,
            config,
            authenticated: AtomicBool::new(true),
            auth_gate: tokio::sync::Mutex::new(()),
            halt,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    pub fn models(&self) -> &ModelCatalog {
        &self.models
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Whether the execution context is believed to be logged in.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Run a chat request to completion.
    pub async fn dispatch(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        if self.is_halted() {
            return Err(DispatchError::ServiceHalted);
        }
        let content = validate_message(request.message.as_ref())?;
        let model = self.models.resolve(request.model.as_deref());
        if let Some(requested) = &model.substituted {
            info!(requested = %requested, model = %model.name, "model substituted");
        }

        let prepared = Prepared {
            content,
            model: model.name,
            chat_type: request.chat_type.unwrap_or_default(),
            parent_id: request.parent_id.filter(|p| !p.is_empty()),
            system_message: request.system_message,
            tools: request.tools,
            tool_choice: request.tool_choice,
            size: request.size,
            files: request.files,
            wait_for_completion: request.wait_for_completion.unwrap_or(true),
        };
        let mut chat_id = request.chat_id.filter(|c| !c.is_empty());
        debug!(
            model = %prepared.model,
            chat_type = prepared.chat_type.as_str(),
            message = %prepared.content.summary(),
            "dispatching chat request"
        );

        // The first resolution is handled exactly like a retry
        let mut state = DispatchState::Resolving { retries: 0 };
        let mut action = DispatchAction::Retry;
        let mut resolved: Option<Resolved> = None;
        let mut last_failure: Option<UpstreamFailure> = None;
        let mut outcome: Option<ChatOutcome> = None;

        loop {
            let event = match action {
                DispatchAction::Retry => match self.resolve(cancel).await? {
                    Some(r) => {
                        let slot = r.slot.clone();
                        resolved = Some(r);
                        DispatchEvent::CredentialResolved(slot)
                    }
                    None => DispatchEvent::CredentialUnavailable,
                },
                DispatchAction::Execute(slot) => {
                    let Some(attempt) = resolved.take() else {
                        return Err(DispatchError::Transport(
                            "no session bound to the attempt".into(),
                        ));
                    };
                    let result = self
                        .attempt(&attempt, &prepared, &mut chat_id, cancel)
                        .await;
                    drop(attempt);
                    match result {
                        Ok(out) => {
                            outcome = Some(out);
                            DispatchEvent::Succeeded
                        }
                        Err(AttemptError::Classified {
                            classification,
                            failure,
                        }) => {
                            metrics::record_upstream_error(classification.label());
                            warn!(
                                credential_id = slot.label(),
                                classification = classification.label(),
                                status = ?failure.status,
                                "attempt failed"
                            );
                            last_failure = Some(failure);
                            DispatchEvent::Failed(classification)
                        }
                        Err(AttemptError::Terminal(e)) => return Err(e),
                    }
                }
                DispatchAction::Invalidate(slot) => {
                    self.invalidate(&slot).await;
                    DispatchEvent::Recovered {
                        eligible: self.has_fallback().await,
                    }
                }
                DispatchAction::Cooldown { slot, hours } => {
                    self.cooldown(&slot, hours).await;
                    DispatchEvent::Recovered {
                        eligible: self.has_fallback().await,
                    }
                }
                DispatchAction::ResetSession => {
                    self.reset_for_verification().await;
                    return Err(DispatchError::VerificationRequired);
                }
                DispatchAction::Fail(reason) => return Err(self.fail(reason, last_failure)),
                DispatchAction::Finish => {
                    return outcome.ok_or_else(|| {
                        DispatchError::Transport("dispatch finished without a result".into())
                    });
                }
                DispatchAction::None => {
                    return Err(DispatchError::Transport(format!(
                        "dispatch stalled in state {state:?}"
                    )));
                }
            };

            let (next_state, next_action) = handle_event(state, event, self.config.max_retries);
            if let DispatchAction::Retry = next_action {
                info!(?next_state, "retrying with another credential");
            }
            state = next_state;
            action = next_action;
        }
    }

    /// Create a provider conversation and return its id.
    pub async fn create_conversation(
        &self,
        title: Option<String>,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if self.is_halted() {
            return Err(DispatchError::ServiceHalted);
        }
        let model = self.models.resolve(model);
        let Some(resolved) = self.resolve(cancel).await? else {
            return Err(DispatchError::AuthRequired);
        };
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| NEW_CHAT_TITLE.to_string());
        self.open_conversation(&resolved, &NewConversation::new(title, model.name), cancel)
            .await
    }

    /// Query a task's status document once.
    pub async fn task_status(&self, task_id: &str, cancel: &CancellationToken) -> Result<Value> {
        if self.is_halted() {
            return Err(DispatchError::ServiceHalted);
        }
        let Some(resolved) = self.resolve(cancel).await? else {
            return Err(DispatchError::AuthRequired);
        };
        cancellable(
            cancel,
            resolved.lease.task_status(resolved.token.expose(), task_id),
        )
        .await
        .map_err(provider_error)
    }

    /// Check every credential against the provider and record the results.
    ///
    /// Credentials still cooling down are reported as `WAIT` without contact.
    pub async fn probe_credentials(&self, cancel: &CancellationToken) -> Result<Vec<ProbeReport>> {
        let now = Utc::now();
        let mut reports = Vec::new();

        for credential in self.credentials.list().await {
            let cooling = credential.reset_at.filter(|r| *r > now);
            let status = if cooling.is_some() {
                ProbeStatus::Wait
            } else {
                let status = self.probe_one(credential.token.expose(), cancel).await?;
                self.record_probe(&credential.id, status, credential.status(now))
                    .await;
                status
            };
            info!(credential_id = %credential.id, ?status, "credential probed");
            reports.push(ProbeReport {
                id: credential.id,
                name: credential.name,
                status,
                reset_at: cooling,
            });
        }
        Ok(reports)
    }

    async fn probe_one(&self, token: &str, cancel: &CancellationToken) -> Result<ProbeStatus> {
        let lease = match self.sessions.acquire(cancel).await {
            Ok(lease) => lease,
            Err(ProviderError::Cancelled) => return Err(DispatchError::Cancelled),
            Err(e) => {
                warn!(error = %e, "probe could not open a session");
                return Ok(ProbeStatus::Error);
            }
        };

        let mut payload = ChatPayload::build(PayloadParams {
            chat_id: String::new(),
            parent_id: None,
            model: self.models.default_model().to_string(),
            content: MessageContent::Text(PROBE_MESSAGE.into()),
            chat_type: ChatType::T2t,
            system_message: None,
            tools: None,
            tool_choice: None,
            size: None,
            files: Vec::new(),
        });
        payload.stream = false;

        let status = match cancellable(cancel, lease.execute(token, &payload)).await {
            Ok(_) => ProbeStatus::Ok,
            Err(ProviderError::Cancelled) => return Err(DispatchError::Cancelled),
            Err(ProviderError::Upstream(failure)) => self.probe_status(&failure),
            Err(e) => {
                debug!(error = %e, "probe transport failure");
                ProbeStatus::Error
            }
        };
        Ok(status)
    }

    /// A 400 means the token was accepted and only the probe body was refused.
    fn probe_status(&self, failure: &UpstreamFailure) -> ProbeStatus {
        if failure.status == Some(400) {
            return ProbeStatus::Ok;
        }
        match classify_status(
            failure.status,
            &failure.body,
            self.config.default_rate_limit_hours,
        ) {
            ErrorClassification::InvalidCredential => ProbeStatus::Unauthorized,
            ErrorClassification::RateLimited { .. } => ProbeStatus::RateLimit,
            _ => match failure.status {
                Some(401 | 403) => ProbeStatus::Unauthorized,
                Some(429) => ProbeStatus::RateLimit,
                _ => ProbeStatus::Error,
            },
        }
    }

    async fn record_probe(&self, id: &str, status: ProbeStatus, previous: CredentialStatus) {
        let result = match status {
            ProbeStatus::Ok if previous != CredentialStatus::Available => {
                self.credentials.mark_valid(id, None).await
            }
            ProbeStatus::Unauthorized => self.credentials.mark_invalid(id).await,
            ProbeStatus::RateLimit => {
                self.credentials
                    .mark_rate_limited(id, self.config.default_rate_limit_hours)
                    .await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(credential_id = id, error = %e, "failed to record probe result");
        }
    }

    /// Pick a credential and a session for the next attempt.
    ///
    /// `None` means nothing can authenticate the request.
    async fn resolve(&self, cancel: &CancellationToken) -> Result<Option<Resolved>> {
        let pooled = match self.credentials.acquire().await {
            Ok(credential) => Some(credential),
            Err(e) => {
                debug!(error = %e, "no pooled credential");
                None
            }
        };

        let lease = self.sessions.acquire(cancel).await.map_err(provider_error)?;

        if let Some(credential) = pooled {
            return Ok(Some(Resolved {
                slot: CredentialSlot::Pooled(credential.id),
                token: credential.token,
                lease,
            }));
        }

        Ok(self
            .ambient_credential(&*lease, cancel)
            .await?
            .map(|token| Resolved {
                slot: CredentialSlot::Ambient,
                token,
                lease,
            }))
    }

    async fn ambient_credential(
        &self,
        session: &dyn Session,
        cancel: &CancellationToken,
    ) -> Result<Option<Secret<String>>> {
        if !self.authenticated.load(Ordering::Acquire) {
            self.authenticate(cancel).await?;
            if !self.authenticated.load(Ordering::Acquire) {
                return Ok(None);
            }
        }

        if let Some(token) = self.sessions.ambient() {
            return Ok(Some(token));
        }
        match cancellable(cancel, session.extract_credential()).await {
            Ok(Some(token)) => {
                self.sessions.set_ambient(token.clone());
                Ok(Some(Secret::new(token)))
            }
            Ok(None) => Ok(None),
            Err(ProviderError::Cancelled) => Err(DispatchError::Cancelled),
            Err(e) => {
                warn!(error = %e, "could not read the ambient credential");
                Ok(None)
            }
        }
    }

    /// Run the interactive login once for all waiting requests.
    async fn authenticate(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(());
        };
        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            gate = self.auth_gate.lock() => gate,
        };
        if self.authenticated.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("no eligible credential, starting interactive login");
        match cancellable(cancel, authenticator.authenticate()).await {
            Ok(ok) => {
                self.authenticated.store(ok, Ordering::Release);
                if ok {
                    info!("interactive login completed");
                } else {
                    warn!("interactive login did not authenticate the session");
                }
                Ok(())
            }
            Err(ProviderError::Cancelled) => Err(DispatchError::Cancelled),
            Err(e) => {
                warn!(error = %e, "interactive login failed");
                Ok(())
            }
        }
    }

    /// One execution against the provider with a resolved credential.
    async fn attempt(
        &self,
        resolved: &Resolved,
        prepared: &Prepared,
        chat_id: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChatOutcome, AttemptError> {
        let chat_id = match chat_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .open_conversation(
                        resolved,
                        &NewConversation::new(NEW_CHAT_TITLE, prepared.model.clone()),
                        cancel,
                    )
                    .await
                    .map_err(AttemptError::Terminal)?;
                *chat_id = Some(id.clone());
                id
            }
        };

        let payload = ChatPayload::build(PayloadParams {
            chat_id: chat_id.clone(),
            parent_id: prepared.parent_id.clone(),
            model: prepared.model.clone(),
            content: prepared.content.clone(),
            chat_type: prepared.chat_type,
            system_message: prepared.system_message.clone(),
            tools: prepared.tools.clone(),
            tool_choice: prepared.tool_choice.clone(),
            size: prepared.size.clone(),
            files: prepared.files.clone(),
        });

        let token = resolved.token.expose();
        let executed = cancellable(cancel, resolved.lease.execute(token, &payload)).await;
        match executed {
            Ok(ExecuteOutcome::Stream(stream)) => {
                let decoded = StreamDecoder::decode(stream, cancel)
                    .await
                    .map_err(|e| AttemptError::Terminal(provider_error(e)))?;
                if decoded.skipped_records > 0 {
                    debug!(skipped = decoded.skipped_records, "skipped malformed stream records");
                }
                Ok(ChatOutcome::Completed(ChatCompletion {
                    parent_id: Some(
                        decoded
                            .response_id
                            .clone()
                            .unwrap_or_else(|| decoded.id.clone()),
                    ),
                    id: decoded.id,
                    created: Utc::now().timestamp(),
                    model: prepared.model.clone(),
                    content: decoded.text,
                    usage: decoded.usage,
                    response_id: decoded.response_id,
                    chat_id,
                    task_id: None,
                }))
            }
            Ok(ExecuteOutcome::Task(body)) => {
                self.follow_task(resolved, prepared, body, chat_id, cancel)
                    .await
            }
            Err(ProviderError::Upstream(failure)) => Err(AttemptError::Classified {
                classification: classify_status(
                    failure.status,
                    &failure.body,
                    self.config.default_rate_limit_hours,
                ),
                failure,
            }),
            Err(e) => Err(AttemptError::Terminal(provider_error(e))),
        }
    }

    async fn follow_task(
        &self,
        resolved: &Resolved,
        prepared: &Prepared,
        body: Value,
        chat_id: String,
        cancel: &CancellationToken,
    ) -> std::result::Result<ChatOutcome, AttemptError> {
        let Some(task_id) = extract_task_id(&body) else {
            // A success status can still carry a structured error document
            let text = body.to_string();
            let classification =
                classify_status(None, &text, self.config.default_rate_limit_hours);
            if classification != ErrorClassification::Other {
                return Err(AttemptError::Classified {
                    classification,
                    failure: UpstreamFailure {
                        status: None,
                        body: text,
                    },
                });
            }
            return Err(AttemptError::Terminal(DispatchError::TaskFailed {
                task_id: None,
                message: "provider response carries no task id".into(),
                data: body,
            }));
        };
        info!(task_id = %task_id, chat_id = %chat_id, "asynchronous task created");

        if !prepared.wait_for_completion {
            let parent_id = body
                .pointer("/data/parent_id")
                .or_else(|| body.get("parent_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| task_id.clone());
            return Ok(ChatOutcome::Deferred(DeferredTask {
                task_id,
                chat_id,
                parent_id,
                model: prepared.model.clone(),
            }));
        }

        let outcome = self
            .config
            .poller
            .poll(&*resolved.lease, resolved.token.expose(), &task_id, cancel)
            .await;
        match outcome {
            TaskOutcome::Completed { content, data } => {
                let content = content.unwrap_or_else(|| {
                    data.get("result")
                        .map(Value::to_string)
                        .unwrap_or_else(|| data.to_string())
                });
                let usage = data
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
                    .unwrap_or_default();
                let response_id = body
                    .get("response_id")
                    .or_else(|| body.pointer("/data/response_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ChatOutcome::Completed(ChatCompletion {
                    id: task_id.clone(),
                    created: Utc::now().timestamp(),
                    model: prepared.model.clone(),
                    content,
                    usage,
                    response_id,
                    chat_id,
                    parent_id: Some(task_id.clone()),
                    task_id: Some(task_id),
                }))
            }
            TaskOutcome::Failed { message, data } => {
                Err(AttemptError::Terminal(DispatchError::TaskFailed {
                    task_id: Some(task_id),
                    message,
                    data,
                }))
            }
            TaskOutcome::TimedOut { attempts } => {
                Err(AttemptError::Terminal(DispatchError::TaskTimeout {
                    task_id,
                    attempts,
                }))
            }
            TaskOutcome::Cancelled => Err(AttemptError::Terminal(DispatchError::Cancelled)),
        }
    }

    async fn open_conversation(
        &self,
        resolved: &Resolved,
        request: &NewConversation,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match cancellable(
            cancel,
            resolved
                .lease
                .create_conversation(resolved.token.expose(), request),
        )
        .await
        {
            Ok(chat_id) => {
                debug!(chat_id = %chat_id, "conversation created");
                Ok(chat_id)
            }
            Err(ProviderError::Cancelled) => Err(DispatchError::Cancelled),
            Err(e) => {
                warn!(credential_id = resolved.slot.label(), error = %e, "conversation creation failed");
                Err(DispatchError::ConversationCreate(e.to_string()))
            }
        }
    }

    async fn invalidate(&self, slot: &CredentialSlot) {
        metrics::record_credential_rotation("invalid");
        match slot {
            CredentialSlot::Pooled(id) => {
                if let Err(e) = self.credentials.mark_invalid(id).await {
                    error!(credential_id = %id, error = %e, "failed to mark credential invalid");
                }
            }
            CredentialSlot::Ambient => {
                self.sessions.clear_ambient();
                self.authenticated.store(false, Ordering::Release);
            }
        }
    }

    async fn cooldown(&self, slot: &CredentialSlot, hours: u64) {
        metrics::record_credential_rotation("rate_limited");
        match slot {
            CredentialSlot::Pooled(id) => {
                if let Err(e) = self.credentials.mark_rate_limited(id, hours).await {
                    error!(credential_id = %id, error = %e, "failed to mark credential rate limited");
                }
            }
            // The ambient credential has no record to cool down
            CredentialSlot::Ambient => warn!(hours, "ambient credential rate limited"),
        }
    }

    async fn has_fallback(&self) -> bool {
        self.credentials.has_eligible().await
            || (self.authenticated.load(Ordering::Acquire) && self.sessions.ambient().is_some())
    }

    async fn reset_for_verification(&self) {
        warn!("provider requested interactive verification, resetting execution context");
        self.authenticated.store(false, Ordering::Release);
        if let Err(e) = self.sessions.reset(true).await {
            error!(error = %e, "execution context reset failed");
        }
    }

    fn fail(&self, reason: FailReason, last_failure: Option<UpstreamFailure>) -> DispatchError {
        match reason {
            FailReason::AuthRequired => DispatchError::AuthRequired,
            FailReason::Upstream => match last_failure {
                Some(failure) => DispatchError::Upstream {
                    status: failure.status.unwrap_or(502),
                    body: failure.body,
                },
                None => DispatchError::Transport("upstream failure without details".into()),
            },
            FailReason::CredentialInvalid { attempts } => {
                DispatchError::CredentialInvalid { attempts }
            }
            FailReason::RateLimited { hours, attempts } => DispatchError::RateLimited {
                retry_after_hours: hours,
                attempts,
            },
            FailReason::Exhausted { fatal } => {
                if fatal && !self.config.interactive {
                    error!("every credential was rejected by the provider, halting service");
                    self.halt.cancel();
                    DispatchError::CredentialsExhausted(
                        "every credential was rejected by the provider".into(),
                    )
                } else {
                    DispatchError::CredentialsExhausted(
                        "no credential is currently eligible".into(),
                    )
                }
            }
        }
    }
}

/// Validate message content: a string, or a non-empty array where every part
/// is a text, image or file part.
pub fn validate_message(message: Option<&Value>) -> Result<MessageContent> {
    match message {
        None | Some(Value::Null) => Err(DispatchError::Validation("message is required".into())),
        Some(Value::String(text)) => Ok(MessageContent::Text(text.clone())),
        Some(Value::Array(parts)) if parts.is_empty() => {
            Err(DispatchError::Validation("message has no parts".into()))
        }
        Some(Value::Array(parts)) => parts
            .iter()
            .enumerate()
            .map(|(index, part)| {
                serde_json::from_value::<ContentPart>(part.clone()).map_err(|e| {
                    DispatchError::Validation(format!(
                        "message part {index} is not a text, image or file part: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(MessageContent::Parts),
        Some(_) => Err(DispatchError::Validation(
            "message must be a string or an array of parts".into(),
        )),
    }
}

fn provider_error(e: ProviderError) -> DispatchError {
    match e {
        ProviderError::Cancelled => DispatchError::Cancelled,
        ProviderError::Upstream(failure) => DispatchError::Upstream {
            status: failure.status.unwrap_or(502),
            body: failure.body,
        },
        ProviderError::Transport(msg) | ProviderError::Decode(msg) => DispatchError::Transport(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    use crate::testing::{FakeAuthenticator, Reply, STREAM_OK, Script, harness, harness_with};

    fn text_request(text: &str) -> ChatRequest {
        ChatRequest {
            message: Some(json!(text)),
            ..ChatRequest::default()
        }
    }

    fn completed(outcome: ChatOutcome) -> ChatCompletion {
        match outcome {
            ChatOutcome::Completed(c) => c,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_null_and_malformed_parts() {
        assert!(matches!(
            validate_message(None),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            validate_message(Some(&Value::Null)),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            validate_message(Some(&json!([{"type": "text", "text": "hi"}, {"type": "audio", "audio": "x"}]))),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            validate_message(Some(&json!([{"type": "image"}]))),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            validate_message(Some(&json!([]))),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            validate_message(Some(&json!(42))),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn validate_accepts_text_and_parts() {
        assert_eq!(
            validate_message(Some(&json!("hello"))).unwrap(),
            MessageContent::Text("hello".into())
        );
        let parts = validate_message(Some(&json!([
            {"type": "text", "text": "describe"},
            {"type": "image", "image": "https://img"},
            {"type": "file", "file": "doc-1"}
        ])))
        .unwrap();
        assert!(matches!(parts, MessageContent::Parts(p) if p.len() == 3));
    }

    #[tokio::test]
    async fn null_message_is_rejected_without_network() {
        let h = harness(&[("a", "tok-a")], Script::new(|_| Reply::Stream(STREAM_OK)));
        let result = h
            .dispatcher
            .dispatch(ChatRequest::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DispatchError::Validation(_))));
        assert_eq!(h.script.established.load(Ordering::SeqCst), 0);
        assert!(h.script.tokens().is_empty());
    }

    #[tokio::test]
    async fn streamed_reply_is_reassembled() {
        let h = harness(&[("a", "tok-a")], Script::new(|_| Reply::Stream(STREAM_OK)));
        let out = completed(
            h.dispatcher
                .dispatch(text_request("hi"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(out.content, "Hello");
        assert_eq!(out.chat_id, "chat-1");
        assert_eq!(out.parent_id.as_deref(), Some("resp-1"));
        assert_eq!(out.usage.total_tokens, 5);
        assert_eq!(out.model, "qwen-max-latest");
        assert_eq!(h.script.conversations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn supplied_chat_id_skips_conversation_creation() {
        let h = harness(&[("a", "tok-a")], Script::new(|_| Reply::Stream(STREAM_OK)));
        let request = ChatRequest {
            chat_id: Some("chat-existing".into()),
            parent_id: Some("resp-0".into()),
            ..text_request("again")
        };
        let out = completed(
            h.dispatcher
                .dispatch(request, &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(out.chat_id, "chat-existing");
        assert_eq!(h.script.conversations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_credential_rotates_to_next() {
        let script = Script::new(|token| match token {
            "tok-bad" => Reply::Fail(401, "Unauthorized"),
            _ => Reply::Stream(STREAM_OK),
        });
        let h = harness(&[("bad", "tok-bad"), ("good", "tok-good")], script);

        let out = completed(
            h.dispatcher
                .dispatch(text_request("hi"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(out.content, "Hello");
        assert_eq!(h.script.tokens(), ["tok-bad", "tok-good"]);

        let bad = h
            .dispatcher
            .credentials()
            .list()
            .await
            .into_iter()
            .find(|c| c.id == "bad")
            .unwrap();
        assert!(bad.invalid);
        assert!(!h.halt.is_cancelled());
    }

    #[tokio::test]
    async fn retries_stop_after_max_retry_count() {
        let script = Script::new(|_| Reply::Fail(401, r#"{"code":"Unauthorized"}"#));
        let h = harness(
            &[
                ("a", "tok-a"),
                ("b", "tok-b"),
                ("c", "tok-c"),
                ("d", "tok-d"),
                ("e", "tok-e"),
            ],
            script,
        );
        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(
            matches!(result, Err(DispatchError::CredentialInvalid { attempts: 3 })),
            "got {result:?}"
        );
        assert_eq!(h.script.tokens().len(), 3, "initial attempt plus two retries");
        assert!(!h.halt.is_cancelled(), "eligible credentials remain");
    }

    #[tokio::test]
    async fn rejecting_every_credential_halts_service() {
        let script = Script::new(|_| Reply::Fail(401, "Token has expired"));
        let h = harness(&[("a", "tok-a"), ("b", "tok-b")], script);

        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DispatchError::CredentialsExhausted(_))));
        assert!(h.halt.is_cancelled());

        let next = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(next, Err(DispatchError::ServiceHalted)));
        assert_eq!(h.script.tokens().len(), 2);
    }

    #[tokio::test]
    async fn rate_limited_credential_cools_down_and_rotates() {
        let script = Script::new(|token| match token {
            "tok-a" => Reply::Fail(429, r#"{"code":"RateLimited","num":4}"#),
            _ => Reply::Stream(STREAM_OK),
        });
        let h = harness(&[("a", "tok-a"), ("b", "tok-b")], script);

        completed(
            h.dispatcher
                .dispatch(text_request("hi"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        let a = h
            .dispatcher
            .credentials()
            .list()
            .await
            .into_iter()
            .find(|c| c.id == "a")
            .unwrap();
        let reset_at = a.reset_at.expect("cooldown recorded");
        let minutes = (reset_at - Utc::now()).num_minutes();
        assert!((235..=240).contains(&minutes), "about four hours, got {minutes} minutes");
        assert!(!a.invalid);
    }

    #[tokio::test]
    async fn rate_limiting_every_credential_is_not_fatal() {
        let script = Script::new(|_| Reply::Fail(429, r#"{"code":"RateLimited"}"#));
        let h = harness(&[("a", "tok-a")], script);
        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DispatchError::CredentialsExhausted(_))));
        assert!(!h.halt.is_cancelled());
    }

    #[tokio::test]
    async fn verification_resets_context_without_retry() {
        let script = Script::new(|_| {
            Reply::Fail(200, "<html><head><title>Verification</title></head></html>")
        });
        let h = harness(&[("a", "tok-a"), ("b", "tok-b")], script);
        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DispatchError::VerificationRequired)));
        assert_eq!(h.script.tokens().len(), 1);
        assert_eq!(h.script.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_failures_surface_verbatim() {
        let h = harness(&[("a", "tok-a")], Script::new(|_| Reply::Fail(500, "boom")));
        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        match result {
            Err(DispatchError::Upstream { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
        assert_eq!(h.script.tokens().len(), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let h = harness(&[("a", "tok-a"), ("b", "tok-b")], Script::new(|_| Reply::Transport));
        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DispatchError::Transport(_))));
        assert_eq!(h.script.tokens().len(), 1);
    }

    fn video_task_body() -> Value {
        json!({
            "success": true,
            "data": {
                "parent_id": "parent-9",
                "messages": [{"extra": {"wanx": {"task_id": "task-7"}}}]
            }
        })
    }

    #[tokio::test]
    async fn deferred_task_returns_immediately() {
        let h = harness(
            &[("a", "tok-a")],
            Script::new(|_| Reply::Task(video_task_body())),
        );
        let request = ChatRequest {
            chat_type: Some(ChatType::T2v),
            wait_for_completion: Some(false),
            ..text_request("a cat surfing")
        };
        let outcome = h
            .dispatcher
            .dispatch(request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ChatOutcome::Deferred(DeferredTask {
                task_id: "task-7".into(),
                chat_id: "chat-1".into(),
                parent_id: "parent-9".into(),
                model: "qwen-max-latest".into(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn awaited_task_is_polled_to_completion() {
        let script = Script::new(|_| Reply::Task(video_task_body())).with_statuses(vec![
            json!({"task_status": "processing"}),
            json!({"task_status": "completed", "content": "https://cdn/video.mp4"}),
        ]);
        let h = harness(&[("a", "tok-a")], script);
        let request = ChatRequest {
            chat_type: Some(ChatType::T2v),
            ..text_request("a cat surfing")
        };
        let out = completed(
            h.dispatcher
                .dispatch(request, &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(out.content, "https://cdn/video.mp4");
        assert_eq!(out.task_id.as_deref(), Some("task-7"));
        assert_eq!(out.parent_id.as_deref(), Some("task-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn task_without_content_falls_back_to_result_json() {
        let script = Script::new(|_| Reply::Task(json!({"task_id": "task-3"})))
            .with_statuses(vec![json!({"status": "success", "result": {"frames": 24}})]);
        let h = harness(&[("a", "tok-a")], script);
        let out = completed(
            h.dispatcher
                .dispatch(text_request("render"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(out.content, r#"{"frames":24}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn task_that_never_finishes_times_out() {
        let script = Script::new(|_| Reply::Task(json!({"task_id": "task-5"})))
            .with_statuses(vec![json!({"task_status": "processing"})]);
        let h = harness(&[("a", "tok-a")], script);
        let result = h
            .dispatcher
            .dispatch(text_request("render"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::TaskTimeout { ref task_id, attempts: 3 }) if task_id == "task-5"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_carries_id_and_data() {
        let script = Script::new(|_| Reply::Task(json!({"task_id": "task-8"})))
            .with_statuses(vec![json!({"task_status": "failed", "message": "policy"})]);
        let h = harness(&[("a", "tok-a")], script);
        let result = h
            .dispatcher
            .dispatch(text_request("render"), &CancellationToken::new())
            .await;
        match result {
            Err(DispatchError::TaskFailed {
                task_id,
                message,
                data,
            }) => {
                assert_eq!(task_id.as_deref(), Some("task-8"));
                assert_eq!(message, "policy");
                assert_eq!(data["task_status"], "failed");
            }
            other => panic!("expected task failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_body_with_error_code_is_classified() {
        let script = Script::new(|token| match token {
            "tok-a" => Reply::Task(json!({"success": false, "data": {"code": "RateLimited", "num": 2}})),
            _ => Reply::Stream(STREAM_OK),
        });
        let h = harness(&[("a", "tok-a"), ("b", "tok-b")], script);
        completed(
            h.dispatcher
                .dispatch(text_request("hi"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(h.script.tokens(), ["tok-a", "tok-b"]);
    }

    #[tokio::test]
    async fn empty_pool_without_login_requires_auth() {
        let h = harness(&[], Script::new(|_| Reply::Stream(STREAM_OK)));
        let result = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DispatchError::AuthRequired)));
    }

    #[tokio::test]
    async fn empty_pool_falls_back_to_ambient_credential() {
        let script = Script::new(|_| Reply::Stream(STREAM_OK)).with_ambient("tok-ambient");
        let h = harness(&[], script);
        completed(
            h.dispatcher
                .dispatch(text_request("hi"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(h.script.tokens(), ["tok-ambient"]);
    }

    #[tokio::test]
    async fn rejected_ambient_credential_triggers_login_on_next_request() {
        let script = Script::new(|token| match token {
            "tok-stale" => Reply::Fail(401, "Unauthorized"),
            _ => Reply::Stream(STREAM_OK),
        })
        .with_ambient("tok-stale");
        let authenticator = Arc::new(FakeAuthenticator {
            script: script.clone(),
            runs: AtomicUsize::new(0),
        });
        let config = DispatcherConfig {
            interactive: true,
            ..DispatcherConfig::default()
        };
        let h = harness_with(&[], script, Some(authenticator.clone()), config);

        let first = h
            .dispatcher
            .dispatch(text_request("hi"), &CancellationToken::new())
            .await;
        assert!(matches!(first, Err(DispatchError::CredentialsExhausted(_))));
        assert!(!h.halt.is_cancelled(), "interactive login can still recover");

        completed(
            h.dispatcher
                .dispatch(text_request("hi"), &CancellationToken::new())
                .await
                .unwrap(),
        );
        assert_eq!(authenticator.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.script.tokens(), ["tok-stale", "tok-login"]);
    }

    #[tokio::test]
    async fn cancelled_request_stops() {
        let h = harness(&[("a", "tok-a")], Script::new(|_| Reply::Stream(STREAM_OK)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = h.dispatcher.dispatch(text_request("hi"), &cancel).await;
        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn create_conversation_and_task_status() {
        let script = Script::new(|_| Reply::Stream(STREAM_OK))
            .with_statuses(vec![json!({"task_status": "processing"})]);
        let h = harness(&[("a", "tok-a")], script);
        let cancel = CancellationToken::new();

        let chat_id = h
            .dispatcher
            .create_conversation(Some("Notes".into()), None, &cancel)
            .await
            .unwrap();
        assert_eq!(chat_id, "chat-1");

        let status = h.dispatcher.task_status("task-1", &cancel).await.unwrap();
        assert_eq!(status["task_status"], "processing");
    }

    #[tokio::test]
    async fn probe_reports_and_marks_credentials() {
        let script = Script::new(|token| match token {
            "tok-ok" => Reply::Task(json!({"success": true})),
            "tok-400" => Reply::Fail(400, "bad request"),
            "tok-expired" => Reply::Fail(401, "Unauthorized"),
            "tok-limited" => Reply::Fail(429, r#"{"code":"RateLimited"}"#),
            _ => Reply::Fail(502, "bad gateway"),
        });
        let h = harness(
            &[
                ("ok", "tok-ok"),
                ("accepted", "tok-400"),
                ("expired", "tok-expired"),
                ("limited", "tok-limited"),
                ("broken", "tok-broken"),
            ],
            script,
        );
        let reports = h
            .dispatcher
            .probe_credentials(&CancellationToken::new())
            .await
            .unwrap();
        let statuses: Vec<(String, ProbeStatus)> =
            reports.iter().map(|r| (r.id.clone(), r.status)).collect();
        assert_eq!(
            statuses,
            [
                ("ok".to_string(), ProbeStatus::Ok),
                ("accepted".to_string(), ProbeStatus::Ok),
                ("expired".to_string(), ProbeStatus::Unauthorized),
                ("limited".to_string(), ProbeStatus::RateLimit),
                ("broken".to_string(), ProbeStatus::Error),
            ]
        );

        // A second probe leaves the cooling credential alone
        let again = h
            .dispatcher
            .probe_credentials(&CancellationToken::new())
            .await
            .unwrap();
        let limited = again.iter().find(|r| r.id == "limited").unwrap();
        assert_eq!(limited.status, ProbeStatus::Wait);
        assert!(limited.reset_at.is_some());

        let json = serde_json::to_value(limited).unwrap();
        assert_eq!(json["status"], "WAIT");
        assert!(json.get("resetAt").is_some());
    }

    #[tokio::test]
    async fn probe_restores_previously_invalid_credential() {
        let h = harness(
            &[("a", "tok-a")],
            Script::new(|_| Reply::Task(json!({"success": true}))),
        );
        h.dispatcher.credentials().mark_invalid("a").await.unwrap();
        assert!(!h.dispatcher.credentials().has_eligible().await);

        h.dispatcher
            .probe_credentials(&CancellationToken::new())
            .await
            .unwrap();
        assert!(h.dispatcher.credentials().has_eligible().await);
    }
}
