//! HTTP sessions against the provider's web API
//!
//! A session is one reqwest client that has completed a front-door request.
//! The execution context is the factory itself: `reset` bumps its generation
//! so sessions opened afterwards are distinguishable in logs, and records
//! whether the next context should wait for a human.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    BoxFuture, ChatPayload, ExecuteOutcome, NewConversation, ProviderError, Result, Session,
    SessionFactory, UpstreamFailure,
};

const CHAT_PATH: &str = "/api/v2/chat/completions";
const NEW_CHAT_PATH: &str = "/api/v2/chats/new";
const TASK_STATUS_PATH: &str = "/api/v1/tasks/status";

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    /// Provider origin, e.g. `https://chat.qwen.ai`
    pub base_url: String,
    /// Bound on the front-door request of a new session
    pub front_door_timeout: Duration,
    pub user_agent: String,
    /// File the interactive login writes the session token to
    pub ambient_token_path: Option<PathBuf>,
}

pub struct HttpSessionFactory {
    config: HttpSessionConfig,
    generation: AtomicU64,
    interactive: AtomicBool,
}

impl HttpSessionFactory {
    pub fn new(mut config: HttpSessionConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            config,
            generation: AtomicU64::new(0),
            interactive: AtomicBool::new(false),
        }
    }

    /// Whether the current context was brought up for a human to complete a challenge.
    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

impl SessionFactory for HttpSessionFactory {
    fn establish(&self) -> BoxFuture<'_, Result<Box<dyn Session>>> {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .user_agent(self.config.user_agent.clone())
                .connect_timeout(self.config.front_door_timeout)
                .build()
                .map_err(|e| ProviderError::Transport(format!("failed to build client: {e}")))?;

            let front_door = format!("{}/", self.config.base_url);
            let response = client
                .get(&front_door)
                .timeout(self.config.front_door_timeout)
                .send()
                .await
                .map_err(|e| ProviderError::Transport(format!("front door unreachable: {e}")))?;

            let status = response.status();
            if status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Upstream(UpstreamFailure {
                    status: Some(status.as_u16()),
                    body,
                }));
            }

            let id = format!(
                "http-{}-{}",
                self.generation(),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            debug!(session_id = %id, status = status.as_u16(), "session established");

            Ok(Box::new(HttpSession {
                id,
                client,
                base_url: self.config.base_url.clone(),
                ambient_token_path: self.config.ambient_token_path.clone(),
            }) as Box<dyn Session>)
        })
    }

    fn reset(&self, interactive: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            self.interactive.store(interactive, Ordering::Relaxed);
            info!(generation, interactive, "execution context reset");
            Ok(())
        })
    }
}

pub struct HttpSession {
    id: String,
    client: reqwest::Client,
    base_url: String,
    ambient_token_path: Option<PathBuf>,
}

impl HttpSession {
    fn bearer(token: &str) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProviderError::Transport(format!("invalid token value: {e}")))
    }

    /// Send and turn any non-success answer into `ProviderError::Upstream`.
    ///
    /// A challenge page can come back with a success status, so an HTML body
    /// is treated as a failure too and handed to classification verbatim.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/html"));

        if status.is_success() && !is_html {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        warn!(session_id = %self.id, status = status.as_u16(), is_html, "upstream rejected request");
        Err(ProviderError::Upstream(UpstreamFailure {
            status: Some(status.as_u16()),
            body,
        }))
    }

    async fn json(response: reqwest::Response) -> Result<Value> {
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

impl Session for HttpSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_conversation<'a>(
        &'a self,
        token: &'a str,
        request: &'a NewConversation,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let url = format!("{}{NEW_CHAT_PATH}", self.base_url);
            let response = self
                .send(
                    self.client
                        .post(url)
                        .header(reqwest::header::AUTHORIZATION, Self::bearer(token)?)
                        .json(request),
                )
                .await?;
            let body = Self::json(response).await?;

            body.pointer("/data/id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ProviderError::Decode(format!("conversation id missing in {body}")))
        })
    }

    fn execute<'a>(
        &'a self,
        token: &'a str,
        payload: &'a ChatPayload,
    ) -> BoxFuture<'a, Result<ExecuteOutcome>> {
        Box::pin(async move {
            let url = reqwest::Url::parse_with_params(
                &format!("{}{CHAT_PATH}", self.base_url),
                &[("chat_id", payload.chat_id.as_str())],
            )
            .map_err(|e| ProviderError::Transport(format!("invalid chat url: {e}")))?;
            let response = self
                .send(
                    self.client
                        .post(url)
                        .header(reqwest::header::AUTHORIZATION, Self::bearer(token)?)
                        .header(ACCEPT, "*/*")
                        .json(payload),
                )
                .await?;

            if !payload.stream {
                return Ok(ExecuteOutcome::Task(Self::json(response).await?));
            }

            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| ProviderError::Transport(e.to_string())));
            Ok(ExecuteOutcome::Stream(Box::pin(stream)))
        })
    }

    fn task_status<'a>(
        &'a self,
        token: &'a str,
        task_id: &'a str,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let url = format!("{}{TASK_STATUS_PATH}/{task_id}", self.base_url);
            let response = self
                .send(
                    self.client
                        .get(url)
                        .header(reqwest::header::AUTHORIZATION, Self::bearer(token)?)
                        .header(ACCEPT, "application/json"),
                )
                .await?;
            Self::json(response).await
        })
    }

    fn extract_credential(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let Some(path) = &self.ambient_token_path else {
                return Ok(None);
            };
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    let token = contents.trim();
                    Ok((!token.is_empty()).then(|| token.to_string()))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(ProviderError::Transport(format!(
                    "failed to read {}: {e}",
                    path.display()
                ))),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(session_id = %self.id, "session closed");
        })
    }
}
