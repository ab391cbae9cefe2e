//! Upstream provider boundary for the chat proxy
//!
//! Everything that touches the third-party chat service goes through the
//! traits in this crate. The dispatcher only ever sees:
//! - a `SessionFactory` that opens sessions against the provider's front door
//!   and can tear the execution context down and bring it back up,
//! - `Session` handles that create conversations, execute chat payloads and
//!   query task status on behalf of a credential,
//! - an `Authenticator` that runs the out-of-band interactive login.
//!
//! Synchronous generations come back as an incremental byte stream that
//! `stream::StreamDecoder` reassembles; asynchronous generations come back as a
//! task reference that `task::TaskPoller` drives to a terminal state.
//!
//! Trait methods return `Pin<Box<dyn Future>>` so the traits stay
//! dyn-compatible (`Arc<dyn SessionFactory>`, `Box<dyn Session>`).

pub mod http;
pub mod payload;
pub mod stream;
pub mod task;

pub use http::{HttpSession, HttpSessionFactory};
pub use payload::{ChatPayload, ChatType, ContentPart, MessageContent, NewConversation, PayloadParams};
pub use stream::{DecodedResponse, StreamDecoder, StreamRecord, Usage};
pub use task::{TaskOutcome, TaskPoller};

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by the provider traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Incrementally delivered response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// How an upstream failure should be handled by the dispatcher.
///
/// Checked in declaration order; the first matching kind wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Provider wants a human to pass an interactive challenge. The execution
    /// context must be rebuilt in interactive mode; never retried automatically.
    VerificationRequired,
    /// Credential expired or revoked: mark invalid and rotate.
    InvalidCredential,
    /// Daily quota hit: cool the credential down and rotate.
    RateLimited { retry_after_hours: u64 },
    /// Anything else, surfaced to the caller verbatim.
    Other,
}

impl ErrorClassification {
    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::VerificationRequired => "verification_required",
            ErrorClassification::InvalidCredential => "invalid_credential",
            ErrorClassification::RateLimited { .. } => "rate_limited",
            ErrorClassification::Other => "other",
        }
    }
}

/// A non-success answer from the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    /// HTTP status, when the failure came with one
    pub status: Option<u16>,
    /// Raw response body (JSON error document or HTML challenge page)
    pub body: String,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.body),
            None => write!(f, "{}", self.body),
        }
    }
}

/// Errors from provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream failure ({0})")]
    Upstream(UpstreamFailure),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid upstream response: {0}")]
    Decode(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// What a chat execution produced.
pub enum ExecuteOutcome {
    /// Record-framed incremental body (plain chat, image generation)
    Stream(ByteStream),
    /// Non-streaming body that references an asynchronous job
    Task(serde_json::Value),
}

impl fmt::Debug for ExecuteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteOutcome::Stream(_) => f.write_str("Stream(..)"),
            ExecuteOutcome::Task(body) => f.debug_tuple("Task").field(body).finish(),
        }
    }
}

/// One live connection to the provider, owned by a single in-flight request.
pub trait Session: Send + Sync {
    /// Identifier for logging.
    fn id(&self) -> &str;

    /// Create a provider-side conversation and return its chat id.
    fn create_conversation<'a>(
        &'a self,
        token: &'a str,
        request: &'a NewConversation,
    ) -> BoxFuture<'a, Result<String>>;

    /// Send a chat payload. Non-success upstream answers are returned as
    /// `ProviderError::Upstream` so they can be classified.
    fn execute<'a>(
        &'a self,
        token: &'a str,
        payload: &'a ChatPayload,
    ) -> BoxFuture<'a, Result<ExecuteOutcome>>;

    /// Query the status document of an asynchronous job.
    fn task_status<'a>(
        &'a self,
        token: &'a str,
        task_id: &'a str,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;

    /// Read the credential the execution context is currently logged in with.
    fn extract_credential(&self) -> BoxFuture<'_, Result<Option<String>>>;

    /// Release underlying resources. Called when the pool does not retain the handle.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Opens sessions and owns the execution context behind them.
pub trait SessionFactory: Send + Sync {
    /// Open a new session against the provider's front door and wait until it
    /// is minimally ready.
    fn establish(&self) -> BoxFuture<'_, Result<Box<dyn Session>>>;

    /// Tear the execution context down and recreate it. `interactive` asks for
    /// a context a human can complete a challenge in.
    fn reset(&self, interactive: bool) -> BoxFuture<'_, Result<()>>;
}

/// Out-of-band interactive login.
pub trait Authenticator: Send + Sync {
    /// Run the interactive flow. Returns whether the context is authenticated
    /// afterwards.
    fn authenticate(&self) -> BoxFuture<'_, Result<bool>>;
}

/// Race a provider future against a cancellation token.
///
/// Dropping the losing future aborts in-flight network I/O.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        out = fut => out,
    }
}
