//! Scripted provider fakes shared by the dispatcher and router tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use provider::{
    Authenticator, BoxFuture, ChatPayload, ExecuteOutcome, NewConversation, ProviderError,
    Session, SessionFactory, TaskPoller, UpstreamFailure,
};
use qwen_auth::{Credential, CredentialStore};
use qwen_pool::{CredentialPool, EnvCredentials, SessionPool, SessionPoolConfig};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::models::ModelCatalog;

pub(crate) const STREAM_OK: &str = concat!(
    "data: {\"response.created\":{\"response_id\":\"resp-1\"}}\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\",\"status\":\"finished\"}}],\"usage\":{\"input_tokens\":2,\"output_tokens\":3}}\n",
);

#[derive(Clone)]
pub(crate) enum Reply {
    Stream(&'static str),
    Task(Value),
    Fail(u16, &'static str),
    Transport,
}

type Responder = Box<dyn Fn(&str) -> Reply + Send + Sync>;

/// Scripted provider shared by every session the fake factory opens.
pub(crate) struct Script {
    reply: Responder,
    tokens: Mutex<Vec<String>>,
    pub(crate) conversations: AtomicUsize,
    statuses: Mutex<VecDeque<Value>>,
    pub(crate) ambient: Mutex<Option<String>>,
    pub(crate) established: AtomicUsize,
    pub(crate) resets: AtomicUsize,
}

impl Script {
    pub(crate) fn new(reply: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            tokens: Mutex::new(Vec::new()),
            conversations: AtomicUsize::new(0),
            statuses: Mutex::new(VecDeque::new()),
            ambient: Mutex::new(None),
            established: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_statuses(self: Arc<Self>, statuses: Vec<Value>) -> Arc<Self> {
        *self.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub(crate) fn with_ambient(self: Arc<Self>, token: &str) -> Arc<Self> {
        *self.ambient.lock().unwrap() = Some(token.into());
        self
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

pub(crate) struct FakeSession {
    script: Arc<Script>,
}

impl Session for FakeSession {
    fn id(&self) -> &str {
        "fake"
    }

    fn create_conversation<'a>(
        &'a self,
        _token: &'a str,
        _request: &'a NewConversation,
    ) -> BoxFuture<'a, provider::Result<String>> {
        Box::pin(async move {
            let n = self.script.conversations.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("chat-{n}"))
        })
    }

    fn execute<'a>(
        &'a self,
        token: &'a str,
        _payload: &'a ChatPayload,
    ) -> BoxFuture<'a, provider::Result<ExecuteOutcome>> {
        Box::pin(async move {
            self.script.tokens.lock().unwrap().push(token.to_string());
            match (self.script.reply)(token) {
                Reply::Stream(text) => {
                    let chunks: Vec<provider::Result<bytes::Bytes>> = text
                        .as_bytes()
                        .chunks(7)
                        .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
                        .collect();
                    Ok(ExecuteOutcome::Stream(Box::pin(futures_util::stream::iter(
                        chunks,
                    ))))
                }
                Reply::Task(body) => Ok(ExecuteOutcome::Task(body)),
                Reply::Fail(status, body) => Err(ProviderError::Upstream(UpstreamFailure {
                    status: Some(status),
                    body: body.to_string(),
                })),
                Reply::Transport => Err(ProviderError::Transport("connection reset".into())),
            }
        })
    }

    fn task_status<'a>(
        &'a self,
        _token: &'a str,
        _task_id: &'a str,
    ) -> BoxFuture<'a, provider::Result<Value>> {
        Box::pin(async move {
            let mut statuses = self.script.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front()
            } else {
                statuses.front().cloned()
            };
            Ok(status.unwrap_or_else(|| json!({"task_status": "processing"})))
        })
    }

    fn extract_credential(&self) -> BoxFuture<'_, provider::Result<Option<String>>> {
        Box::pin(async move { Ok(self.script.ambient.lock().unwrap().clone()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

pub(crate) struct FakeFactory {
    script: Arc<Script>,
}

impl SessionFactory for FakeFactory {
    fn establish(&self) -> BoxFuture<'_, provider::Result<Box<dyn Session>>> {
        Box::pin(async move {
            self.script.established.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                script: self.script.clone(),
            }) as Box<dyn Session>)
        })
    }

    fn reset(&self, _interactive: bool) -> BoxFuture<'_, provider::Result<()>> {
        Box::pin(async move {
            self.script.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Login that hands the context a fresh token.
pub(crate) struct FakeAuthenticator {
    pub(crate) script: Arc<Script>,
    pub(crate) runs: AtomicUsize,
}

impl Authenticator for FakeAuthenticator {
    fn authenticate(&self) -> BoxFuture<'_, provider::Result<bool>> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.script.ambient.lock().unwrap() = Some("tok-login".into());
            Ok(true)
        })
    }
}

pub(crate) struct Harness {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) script: Arc<Script>,
    pub(crate) halt: CancellationToken,
    pub(crate) _dir: tempfile::TempDir,
}

pub(crate) fn harness_with(
    credentials: &[(&str, &str)],
    script: Arc<Script>,
    authenticator: Option<Arc<dyn Authenticator>>,
    config: DispatcherConfig,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CredentialStore::new(dir.path().join("tokens.json")));
    let env = EnvCredentials::Static(
        credentials
            .iter()
            .map(|(id, token)| Credential::new(*id, *token, *id))
            .collect(),
    );
    let pool = Arc::new(CredentialPool::new(store, env));
    let sessions = SessionPool::new(
        Arc::new(FakeFactory {
            script: script.clone(),
        }),
        SessionPoolConfig::default(),
    );
    let models = ModelCatalog::new("qwen-max-latest".into(), vec![], HashMap::new());
    let halt = CancellationToken::new();
    Harness {
        dispatcher: Dispatcher::new(pool, sessions, authenticator, models, config, halt.clone()),
        script,
        halt,
        _dir: dir,
    }
}

pub(crate) fn harness(credentials: &[(&str, &str)], script: Arc<Script>) -> Harness {
    let config = DispatcherConfig {
        poller: TaskPoller::new(Duration::from_millis(100), 3),
        ..DispatcherConfig::default()
    };
    harness_with(credentials, script, None, config)
}
