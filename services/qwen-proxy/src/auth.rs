//! Client authentication and the interactive provider login
//!
//! Two unrelated gates live here. `require_api_key` guards the public API
//! with bearer keys from the configured keys file; without keys the API is
//! open. `ConsoleAuthenticator` logs the execution context back into the
//! provider by asking the operator for a session token on the terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::Secret;
use provider::{Authenticator, BoxFuture, ProviderError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Accepted client keys. Empty means the API is open.
#[derive(Clone, Default)]
pub struct ApiKeys(Arc<Vec<Secret<String>>>);

impl ApiKeys {
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        Self(Arc::new(keys))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn accepts(&self, candidate: &str) -> bool {
        self.0.iter().any(|key| key.matches(candidate))
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": message }).to_string(),
    )
        .into_response()
}

/// Middleware requiring `Authorization: Bearer <key>` when keys are configured.
pub async fn require_api_key(State(keys): State<ApiKeys>, request: Request, next: Next) -> Response {
    if keys.is_empty() {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(key) = bearer else {
        warn!(path = %request.uri().path(), "request without bearer authorization");
        return unauthorized("Authorization required");
    };
    if !keys.accepts(key.trim()) {
        warn!(path = %request.uri().path(), "request with unknown API key");
        return unauthorized("Invalid token");
    }
    next.run(request).await
}

type Input = Box<dyn AsyncBufRead + Send + Unpin>;

/// Interactive login over the operator's terminal.
///
/// The token entered is written to the ambient token file the HTTP sessions
/// read their credential from.
pub struct ConsoleAuthenticator {
    token_path: PathBuf,
    input: Mutex<Input>,
}

impl ConsoleAuthenticator {
    pub fn stdin(token_path: PathBuf) -> Self {
        Self::with_input(token_path, Box::new(tokio::io::BufReader::new(tokio::io::stdin())))
    }

    pub fn with_input(token_path: PathBuf, input: Input) -> Self {
        Self {
            token_path,
            input: Mutex::new(input),
        }
    }

    async fn prompt(&self) -> std::io::Result<Option<String>> {
        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(
                b"\nThe provider session needs a login.\n\
                  Sign in at https://chat.qwen.ai, copy the session token and paste it here:\n> ",
            )
            .await?;
        stderr.flush().await?;

        let mut line = String::new();
        let read = self.input.lock().await.read_line(&mut line).await?;
        let token = line.trim();
        Ok((read > 0 && !token.is_empty()).then(|| token.to_string()))
    }
}

impl Authenticator for ConsoleAuthenticator {
    fn authenticate(&self) -> BoxFuture<'_, provider::Result<bool>> {
        Box::pin(async move {
            let token = self
                .prompt()
                .await
                .map_err(|e| ProviderError::Transport(format!("reading login token: {e}")))?;
            let Some(token) = token else {
                warn!("no token entered, session stays logged out");
                return Ok(false);
            };
            write_token_file(&self.token_path, &token)
                .await
                .map_err(|e| ProviderError::Transport(format!("saving login token: {e}")))?;
            info!(path = %self.token_path.display(), "login token saved");
            Ok(true)
        })
    }
}

/// Atomic write (temp file + rename), mode 0600 on unix.
async fn write_token_file(path: &Path, token: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp_path = dir.join(format!(".auth_token.tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, token.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use tower::ServiceExt;

    fn gated(keys: ApiKeys) -> Router {
        Router::new()
            .route("/models", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(keys, require_api_key))
    }

    async fn call(app: Router, authorization: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/models");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn keys() -> ApiKeys {
        ApiKeys::new(vec![Secret::new("key-1".into()), Secret::new("key-2".into())])
    }

    #[tokio::test]
    async fn open_when_no_keys_configured() {
        let (status, body) = call(gated(ApiKeys::default()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let (status, body) = call(gated(keys()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Authorization required"));

        let (status, _) = call(gated(keys()), Some("Basic a2V5LTE=")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let (status, body) = call(gated(keys()), Some("Bearer key-3")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Invalid token"));
    }

    #[tokio::test]
    async fn listed_key_passes() {
        let (status, _) = call(gated(keys()), Some("Bearer key-2")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn console_login_saves_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session").join("auth_token");
        let auth = ConsoleAuthenticator::with_input(path.clone(), Box::new(&b"  tok-123 \n"[..]));

        assert!(auth.authenticate().await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "tok-123");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[tokio::test]
    async fn empty_console_input_stays_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_token");
        let auth = ConsoleAuthenticator::with_input(path.clone(), Box::new(&b"\n"[..]));
        assert!(!auth.authenticate().await.unwrap());
        assert!(!path.exists());

        let eof = ConsoleAuthenticator::with_input(path.clone(), Box::new(&b""[..]));
        assert!(!eof.authenticate().await.unwrap());
    }
}
