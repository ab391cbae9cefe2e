//! Qwen chat proxy
//!
//! Single-binary Rust service that:
//! 1. Loads session tokens from the environment and the credential store
//! 2. Serves a chat API under /api, /api/v1 and /api/v2
//! 3. Runs each request on a pooled provider session, rotating credentials
//!    when the provider rejects or throttles one

mod admin;
mod api;
mod auth;
mod config;
mod dispatch;
mod dispatcher;
mod error;
mod metrics;
mod models;
mod service;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use provider::http::HttpSessionConfig;
use provider::{Authenticator, HttpSessionFactory, TaskPoller};
use qwen_auth::CredentialStore;
use qwen_pool::{CredentialPool, EnvCredentials, SessionPool, SessionPoolConfig};

use crate::admin::AdminState;
use crate::api::ApiState;
use crate::auth::{ApiKeys, ConsoleAuthenticator};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::models::ModelCatalog;
use crate::service::{
    DRAIN_TIMEOUT, ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event,
};

/// Shared state for the health and metrics endpoints
#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router: health and metrics plus the chat API.
///
/// The concurrency limit covers every route; API keys only gate the chat API.
fn build_router(state: AppState, api: Router, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(api)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting qwen-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), explicit, "loading configuration");

    let config = Config::load_or_default(&config_path, explicit)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        interactive = config.auth.interactive,
        api_keys = config.auth.api_keys.len(),
        admin = config.admin.listen_addr.is_some(),
        "configuration loaded"
    );

    // Transition: Initializing -> LoadingCredentials
    let (new_state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
        },
    );
    state = new_state;
    if action != ServiceAction::LoadCredentials {
        anyhow::bail!("unexpected action after ConfigLoaded: {action:?}");
    }

    let store = Arc::new(CredentialStore::new(config.credentials.store_path.clone()));
    let credentials = Arc::new(CredentialPool::new(
        store,
        EnvCredentials::Vars {
            single: config.credentials.env_var.clone(),
            list: config.credentials.env_list_var.clone(),
        },
    ));
    let total = credentials.list().await.len();
    let eligible = credentials.eligible_count().await;
    info!(
        total,
        eligible,
        store = %config.credentials.store_path.display(),
        "credentials loaded"
    );

    // Transition: LoadingCredentials -> Starting
    let (new_state, action) = handle_event(
        state,
        ServiceEvent::CredentialsLoaded {
            eligible,
            interactive: config.auth.interactive,
        },
    );
    state = new_state;

    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        ServiceAction::Shutdown { exit_code } => {
            error!(
                total,
                env_var = %config.credentials.env_var,
                env_list_var = %config.credentials.env_list_var,
                "no eligible credential; provide a session token or enable auth.interactive"
            );
            std::process::exit(exit_code);
        }
        _ => anyhow::bail!("unexpected action after CredentialsLoaded: {action:?}"),
    };

    let factory = Arc::new(HttpSessionFactory::new(HttpSessionConfig {
        base_url: config.upstream.base_url.clone(),
        front_door_timeout: Duration::from_secs(config.upstream.front_door_timeout_secs),
        user_agent: config.upstream.user_agent.clone(),
        ambient_token_path: Some(config.credentials.ambient_token_path.clone()),
    }));
    let sessions = SessionPool::new(
        factory,
        SessionPoolConfig {
            idle_capacity: config.sessions.idle_capacity,
            max_live_sessions: config.sessions.max_live_sessions,
        },
    );
    let models = ModelCatalog::from_config(&config.models).context("failed to load model catalog")?;

    let authenticator: Option<Arc<dyn Authenticator>> = if config.auth.interactive {
        Some(Arc::new(ConsoleAuthenticator::stdin(
            config.credentials.ambient_token_path.clone(),
        )))
    } else {
        None
    };

    // Cancelled by the dispatcher once no credential can serve traffic
    let halt = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(
        credentials.clone(),
        sessions,
        authenticator,
        models,
        DispatcherConfig {
            max_retries: config.dispatch.max_retries,
            default_rate_limit_hours: config.dispatch.default_rate_limit_hours,
            poller: TaskPoller::new(
                Duration::from_millis(config.tasks.poll_interval_ms),
                config.tasks.max_attempts,
            ),
            interactive: config.auth.interactive,
        },
        halt.clone(),
    ));

    let metrics = ServiceMetrics::new();

    let api = api::build_api_router(
        ApiState {
            dispatcher: dispatcher.clone(),
            metrics: metrics.clone(),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            chunk_delay: Duration::from_millis(config.server.stream_chunk_delay_ms),
        },
        ApiKeys::new(config.auth.api_keys.clone()),
    );
    if config.auth.api_keys.is_empty() {
        warn!("no API keys configured, the chat API is open");
    }

    let app_state = AppState {
        dispatcher: dispatcher.clone(),
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, api, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Admin listener stops with the main one but is not drained
    let admin_shutdown = CancellationToken::new();
    if let Some(admin_addr) = config.admin.listen_addr {
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
        let admin_app = admin::build_admin_router(AdminState::new(credentials.clone()));
        let stop = admin_shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "admin server error");
            }
        });
        info!(addr = %admin_addr, "admin API listening");
    }

    // Transition: Starting -> Running
    let (new_state, _action) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, "state: Running, accepting requests");

    let in_flight = metrics.in_flight.clone();

    // Graceful shutdown: the drain window opens when the stop event fires,
    // not when the server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let stop = tokio::select! {
        _ = shutdown_signal() => ServiceEvent::ShutdownSignal,
        _ = halt.cancelled() => {
            error!("every credential was rejected, shutting down");
            ServiceEvent::CredentialsLost
        }
    };

    // Transition: Running -> Draining
    let (new_state, action) = handle_event(state, stop);
    state = new_state;
    if action != ServiceAction::BeginDrain {
        anyhow::bail!("unexpected action on shutdown: {action:?}");
    }
    let deadline = match &state {
        ServiceState::Draining { deadline, .. } => *deadline,
        _ => std::time::Instant::now() + DRAIN_TIMEOUT,
    };

    // Signal the servers to begin draining
    let _ = shutdown_tx.send(());
    admin_shutdown.cancel();

    let drained = match tokio::time::timeout_at(deadline.into(), server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::Drained
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::Drained
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::Drained
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    dispatcher.sessions().drain().await;

    // Transition: Draining -> Stopped
    let (_state, action) = handle_event(state, drained);
    info!("shutdown complete");
    match action {
        ServiceAction::Shutdown { exit_code } if exit_code != 0 => std::process::exit(exit_code),
        _ => Ok(()),
    }
}

/// Health endpoint: pool summary, session counts, uptime and request counters.
///
/// Returns 200 while some credential or an authenticated session can serve
/// traffic, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);
    let in_flight = state.metrics.in_flight.load(Ordering::Relaxed);

    let dispatcher = &state.dispatcher;
    let pool = dispatcher.credentials().health().await;
    let sessions = dispatcher.sessions();
    let ambient = dispatcher.is_authenticated() && sessions.ambient().is_some();

    let status = match pool["status"].as_str().unwrap_or("unhealthy") {
        _ if dispatcher.is_halted() => "halted",
        "unhealthy" if ambient => "degraded",
        other => other,
    }
    .to_string();
    let status_code = if matches!(status.as_str(), "unhealthy" | "halted") {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "authenticated": dispatcher.is_authenticated(),
        "pool": pool,
        "sessions": {
            "idle": sessions.idle_count(),
            "live": sessions.live_count(),
        },
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
        "in_flight": in_flight,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
