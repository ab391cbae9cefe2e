//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Runtime counters reported on the health endpoint
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being processed; reported when the drain times out
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Why the service is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// SIGTERM/SIGINT
    Signal,
    /// Every credential was rejected by the provider
    CredentialsLost,
}

impl StopReason {
    fn exit_code(self) -> i32 {
        match self {
            StopReason::Signal => 0,
            StopReason::CredentialsLost => 1,
        }
    }
}

#[derive(Debug)]
pub enum ServiceState {
    /// Loading config, setting up resources
    Initializing,
    /// Reading environment and persisted credentials
    LoadingCredentials { listen_addr: SocketAddr },
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Serving requests
    Running { listen_addr: SocketAddr },
    /// Graceful shutdown, finishing in-flight requests
    Draining { reason: StopReason, deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
}

#[derive(Debug)]
pub enum ServiceEvent {
    /// Configuration parsed successfully
    ConfigLoaded { listen_addr: SocketAddr },
    /// Credential pool loaded
    CredentialsLoaded { eligible: usize, interactive: bool },
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// The dispatcher cancelled the halt token
    CredentialsLost,
    /// Server finished draining
    Drained,
    /// Drain deadline exceeded
    DrainTimeout,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceAction {
    /// Load the credential pool
    LoadCredentials,
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Stop accepting connections and wait for in-flight requests
    BeginDrain,
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Upper bound on waiting for in-flight requests after shutdown starts
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { listen_addr }) => (
            ServiceState::LoadingCredentials { listen_addr },
            ServiceAction::LoadCredentials,
        ),

        // --- LoadingCredentials ---
        // An interactive login can supply a credential later; otherwise
        // refuse to start without one.
        (
            ServiceState::LoadingCredentials { listen_addr },
            ServiceEvent::CredentialsLoaded {
                eligible,
                interactive,
            },
        ) if eligible > 0 || interactive => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (ServiceState::LoadingCredentials { .. }, ServiceEvent::CredentialsLoaded { .. }) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => (
            ServiceState::Running { listen_addr },
            ServiceAction::None,
        ),

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                reason: StopReason::Signal,
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::BeginDrain,
        ),

        (ServiceState::Running { .. }, ServiceEvent::CredentialsLost) => (
            ServiceState::Draining {
                reason: StopReason::CredentialsLost,
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::BeginDrain,
        ),

        // --- Draining ---
        (
            ServiceState::Draining { reason, .. },
            ServiceEvent::Drained | ServiceEvent::DrainTimeout,
        ) => {
            let exit_code = reason.exit_code();
            (
                ServiceState::Stopped { exit_code },
                ServiceAction::Shutdown { exit_code },
            )
        }

        // --- Before serving, a signal stops immediately ---
        (
            ServiceState::Initializing
            | ServiceState::LoadingCredentials { .. }
            | ServiceState::Starting { .. },
            ServiceEvent::ShutdownSignal,
        ) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
