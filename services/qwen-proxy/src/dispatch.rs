//! Dispatch state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The dispatcher executes the I/O implied by each action and reports the
//! result back as the next event, so the retry ceiling lives in one place.
//!
//! ```text
//! Resolving ──CredentialResolved──▶ Executing ──Succeeded──▶ Finished
//!    ▲                                 │
//!    │                        Failed(invalid | rate limited)
//!    │                                 ▼
//!    └────────Recovered(retry)─────  Recovering ──Recovered(give up)──▶ Failed
//! ```

use provider::ErrorClassification;

/// Which credential an attempt runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSlot {
    /// Taken from the credential pool
    Pooled(String),
    /// The credential the execution context is logged in with
    Ambient,
}

impl CredentialSlot {
    pub fn label(&self) -> &str {
        match self {
            CredentialSlot::Pooled(id) => id,
            CredentialSlot::Ambient => "ambient",
        }
    }
}

/// Credential failure being recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setback {
    Invalid,
    RateLimited { hours: u64 },
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// Looking for a credential; `retries` attempts have already failed
    Resolving { retries: u32 },
    /// Request in flight
    Executing { retries: u32, slot: CredentialSlot },
    /// Credential marked, waiting to learn whether another one is eligible
    Recovering { retries: u32, setback: Setback },
    /// Terminal: response produced
    Finished,
    /// Terminal: error returned to the caller
    Failed,
}

#[derive(Debug)]
pub enum DispatchEvent {
    CredentialResolved(CredentialSlot),
    /// Pool empty and no authenticated context to fall back on
    CredentialUnavailable,
    Succeeded,
    Failed(ErrorClassification),
    /// Marks applied; `eligible` reports whether any credential remains
    Recovered { eligible: bool },
}

/// Why a request ends in failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    AuthRequired,
    /// Unclassified provider failure, surfaced verbatim
    Upstream,
    /// Retry budget spent while credentials were still being rejected
    CredentialInvalid { attempts: u32 },
    RateLimited { hours: u64, attempts: u32 },
    /// Nothing eligible is left. `fatal` when the last credential was
    /// rejected outright rather than cooled down.
    Exhausted { fatal: bool },
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchAction {
    Execute(CredentialSlot),
    /// Mark the credential invalid, then report `Recovered`
    Invalidate(CredentialSlot),
    /// Cool the credential down, then report `Recovered`
    Cooldown { slot: CredentialSlot, hours: u64 },
    /// Rebuild the execution context in interactive mode; terminal
    ResetSession,
    /// Resolve a fresh credential
    Retry,
    Fail(FailReason),
    Finish,
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(
    state: DispatchState,
    event: DispatchEvent,
    max_retries: u32,
) -> (DispatchState, DispatchAction) {
    match (state, event) {
        // --- Resolving ---
        (DispatchState::Resolving { retries }, DispatchEvent::CredentialResolved(slot)) => (
            DispatchState::Executing {
                retries,
                slot: slot.clone(),
            },
            DispatchAction::Execute(slot),
        ),

        (DispatchState::Resolving { .. }, DispatchEvent::CredentialUnavailable) => (
            DispatchState::Failed,
            DispatchAction::Fail(FailReason::AuthRequired),
        ),

        // --- Executing ---
        (DispatchState::Executing { .. }, DispatchEvent::Succeeded) => {
            (DispatchState::Finished, DispatchAction::Finish)
        }

        (
            DispatchState::Executing { .. },
            DispatchEvent::Failed(ErrorClassification::VerificationRequired),
        ) => (DispatchState::Failed, DispatchAction::ResetSession),

        (
            DispatchState::Executing { retries, slot },
            DispatchEvent::Failed(ErrorClassification::InvalidCredential),
        ) => (
            DispatchState::Recovering {
                retries,
                setback: Setback::Invalid,
            },
            DispatchAction::Invalidate(slot),
        ),

        (
            DispatchState::Executing { retries, slot },
            DispatchEvent::Failed(ErrorClassification::RateLimited { retry_after_hours }),
        ) => (
            DispatchState::Recovering {
                retries,
                setback: Setback::RateLimited {
                    hours: retry_after_hours,
                },
            },
            DispatchAction::Cooldown {
                slot,
                hours: retry_after_hours,
            },
        ),

        (
            DispatchState::Executing { .. },
            DispatchEvent::Failed(ErrorClassification::Other),
        ) => (
            DispatchState::Failed,
            DispatchAction::Fail(FailReason::Upstream),
        ),

        // --- Recovering ---
        (DispatchState::Recovering { retries, .. }, DispatchEvent::Recovered { eligible: true })
            if retries < max_retries =>
        {
            (
                DispatchState::Resolving {
                    retries: retries + 1,
                },
                DispatchAction::Retry,
            )
        }

        (DispatchState::Recovering { setback, .. }, DispatchEvent::Recovered { eligible: false }) => (
            DispatchState::Failed,
            DispatchAction::Fail(FailReason::Exhausted {
                fatal: setback == Setback::Invalid,
            }),
        ),

        (DispatchState::Recovering { retries, setback }, DispatchEvent::Recovered { .. }) => {
            let attempts = retries + 1;
            let reason = match setback {
                Setback::Invalid => FailReason::CredentialInvalid { attempts },
                Setback::RateLimited { hours } => FailReason::RateLimited { hours, attempts },
            };
            (DispatchState::Failed, DispatchAction::Fail(reason))
        }

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, DispatchAction::None),
    }
}
