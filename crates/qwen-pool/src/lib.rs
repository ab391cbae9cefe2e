//! Credential rotation and session reuse for the Qwen proxy
//!
//! Two shared pools sit between the dispatcher and the provider:
//! - `CredentialPool` rotates session tokens round-robin over the eligible
//!   subset, with invalid and rate-limited marks that persist to the store
//! - `SessionPool` keeps a small cache of idle provider sessions and hands
//!   them out as `SessionLease` guards that return themselves on drop
//!
//! Credential lifecycle:
//! 1. Loaded from the environment or the persisted store → eligible
//! 2. Provider answers with a rate-limit code → cooled down until `resetAt`
//! 3. Provider rejects the token (401, expired) → invalid until marked valid
//! 4. Cooldown elapses → eligible again on the next acquire, no unmark needed
//!
//! `classify` maps provider failures onto those transitions.

pub mod classify;
pub mod credential_pool;
pub mod error;
pub mod session_pool;

pub use classify::{classify_failure, classify_status, parse_rate_limit_hours};
pub use credential_pool::{CredentialPool, EnvCredentials, PooledCredential};
pub use error::{Error, Result};
pub use session_pool::{SessionLease, SessionPool, SessionPoolConfig};
