//! Qwen session-token credentials
//!
//! Data model and storage for the session tokens the proxy rotates through.
//! Tokens come from two places:
//! 1. Environment variables (`QWEN_TOKEN`, `QWEN_TOKENS`), which are never
//!    written back to disk
//! 2. The persisted store (`session/tokens.json`), a JSON array rewritten
//!    atomically on every change
//!
//! This crate has no opinion on rotation or eligibility bookkeeping across
//! requests; that lives in `qwen-pool`.

pub mod constants;
pub mod credentials;
pub mod error;

pub use constants::*;
pub use credentials::{
    Credential, CredentialSource, CredentialStatus, CredentialStore, env_credentials,
    parse_env_credentials,
};
pub use error::{Error, Result};
