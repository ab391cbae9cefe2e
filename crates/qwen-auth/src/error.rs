//! Error types for credential storage

/// Errors from credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate credential id: {0}")]
    Duplicate(String),

    #[error("credential {0} comes from the environment and cannot be changed on disk")]
    EnvManaged(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
