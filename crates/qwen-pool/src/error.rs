//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("duplicate credential id: {0}")]
    Duplicate(String),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("credential {0} is supplied by the environment and cannot be removed")]
    EnvManaged(String),
}

impl From<qwen_auth::Error> for Error {
    fn from(e: qwen_auth::Error) -> Self {
        match e {
            qwen_auth::Error::NotFound(msg) => Error::NotFound(msg),
            qwen_auth::Error::EnvManaged(id) => Error::EnvManaged(id),
            qwen_auth::Error::Duplicate(id) => Error::Duplicate(id),
            other => Error::Credential(other.to_string()),
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
