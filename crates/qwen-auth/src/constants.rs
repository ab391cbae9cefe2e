//! Provider constants
//!
//! Public endpoints and default names. None of these are secrets; session
//! tokens live in the credential store or the environment.

/// Provider origin; every API path is relative to it
pub const QWEN_BASE_URL: &str = "https://chat.qwen.ai";

/// Model used when a request names none, or names one the catalog does not know
pub const DEFAULT_MODEL: &str = "qwen-max-latest";

/// Environment variable carrying a single session token
pub const ENV_TOKEN_VAR: &str = "QWEN_TOKEN";

/// Environment variable carrying a comma-separated list of session tokens
pub const ENV_TOKENS_VAR: &str = "QWEN_TOKENS";

/// Persisted credential store
pub const DEFAULT_STORE_PATH: &str = "session/tokens.json";

/// Token the interactive login leaves behind for the session layer
pub const DEFAULT_AMBIENT_TOKEN_PATH: &str = "session/auth_token";

/// Cooldown applied when a rate-limit answer carries no usable hint
pub const DEFAULT_RATE_LIMIT_HOURS: u64 = 24;
