//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults. Every
//! section has defaults, so an empty file is a valid configuration. Session
//! tokens and client API keys are never stored in the TOML; they come from
//! the environment, the credential store, or the keys file.

use common::Secret;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub credentials: CredentialsConfig,
    pub sessions: SessionsConfig,
    pub dispatch: DispatchConfig,
    pub tasks: TasksConfig,
    pub models: ModelsConfig,
    pub auth: AuthConfig,
    pub admin: AdminConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Whole-request ceiling; must cover task polling
    pub request_timeout_secs: u64,
    pub max_connections: usize,
    /// Pause between re-emitted SSE chunks
    pub stream_chunk_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3264)),
            request_timeout_secs: 300,
            max_connections: 1000,
            stream_chunk_delay_ms: 20,
        }
    }
}

/// Provider connection settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub front_door_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: qwen_auth::QWEN_BASE_URL.to_string(),
            front_door_timeout_secs: 120,
            user_agent: concat!("qwen-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Where credentials come from
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub store_path: PathBuf,
    /// Variable holding a single session token
    pub env_var: String,
    /// Variable holding a comma-separated token list
    pub env_list_var: String,
    /// Token file written by the interactive login
    pub ambient_token_path: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(qwen_auth::DEFAULT_STORE_PATH),
            env_var: qwen_auth::ENV_TOKEN_VAR.to_string(),
            env_list_var: qwen_auth::ENV_TOKENS_VAR.to_string(),
            ambient_token_path: PathBuf::from(qwen_auth::DEFAULT_AMBIENT_TOKEN_PATH),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub idle_capacity: usize,
    /// Cap on concurrently live sessions; absent means unbounded
    pub max_live_sessions: Option<usize>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_capacity: qwen_pool::session_pool::DEFAULT_IDLE_CAPACITY,
            max_live_sessions: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub default_rate_limit_hours: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            default_rate_limit_hours: qwen_auth::DEFAULT_RATE_LIMIT_HOURS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_attempts: 90,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub default: String,
    /// One model per line, `#` starts a comment
    pub catalog_file: Option<PathBuf>,
    pub available: Vec<String>,
    /// Client-facing name → provider model
    pub aliases: HashMap<String, String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: qwen_auth::DEFAULT_MODEL.to_string(),
            catalog_file: None,
            available: Vec::new(),
            aliases: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Client API keys, one per line. Empty or missing disables the gate.
    pub api_keys_file: Option<PathBuf>,
    /// Prompt on the terminal for a session token when no credential is eligible
    pub interactive: bool,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Separate listener for the admin API; absent disables it
    pub listen_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Load from `path` if it exists. A missing file is only an error when
    /// the path was given explicitly.
    pub fn load_or_default(path: &Path, explicit: bool) -> common::Result<Self> {
        if explicit || path.exists() {
            Self::load(path)
        } else {
            Self::from_toml("")
        }
    }

    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env();
        config.validate()?;
        config.auth.api_keys = match &config.auth.api_keys_file {
            Some(path) => read_api_keys(path)?,
            None => Vec::new(),
        };
        Ok(config)
    }

    /// `HOST` replaces the listen IP, `PORT` the listen port.
    fn apply_env(&mut self) {
        if let Some(ip) = std::env::var("HOST")
            .ok()
            .and_then(|h| h.trim().parse::<IpAddr>().ok())
        {
            self.server.listen_addr.set_ip(ip);
        }
        if let Some(port) = std::env::var("PORT")
            .ok()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p > 0)
        {
            self.server.listen_addr.set_port(port);
        }
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.upstream.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "upstream.base_url must start with http:// or https://, got: {base_url}"
            )));
        }
        let nonzero: [(&str, u64); 5] = [
            ("server.request_timeout_secs", self.server.request_timeout_secs),
            ("server.max_connections", self.server.max_connections as u64),
            ("upstream.front_door_timeout_secs", self.upstream.front_door_timeout_secs),
            ("tasks.poll_interval_ms", self.tasks.poll_interval_ms),
            ("tasks.max_attempts", u64::from(self.tasks.max_attempts)),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(common::Error::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.sessions.idle_capacity == 0 {
            return Err(common::Error::Config(
                "sessions.idle_capacity must be greater than 0".into(),
            ));
        }
        if self.sessions.max_live_sessions == Some(0) {
            return Err(common::Error::Config(
                "sessions.max_live_sessions must be greater than 0 when set".into(),
            ));
        }
        if self.models.default.trim().is_empty() {
            return Err(common::Error::Config("models.default must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// The flag reports whether the path was chosen explicitly.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from("qwen-proxy.toml"), false)
    }
}

/// Read client API keys. Blank lines and `#` comments are skipped; a missing
/// file means no keys.
fn read_api_keys(path: &Path) -> common::Result<Vec<Secret<String>>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(common::Error::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Secret::new(line.to_string()))
        .collect())
}
