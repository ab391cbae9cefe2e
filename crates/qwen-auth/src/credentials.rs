//! Credential records and the persisted token store
//!
//! The store file is a JSON array of records. It is the single source of
//! truth for persisted credentials and is re-read on every call, so edits made
//! by another process are visible on the next read. All writes use atomic
//! temp-file + rename; a tokio Mutex serializes read-modify-write cycles from
//! within this process.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Where a credential was loaded from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Environment variable; never persisted
    Env,
    /// Persisted store
    #[default]
    #[serde(alias = "manual", alias = "browser", alias = "admin")]
    File,
}

/// Eligibility view of a credential at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Available,
    RateLimited,
    Invalid,
}

/// One session token and its bookkeeping.
///
/// Field names on disk follow the store file layout (`addedAt`, `resetAt`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub token: Secret<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "addedAt", default = "Utc::now")]
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub source: CredentialSource,
    /// Set when the provider rejected the token; cleared only by an explicit valid-mark
    #[serde(default)]
    pub invalid: bool,
    /// Excluded from rotation until this instant
    #[serde(rename = "resetAt", default)]
    pub reset_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: Secret::new(token.into()),
            name: name.into(),
            added_at: Utc::now(),
            source: CredentialSource::File,
            invalid: false,
            reset_at: None,
        }
    }

    /// Eligible means not invalid and any cooldown has elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == CredentialStatus::Available
    }

    pub fn status(&self, now: DateTime<Utc>) -> CredentialStatus {
        if self.invalid {
            CredentialStatus::Invalid
        } else if self.reset_at.is_some_and(|reset| reset > now) {
            CredentialStatus::RateLimited
        } else {
            CredentialStatus::Available
        }
    }

    /// Metadata safe to expose on admin and status surfaces.
    pub fn summary(&self, now: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "source": self.source,
            "added_at": self.added_at.to_rfc3339(),
            "status": self.status(now),
            "reset_at": self.reset_at.map(|r| r.to_rfc3339()),
        })
    }
}

/// Build credentials from the single-token and token-list variable values.
///
/// The single token gets id `env_token`; list entries get `env_token_1..n`
/// in order. Blank entries are dropped.
pub fn parse_env_credentials(single: Option<&str>, list: Option<&str>) -> Vec<Credential> {
    let mut credentials = Vec::new();

    if let Some(token) = single.map(str::trim).filter(|t| !t.is_empty()) {
        let mut credential = Credential::new("env_token", token, "Environment Token");
        credential.source = CredentialSource::Env;
        credentials.push(credential);
    }

    if let Some(list) = list {
        let tokens = list.split(',').map(str::trim).filter(|t| !t.is_empty());
        for (index, token) in tokens.enumerate() {
            let n = index + 1;
            let mut credential = Credential::new(
                format!("env_token_{n}"),
                token,
                format!("Environment Token {n}"),
            );
            credential.source = CredentialSource::Env;
            credentials.push(credential);
        }
    }

    credentials
}

/// Read credentials from the named environment variables.
pub fn env_credentials(single_var: &str, list_var: &str) -> Vec<Credential> {
    let single = std::env::var(single_var).ok();
    let list = std::env::var(list_var).ok();
    parse_env_credentials(single.as_deref(), list.as_deref())
}

/// File-backed credential store.
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the store strictly. A missing file is an empty store.
    pub async fn try_read(&self) -> Result<Vec<Credential>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(format!("reading credential file: {e}"))),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))
    }

    /// Read the store, treating an unreadable or corrupt file as empty.
    ///
    /// The request path calls this; a bad store file must not take it down.
    pub async fn read(&self) -> Vec<Credential> {
        match self.try_read().await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "credential store unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    /// Read, mutate and write back under the store lock.
    ///
    /// The file is only rewritten when `f` reports a change.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Vec<Credential>) -> (bool, R)) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let mut credentials = self.try_read().await?;
        let (changed, out) = f(&mut credentials);
        if changed {
            write_atomic(&self.path, &credentials).await?;
        }
        Ok(out)
    }

    /// Append a new credential and persist it.
    pub async fn add(&self, credential: Credential) -> Result<()> {
        if credential.source == CredentialSource::Env {
            return Err(Error::EnvManaged(credential.id));
        }
        let id = credential.id.clone();
        let added = self
            .update(move |credentials| {
                if credentials.iter().any(|c| c.id == credential.id) {
                    return (false, false);
                }
                credentials.push(credential);
                (true, true)
            })
            .await?;
        if !added {
            return Err(Error::Duplicate(id));
        }
        info!(credential_id = %id, "credential added");
        Ok(())
    }

    /// Remove a credential. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self
            .update(|credentials| {
                let before = credentials.len();
                credentials.retain(|c| c.id != id);
                let removed = credentials.len() != before;
                (removed, removed)
            })
            .await?;
        if removed {
            info!(credential_id = %id, "credential removed");
        }
        Ok(removed)
    }

    /// Apply `f` to the record with `id` and persist it.
    pub async fn modify(&self, id: &str, f: impl FnOnce(&mut Credential)) -> Result<()> {
        let found = self
            .update(|credentials| match credentials.iter_mut().find(|c| c.id == id) {
                Some(credential) => {
                    f(credential);
                    (true, true)
                }
                None => (false, false),
            })
            .await?;
        if !found {
            return Err(Error::NotFound(format!("credential {id} not in store")));
        }
        debug!(credential_id = %id, "credential updated");
        Ok(())
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 on unix since the file holds tokens.
/// Environment-sourced records are never written.
async fn write_atomic(path: &Path, data: &[Credential]) -> Result<()> {
    let persisted: Vec<&Credential> = data
        .iter()
        .filter(|c| c.source != CredentialSource::Env)
        .collect();
    let json = serde_json::to_string_pretty(&persisted)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;

    let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), count = persisted.len(), "persisted credentials");
    Ok(())
}
