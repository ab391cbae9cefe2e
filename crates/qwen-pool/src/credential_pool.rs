//! Round-robin credential rotation
//!
//! The pool owns no copy of the credentials. Every call re-reads the
//! environment and the persisted store, so edits made elsewhere show up on
//! the next acquire. What the pool does own is the rotation cursor and the
//! marks placed on environment credentials, which are never written to disk.
//!
//! One tokio Mutex serializes every read-modify-write: the cursor advance in
//! `acquire` and all mark operations. Concurrent callers therefore see a
//! consistent eligible snapshot and a cursor that never double-assigns or
//! skips within a stable set.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::Secret;
use qwen_auth::{Credential, CredentialSource, CredentialStatus, CredentialStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Where environment credentials come from.
#[derive(Clone)]
pub enum EnvCredentials {
    /// Read the named variables on every load
    Vars { single: String, list: String },
    /// Fixed set, for embedding and tests
    Static(Vec<Credential>),
}

impl EnvCredentials {
    fn load(&self) -> Vec<Credential> {
        match self {
            EnvCredentials::Vars { single, list } => qwen_auth::env_credentials(single, list),
            EnvCredentials::Static(credentials) => credentials.clone(),
        }
    }
}

/// A credential handed to one request.
#[derive(Debug, Clone)]
pub struct PooledCredential {
    pub id: String,
    pub token: Secret<String>,
    pub source: CredentialSource,
}

/// In-memory marks for environment credentials.
#[derive(Debug, Clone, Default)]
struct EnvMark {
    invalid: bool,
    reset_at: Option<DateTime<Utc>>,
    token: Option<Secret<String>>,
}

#[derive(Default)]
struct PoolState {
    cursor: usize,
    env_marks: HashMap<String, EnvMark>,
}

pub struct CredentialPool {
    store: Arc<CredentialStore>,
    env: EnvCredentials,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(store: Arc<CredentialStore>, env: EnvCredentials) -> Self {
        Self {
            store,
            env,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Environment credentials with their marks applied, then persisted ones.
    async fn load_locked(&self, state: &PoolState) -> Vec<Credential> {
        let mut credentials = self.env.load();
        for credential in &mut credentials {
            if let Some(mark) = state.env_marks.get(&credential.id) {
                credential.invalid = mark.invalid;
                credential.reset_at = mark.reset_at;
                if let Some(token) = &mark.token {
                    credential.token = token.clone();
                }
            }
        }
        credentials.extend(self.store.read().await);
        credentials
    }

    /// Merged, ordered credential list: environment first, then the store.
    pub async fn load(&self) -> Vec<Credential> {
        let state = self.state.lock().await;
        self.load_locked(&state).await
    }

    /// Next eligible credential in rotation.
    ///
    /// Returns `PoolExhausted` with per-status counts when nothing is eligible.
    pub async fn acquire(&self) -> Result<PooledCredential> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let credentials = self.load_locked(&state).await;
        let eligible: Vec<&Credential> = credentials.iter().filter(|c| c.is_eligible(now)).collect();

        if eligible.is_empty() {
            return Err(Error::PoolExhausted(exhausted_message(&credentials, now)));
        }

        let index = state.cursor % eligible.len();
        state.cursor = (index + 1) % eligible.len();
        let selected = eligible[index];
        debug!(credential_id = %selected.id, eligible = eligible.len(), "credential selected");

        Ok(PooledCredential {
            id: selected.id.clone(),
            token: selected.token.clone(),
            source: selected.source,
        })
    }

    pub async fn has_eligible(&self) -> bool {
        self.eligible_count().await > 0
    }

    pub async fn eligible_count(&self) -> usize {
        let now = Utc::now();
        self.load().await.iter().filter(|c| c.is_eligible(now)).count()
    }

    /// Apply a mark to an environment credential's overlay or to the stored record.
    async fn mark(
        &self,
        id: &str,
        env_mark: impl FnOnce(&mut EnvMark),
        stored: impl FnOnce(&mut Credential),
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.env.load().iter().any(|c| c.id == id) {
            env_mark(state.env_marks.entry(id.to_string()).or_default());
            return Ok(());
        }
        self.store.modify(id, stored).await?;
        Ok(())
    }

    /// Exclude a credential until it is explicitly marked valid.
    pub async fn mark_invalid(&self, id: &str) -> Result<()> {
        self.mark(id, |m| m.invalid = true, |c| c.invalid = true)
            .await?;
        warn!(credential_id = id, "credential marked invalid");
        Ok(())
    }

    /// Exclude a credential for `hours`. It becomes eligible again by
    /// wall-clock comparison alone.
    pub async fn mark_rate_limited(&self, id: &str, hours: u64) -> Result<()> {
        let hours = i64::try_from(hours).unwrap_or(i64::MAX).min(24 * 365);
        let reset_at = Utc::now() + Duration::hours(hours);
        self.mark(id, |m| m.reset_at = Some(reset_at), |c| c.reset_at = Some(reset_at))
            .await?;
        info!(credential_id = id, hours, reset_at = %reset_at.to_rfc3339(), "credential rate limited");
        Ok(())
    }

    /// Clear both marks, optionally rotating the secret.
    pub async fn mark_valid(&self, id: &str, new_token: Option<String>) -> Result<()> {
        let stored_token = new_token.clone();
        self.mark(
            id,
            |m| {
                m.invalid = false;
                m.reset_at = None;
                if let Some(token) = new_token {
                    m.token = Some(Secret::new(token));
                }
            },
            |c| {
                c.invalid = false;
                c.reset_at = None;
                if let Some(token) = stored_token {
                    c.token = Secret::new(token);
                }
            },
        )
        .await?;
        info!(credential_id = id, "credential marked valid");
        Ok(())
    }

    /// Delete a credential from the persisted store.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _state = self.state.lock().await;
        if self.env.load().iter().any(|c| c.id == id) {
            return Err(Error::EnvManaged(id.to_string()));
        }
        if !self.store.remove(id).await? {
            return Err(Error::NotFound(format!("credential {id}")));
        }
        Ok(())
    }

    /// Enroll a new persisted credential. Without an explicit id one is
    /// generated as `acc_<millis>`.
    pub async fn add(
        &self,
        token: String,
        name: Option<String>,
        id: Option<String>,
    ) -> Result<Credential> {
        let _state = self.state.lock().await;
        let id = id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("acc_{}", Utc::now().timestamp_millis()));
        if self.env.load().iter().any(|c| c.id == id) {
            return Err(Error::EnvManaged(id));
        }
        let name = name.unwrap_or_else(|| id.clone());
        let credential = Credential::new(id, token, name);
        self.store.add(credential.clone()).await?;
        Ok(credential)
    }

    /// Snapshot of every credential with its marks applied.
    pub async fn list(&self) -> Vec<Credential> {
        self.load().await
    }

    /// Pool health summary for the health endpoint.
    ///
    /// All eligible → healthy, some eligible → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let now = Utc::now();
        let credentials = self.load().await;
        let counts = StatusCounts::of(&credentials, now);

        let status = if counts.available == counts.total && counts.total > 0 {
            "healthy"
        } else if counts.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let entries: Vec<serde_json::Value> = credentials
            .iter()
            .map(|c| {
                let mut entry = c.summary(now);
                if let Some(reset_at) = c.reset_at.filter(|r| *r > now) {
                    entry["cooldown_remaining_secs"] = (reset_at - now).num_seconds().into();
                }
                entry
            })
            .collect();

        serde_json::json!({
            "status": status,
            "credentials_total": counts.total,
            "credentials_available": counts.available,
            "credentials_rate_limited": counts.rate_limited,
            "credentials_invalid": counts.invalid,
            "credentials": entries,
        })
    }
}

struct StatusCounts {
    total: usize,
    available: usize,
    rate_limited: usize,
    invalid: usize,
}

impl StatusCounts {
    fn of(credentials: &[Credential], now: DateTime<Utc>) -> Self {
        let mut counts = StatusCounts {
            total: credentials.len(),
            available: 0,
            rate_limited: 0,
            invalid: 0,
        };
        for credential in credentials {
            match credential.status(now) {
                CredentialStatus::Available => counts.available += 1,
                CredentialStatus::RateLimited => counts.rate_limited += 1,
                CredentialStatus::Invalid => counts.invalid += 1,
            }
        }
        counts
    }
}

/// Build the exhausted error message JSON.
fn exhausted_message(credentials: &[Credential], now: DateTime<Utc>) -> String {
    let counts = StatusCounts::of(credentials, now);
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "No eligible credentials",
            "pool": {
                "credentials_total": counts.total,
                "credentials_available": counts.available,
                "credentials_rate_limited": counts.rate_limited,
                "credentials_invalid": counts.invalid
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn env(tokens: &[&str]) -> EnvCredentials {
        EnvCredentials::Static(qwen_auth::parse_env_credentials(
            None,
            Some(&tokens.join(",")),
        ))
    }

    async fn test_pool(
        dir: &tempfile::TempDir,
        env_tokens: &[&str],
        stored: &[&str],
    ) -> CredentialPool {
        let store = Arc::new(CredentialStore::new(dir.path().join("tokens.json")));
        for id in stored {
            store
                .add(Credential::new(*id, format!("tok_{id}"), *id))
                .await
                .unwrap();
        }
        CredentialPool::new(store, env(env_tokens))
    }

    async fn acquire_ids(pool: &CredentialPool, n: usize) -> Vec<String> {
        let mut ids = Vec::new();
        for _ in 0..n {
            ids.push(pool.acquire().await.unwrap().id);
        }
        ids
    }

    #[tokio::test]
    async fn load_orders_env_before_store() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["e1"], &["acc_a", "acc_b"]).await;
        let ids: Vec<String> = pool.load().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["env_token_1", "acc_a", "acc_b"]);
    }

    #[tokio::test]
    async fn round_robin_returns_each_credential_once_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["e1"], &["a", "b"]).await;

        let first = acquire_ids(&pool, 3).await;
        let unique: HashSet<&String> = first.iter().collect();
        assert_eq!(unique.len(), 3, "got {first:?}");

        let second = acquire_ids(&pool, 3).await;
        assert_eq!(first, second, "rotation order is stable");
    }

    #[tokio::test]
    async fn concurrent_acquires_are_fair() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(test_pool(&dir, &[], &["a", "b", "c", "d"]).await);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await.unwrap().id }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }
        assert_eq!(ids.len(), 4, "every credential handed out exactly once");
    }

    #[tokio::test]
    async fn acquire_returns_token_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["acct-1"]).await;
        let selected = pool.acquire().await.unwrap();
        assert_eq!(selected.id, "acct-1");
        assert_eq!(selected.token.expose(), "tok_acct-1");
        assert_eq!(selected.source, CredentialSource::File);
    }

    #[tokio::test]
    async fn invalid_mark_persists_until_marked_valid() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["a", "b"]).await;
        pool.mark_invalid("a").await.unwrap();

        for id in acquire_ids(&pool, 5).await {
            assert_eq!(id, "b");
        }
        // visible to a fresh reader of the same file
        let reread = CredentialStore::new(pool.store().path().to_path_buf());
        assert!(reread.read().await.iter().any(|c| c.id == "a" && c.invalid));

        pool.mark_valid("a", Some("tok_new".into())).await.unwrap();
        let ids: HashSet<String> = acquire_ids(&pool, 2).await.into_iter().collect();
        assert!(ids.contains("a"));
        let a = pool.load().await.into_iter().find(|c| c.id == "a").unwrap();
        assert_eq!(a.token.expose(), "tok_new");
    }

    #[tokio::test]
    async fn rate_limit_excludes_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["a", "b"]).await;
        pool.mark_rate_limited("a", 4).await.unwrap();

        for id in acquire_ids(&pool, 4).await {
            assert_eq!(id, "b");
        }

        // wind the clock back on the stored record to simulate expiry
        pool.store()
            .modify("a", |c| c.reset_at = Some(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        let ids: HashSet<String> = acquire_ids(&pool, 2).await.into_iter().collect();
        assert!(ids.contains("a"), "eligible again without an unmark call");
    }

    #[tokio::test]
    async fn env_marks_stay_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["e1", "e2"], &[]).await;
        pool.mark_invalid("env_token_1").await.unwrap();

        for id in acquire_ids(&pool, 3).await {
            assert_eq!(id, "env_token_2");
        }
        assert!(!pool.store().path().exists(), "env marks never touch disk");

        pool.mark_valid("env_token_1", None).await.unwrap();
        assert_eq!(pool.eligible_count().await, 2);
    }

    #[tokio::test]
    async fn exhausted_pool_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["a", "b"]).await;
        pool.mark_invalid("a").await.unwrap();
        pool.mark_rate_limited("b", 24).await.unwrap();

        assert!(!pool.has_eligible().await);
        let err = pool.acquire().await.unwrap_err();
        let msg = err.to_string();
        let json: serde_json::Value =
            serde_json::from_str(msg.strip_prefix("pool exhausted: ").unwrap_or(&msg)).unwrap();
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert_eq!(json["error"]["pool"]["credentials_total"], 2);
        assert_eq!(json["error"]["pool"]["credentials_invalid"], 1);
        assert_eq!(json["error"]["pool"]["credentials_rate_limited"], 1);
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &[]).await;
        assert!(matches!(pool.acquire().await, Err(Error::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn external_edits_are_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["a"]).await;

        let other = CredentialStore::new(pool.store().path().to_path_buf());
        other.add(Credential::new("b", "tok_b", "b")).await.unwrap();

        let ids: HashSet<String> = acquire_ids(&pool, 2).await.into_iter().collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn marks_on_unknown_ids_fail() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["a"]).await;
        assert!(matches!(pool.mark_invalid("ghost").await, Err(Error::NotFound(_))));
        assert!(matches!(pool.remove("ghost").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_rejects_env_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["e1"], &["a"]).await;
        assert!(matches!(pool.remove("env_token_1").await, Err(Error::EnvManaged(_))));

        pool.remove("a").await.unwrap();
        assert_eq!(pool.list().await.len(), 1);
    }

    #[tokio::test]
    async fn add_generates_account_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &[]).await;
        let added = pool.add("tok".into(), None, None).await.unwrap();
        assert!(added.id.starts_with("acc_"), "got {}", added.id);
        assert_eq!(added.name, added.id);

        let named = pool
            .add("tok2".into(), Some("backup".into()), Some("acc_backup".into()))
            .await
            .unwrap();
        assert_eq!(named.id, "acc_backup");
        assert_eq!(pool.list().await.len(), 2);
    }

    #[tokio::test]
    async fn add_rejects_taken_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["e1"], &["a"]).await;
        assert!(matches!(
            pool.add("tok".into(), None, Some("a".into())).await,
            Err(Error::Duplicate(_))
        ));
        assert!(matches!(
            pool.add("tok".into(), None, Some("env_token_1".into())).await,
            Err(Error::EnvManaged(_))
        ));
    }

    #[tokio::test]
    async fn health_reflects_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[], &["a", "b"]).await;
        assert_eq!(pool.health().await["status"], "healthy");

        pool.mark_rate_limited("a", 2).await.unwrap();
        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["credentials_rate_limited"], 1);
        let a = &health["credentials"][0];
        assert_eq!(a["status"], "rate_limited");
        assert!(a["cooldown_remaining_secs"].as_i64().unwrap() > 0);

        pool.mark_invalid("b").await.unwrap();
        assert_eq!(pool.health().await["status"], "unhealthy");
        assert!(!pool.health().await.to_string().contains("tok_"));
    }
}
