//! Provider session reuse
//!
//! Idle sessions are cached up to a retention capacity. Acquisition pops an
//! idle session or establishes a new one; it never waits for an idle one to
//! come back. An optional admission cap bounds how many sessions may be live
//! at once; without it session creation is unbounded.
//!
//! Every acquisition is a `SessionLease`. Dropping the lease hands the
//! session back to the pool, so each acquire is matched by exactly one
//! release or disposal on every exit path, including early returns and
//! cancelled futures.
//!
//! The pool also caches the ambient credential: the token the execution
//! context itself is logged in with, captured from the first session that
//! reports one.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::Secret;
use provider::{ProviderError, Session, SessionFactory};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle handles retained when nothing else is configured.
pub const DEFAULT_IDLE_CAPACITY: usize = 3;

#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Idle sessions kept for reuse
    pub idle_capacity: usize,
    /// Upper bound on live sessions; `None` means unbounded
    pub max_live_sessions: Option<usize>,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            idle_capacity: DEFAULT_IDLE_CAPACITY,
            max_live_sessions: None,
        }
    }
}

struct IdleSession {
    session: Box<dyn Session>,
    epoch: u64,
    permit: Option<OwnedSemaphorePermit>,
}

struct Inner {
    factory: Arc<dyn SessionFactory>,
    idle: Mutex<Vec<IdleSession>>,
    idle_capacity: usize,
    admission: Option<Arc<Semaphore>>,
    ambient: Mutex<Option<Secret<String>>>,
    /// Bumped on reset; sessions from an older epoch are disposed on release
    epoch: AtomicU64,
    live: AtomicUsize,
}

impl Inner {
    fn record_live(&self) {
        metrics::gauge!("proxy_sessions_live").set(self.live.load(Ordering::Relaxed) as f64);
    }

    fn release(&self, idle: IdleSession) {
        let current = self.epoch.load(Ordering::Acquire);
        if idle.epoch == current {
            let mut cache = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            if cache.len() < self.idle_capacity {
                debug!(session_id = idle.session.id(), idle = cache.len() + 1, "session returned to pool");
                cache.push(idle);
                return;
            }
        }
        self.dispose(idle.session);
    }

    /// Close a session off the calling task. Outside a runtime the handle is just dropped.
    fn dispose(&self, session: Box<dyn Session>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.record_live();
        debug!(session_id = session.id(), "disposing session");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.close().await;
            });
        }
    }
}

/// Shared session pool. Cloning is cheap.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<Inner>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: SessionPoolConfig) -> Self {
        info!(
            idle_capacity = config.idle_capacity,
            max_live_sessions = ?config.max_live_sessions,
            "session pool initialized"
        );
        Self {
            inner: Arc::new(Inner {
                factory,
                idle: Mutex::new(Vec::new()),
                idle_capacity: config.idle_capacity,
                admission: config.max_live_sessions.map(|n| Arc::new(Semaphore::new(n))),
                ambient: Mutex::new(None),
                epoch: AtomicU64::new(0),
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Pop an idle session or establish a new one.
    pub async fn acquire(&self, cancel: &CancellationToken) -> provider::Result<SessionLease> {
        let popped = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        if let Some(idle) = popped {
            debug!(session_id = idle.session.id(), "reusing idle session");
            return Ok(SessionLease {
                idle: Some(idle),
                pool: self.inner.clone(),
            });
        }

        let permit = match &self.inner.admission {
            Some(semaphore) => {
                let semaphore = semaphore.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    permit = semaphore.acquire_owned() => Some(permit.map_err(|_| {
                        ProviderError::Transport("session pool closed".into())
                    })?),
                }
            }
            None => None,
        };

        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let session = provider::cancellable(cancel, self.inner.factory.establish()).await?;
        self.inner.live.fetch_add(1, Ordering::Relaxed);
        self.inner.record_live();
        info!(session_id = session.id(), "session established");

        if self.ambient().is_none() {
            match session.extract_credential().await {
                Ok(Some(token)) => {
                    debug!(session_id = session.id(), "captured ambient credential");
                    self.set_ambient(token);
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "ambient credential unavailable"),
            }
        }

        Ok(SessionLease {
            idle: Some(IdleSession {
                session,
                epoch,
                permit,
            }),
            pool: self.inner.clone(),
        })
    }

    /// Dispose every idle session.
    pub async fn drain(&self) {
        let drained: Vec<IdleSession> = std::mem::take(
            &mut *self.inner.idle.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let count = drained.len();
        for idle in drained {
            self.inner.live.fetch_sub(1, Ordering::Relaxed);
            idle.session.close().await;
        }
        self.inner.record_live();
        info!(count, "session pool drained");
    }

    /// Drain, forget the ambient credential, and rebuild the execution context.
    ///
    /// Sessions leased before the reset are disposed when they come back.
    pub async fn reset(&self, interactive: bool) -> provider::Result<()> {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.drain().await;
        self.clear_ambient();
        self.inner.factory.reset(interactive).await
    }

    pub fn ambient(&self) -> Option<Secret<String>> {
        self.inner
            .ambient
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_ambient(&self, token: String) {
        *self.inner.ambient.lock().unwrap_or_else(|e| e.into_inner()) = Some(Secret::new(token));
    }

    pub fn clear_ambient(&self) {
        if self
            .inner
            .ambient
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            warn!("ambient credential cleared");
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Relaxed)
    }
}

/// Scoped session acquisition. Released to the pool on drop.
pub struct SessionLease {
    idle: Option<IdleSession>,
    pool: Arc<Inner>,
}

impl SessionLease {
    /// Dispose the session instead of returning it, e.g. after it misbehaved.
    pub fn discard(mut self) {
        if let Some(idle) = self.idle.take() {
            self.pool.dispose(idle.session);
        }
    }
}

impl Deref for SessionLease {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        match &self.idle {
            Some(idle) => idle.session.as_ref(),
            // `idle` is only taken by `discard` and `drop`, both of which consume the lease
            None => unreachable!("session lease used after release"),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(idle) = self.idle.take() {
            self.pool.release(idle);
        }
    }
}
