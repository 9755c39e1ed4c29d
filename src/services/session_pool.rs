//! Bounded pool of reusable SSH sessions keyed by host, port and username.
//!
//! One mutex guards the whole map, so capacity checks, liveness probes,
//! connects and insertions for concurrent `acquire` calls are atomic with
//! respect to each other. A session is handed to at most one `SessionLease`
//! at a time; asking for a key that is already leased fails with
//! `SessionBusy` instead of queueing, and a full pool fails with
//! `PoolExhausted`.

use crate::constants::pool as pool_constants;
use crate::errors::ToolError;
use crate::services::connection::{SessionKey, SshConnection};
use crate::services::logger::Logger;
use crate::services::metadata::{GnuDialect, MetadataDialect};
use crate::services::remote_session::RemoteSession;
use crate::services::transport::Connector;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_idle: Duration,
    pub max_connections: usize,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_millis(pool_constants::MAX_IDLE_MS),
            max_connections: pool_constants::MAX_CONNECTIONS,
            sweep_interval: Duration::from_millis(pool_constants::SWEEP_INTERVAL_MS),
        }
    }
}

impl PoolConfig {
    /// Reads `SSH_FS_POOL_MAX_IDLE_MS`, `SSH_FS_POOL_MAX_CONNECTIONS` and
    /// `SSH_FS_POOL_SWEEP_INTERVAL_MS`; zero or invalid values keep defaults.
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
        };
        let defaults = Self::default();
        Self {
            max_idle: read("SSH_FS_POOL_MAX_IDLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_idle),
            max_connections: read("SSH_FS_POOL_MAX_CONNECTIONS")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_connections),
            sweep_interval: read("SSH_FS_POOL_SWEEP_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
        }
    }
}

/// A pooled session plus its one-shot teardown flag.
struct SharedSession {
    id: u64,
    session: Mutex<RemoteSession>,
    closed: AtomicBool,
}

impl SharedSession {
    fn lock(&self) -> MutexGuard<'_, RemoteSession> {
        self.session.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn probe_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.session.try_lock() {
            Ok(mut session) => session.is_alive(),
            Err(_) => false,
        }
    }

    /// Closes the session at most once, whichever of release, sweep or pool
    /// close gets here first.
    fn teardown(&self, logger: &Logger, reason: &str) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(err) = self.lock().close() {
            logger.error(
                "Failed to close SSH session",
                Some(&serde_json::json!({
                    "session_id": self.id,
                    "reason": reason,
                    "error": err.message,
                })),
            );
        }
    }
}

struct PooledSession {
    shared: Arc<SharedSession>,
    credential: String,
    last_used: Instant,
    in_use: bool,
    /// Acquisition that currently holds the entry; only that lease may release it.
    lease_id: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<SessionKey, PooledSession>,
    closed: bool,
    shutdown: Option<watch::Sender<bool>>,
    sweeper: Option<JoinHandle<()>>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    dialect: Arc<dyn MetadataDialect>,
    logger: Logger,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    next_lease: AtomicU64,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn release_lease(&self, key: &SessionKey, shared: &Arc<SharedSession>, lease_id: u64) {
        let mut state = self.lock_state();
        match state.entries.get_mut(key) {
            Some(entry) if Arc::ptr_eq(&entry.shared, shared) => {
                // A stale lease (released by key, then re-acquired) must not
                // free the session out from under the current holder.
                if entry.in_use && entry.lease_id == lease_id {
                    entry.in_use = false;
                    entry.last_used = Instant::now();
                }
            }
            // The entry was dropped by close(); nobody else will tear it down.
            _ => shared.teardown(&self.logger, "released after removal"),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>, logger: Logger) -> Self {
        Self::with_dialect(config, connector, Arc::new(GnuDialect), logger)
    }

    pub fn with_dialect(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        dialect: Arc<dyn MetadataDialect>,
        logger: Logger,
    ) -> Self {
        let config = PoolConfig {
            max_connections: config.max_connections.max(1),
            sweep_interval: config.sweep_interval.max(Duration::from_millis(1)),
            ..config
        };
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                dialect,
                logger: logger.child("pool"),
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
                next_lease: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Hands out the cached session for the connection's key, or opens one.
    ///
    /// Blocks for the network dial when a new session is needed; run it off
    /// the async executor (see `acquire_async` and `with_session`).
    pub fn acquire(&self, connection: &SshConnection) -> Result<SessionLease, ToolError> {
        let inner = &self.inner;
        let key = connection.session_key();
        let credential = connection.credential_fingerprint();

        let mut state = inner.lock_state();
        if state.closed {
            return Err(ToolError::pool_closed());
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.in_use {
                return Err(ToolError::session_busy(&key));
            }
            let reusable = entry.credential == credential && entry.shared.probe_alive();
            if reusable {
                let lease_id = inner.next_lease.fetch_add(1, Ordering::Relaxed);
                entry.in_use = true;
                entry.lease_id = lease_id;
                entry.last_used = Instant::now();
                inner.logger.debug(
                    "Reusing pooled session",
                    Some(&serde_json::json!({ "key": key.to_string(), "session_id": entry.shared.id })),
                );
                return Ok(SessionLease::new(
                    inner.clone(),
                    key,
                    entry.shared.clone(),
                    lease_id,
                ));
            }
            let reason = if entry.credential != credential {
                "credentials changed"
            } else {
                "dead"
            };
            if let Some(stale) = state.entries.remove(&key) {
                inner.logger.info(
                    "Discarding pooled session",
                    Some(&serde_json::json!({ "key": key.to_string(), "reason": reason })),
                );
                stale.shared.teardown(&inner.logger, reason);
            }
        }

        if state.entries.len() >= inner.config.max_connections {
            inner.logger.warn(
                "Connection pool exhausted",
                Some(&serde_json::json!({
                    "key": key.to_string(),
                    "max_connections": inner.config.max_connections,
                })),
            );
            return Err(ToolError::pool_exhausted(inner.config.max_connections));
        }

        let channel = inner.connector.connect(connection)?;
        let shared = Arc::new(SharedSession {
            id: inner.next_id.fetch_add(1, Ordering::Relaxed),
            session: Mutex::new(RemoteSession::new(
                channel,
                inner.dialect.clone(),
                inner.logger.child("session"),
            )),
            closed: AtomicBool::new(false),
        });
        inner.logger.info(
            "Opened pooled session",
            Some(&serde_json::json!({ "key": key.to_string(), "session_id": shared.id })),
        );
        let lease_id = inner.next_lease.fetch_add(1, Ordering::Relaxed);
        state.entries.insert(
            key.clone(),
            PooledSession {
                shared: shared.clone(),
                credential,
                last_used: Instant::now(),
                in_use: true,
                lease_id,
            },
        );
        Ok(SessionLease::new(inner.clone(), key, shared, lease_id))
    }

    pub async fn acquire_async(&self, connection: SshConnection) -> Result<SessionLease, ToolError> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.acquire(&connection))
            .await
            .map_err(|_| ToolError::internal("SSH acquire task failed"))?
    }

    /// Acquires a session, runs `handler` on a blocking worker, and releases
    /// the session on every exit path.
    pub async fn with_session<F, T>(&self, connection: &SshConnection, handler: F) -> Result<T, ToolError>
    where
        F: FnOnce(&mut RemoteSession) -> Result<T, ToolError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        let connection = connection.clone();
        tokio::task::spawn_blocking(move || {
            let lease = pool.acquire(&connection)?;
            let mut session = lease.lock();
            handler(&mut session)
        })
        .await
        .map_err(|_| ToolError::internal("SSH session task failed"))?
    }

    /// Marks the key's session idle. Unknown keys are ignored. An outstanding
    /// lease on the session no longer releases it once this has been called.
    pub fn release(&self, connection: &SshConnection) {
        let key = connection.session_key();
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.in_use = false;
            entry.last_used = Instant::now();
        }
    }

    /// Tears down idle sessions older than `max_idle`; returns how many.
    pub fn sweep_idle(&self) -> usize {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        let now = Instant::now();
        let expired: Vec<SessionKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                !entry.in_use && now.duration_since(entry.last_used) > inner.config.max_idle
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                entry.shared.teardown(&inner.logger, "idle");
            }
        }
        if !expired.is_empty() {
            inner.logger.info(
                "Reclaimed idle sessions",
                Some(&serde_json::json!({
                    "closed": expired.len(),
                    "remaining": state.entries.len(),
                })),
            );
        }
        expired.len()
    }

    /// Starts the periodic idle sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference to the pool and stops when the
    /// pool is closed or dropped. Calling it twice is a no-op.
    pub fn start_idle_sweep(&self) -> Result<(), ToolError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ToolError::internal("idle sweep requires a tokio runtime"))?;
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(ToolError::pool_closed());
        }
        if state.sweeper.is_some() {
            return Ok(());
        }
        let (tx, mut rx) = watch::channel(false);
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pool = ConnectionPool { inner };
                        if tokio::task::spawn_blocking(move || pool.sweep_idle()).await.is_err() {
                            break;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        state.shutdown = Some(tx);
        state.sweeper = Some(handle);
        Ok(())
    }

    /// Closes every idle session, forgets leased ones (their lease closes
    /// them on release), stops the sweeper and rejects further acquires.
    /// Returns the number of entries removed.
    pub fn close(&self) -> usize {
        let (removed, _) = self.close_inner();
        removed
    }

    /// `close`, then waits for the sweeper task to finish.
    pub async fn shutdown(&self) -> usize {
        let pool = self.clone();
        let (removed, sweeper) = tokio::task::spawn_blocking(move || pool.close_inner())
            .await
            .unwrap_or((0, None));
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        removed
    }

    fn close_inner(&self) -> (usize, Option<JoinHandle<()>>) {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        state.closed = true;
        if let Some(tx) = state.shutdown.take() {
            let _ = tx.send(true);
        }
        let sweeper = state.sweeper.take();
        let entries: Vec<(SessionKey, PooledSession)> = state.entries.drain().collect();
        let removed = entries.len();
        for (_, entry) in entries {
            if !entry.in_use {
                entry.shared.teardown(&inner.logger, "pool closed");
            }
        }
        if removed > 0 {
            inner.logger.info(
                "Connection pool closed",
                Some(&serde_json::json!({ "closed": removed })),
            );
        }
        (removed, sweeper)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Value {
        let state = self.inner.lock_state();
        let in_use = state.entries.values().filter(|e| e.in_use).count();
        serde_json::json!({
            "entries": state.entries.len(),
            "in_use": in_use,
            "idle": state.entries.len() - in_use,
            "max_connections": self.inner.config.max_connections,
            "max_idle_ms": self.inner.config.max_idle.as_millis() as u64,
            "sweep_interval_ms": self.inner.config.sweep_interval.as_millis() as u64,
            "sweeper_running": state.sweeper.as_ref().map(|h| !h.is_finished()).unwrap_or(false),
            "closed": state.closed,
        })
    }
}

/// Exclusive use of one pooled session. Dropping the lease releases it.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    key: SessionKey,
    shared: Arc<SharedSession>,
    lease_id: u64,
}

impl SessionLease {
    fn new(pool: Arc<PoolInner>, key: SessionKey, shared: Arc<SharedSession>, lease_id: u64) -> Self {
        Self {
            pool,
            key,
            shared,
            lease_id,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn session_id(&self) -> u64 {
        self.shared.id
    }

    pub fn lock(&self) -> MutexGuard<'_, RemoteSession> {
        self.shared.lock()
    }

    pub fn release(self) {}
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.pool
            .release_lease(&self.key, &self.shared, self.lease_id);
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("key", &self.key)
            .field("session_id", &self.shared.id)
            .finish()
    }
}
