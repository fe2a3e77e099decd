//! Connection pool: extra per-endpoint sessions so transfers can run in
//! parallel next to the registry's primary connection.
//!
//! Sessions are created lazily through the shared [`SessionConnector`],
//! claimed with [`ConnectionPool::acquire`] and handed back with
//! [`ConnectionPool::release`]. A maintenance task sweeps idle entries.

use crate::xfer::error::{XferError, XferResult};
use crate::xfer::session::{RemoteSession, SessionConnector};
use crate::xfer::types::*;
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

struct PoolEntry {
    session: Arc<dyn RemoteSession>,
    in_use: bool,
    last_used_at: Instant,
}

impl PoolEntry {
    fn is_idle(&self) -> bool {
        !self.in_use && self.session.is_connected()
    }
}

/// Sessions for one endpoint key.
#[derive(Default)]
struct ServerPool {
    entries: Vec<PoolEntry>,
    /// Slots reserved by acquires whose session is still connecting.
    opening: usize,
    /// Identifies this incarnation; a drained and recreated pool gets a
    /// new one, so opens started before the drain are not adopted.
    epoch: u64,
    /// Cap applied by the most recent acquire.
    cap: usize,
}

impl ServerPool {
    fn live(&self) -> usize {
        self.entries.len() + self.opening
    }

    fn stats(&self, max_sessions: usize) -> PoolStats {
        let in_use = self.entries.iter().filter(|e| e.in_use).count();
        PoolStats {
            total_sessions: self.entries.len(),
            in_use,
            idle: self.entries.len() - in_use,
            max_sessions,
        }
    }
}

enum Claim {
    Ready(Arc<dyn RemoteSession>),
    Open(u64),
    Full,
}

pub struct ConnectionPool {
    connector: Arc<SessionConnector>,
    config: PoolConfig,
    pools: Mutex<HashMap<String, ServerPool>>,
    next_epoch: AtomicU64,
    maintenance: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<SessionConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            pools: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
            maintenance: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // ─── Acquire / release ───────────────────────────────────────────

    /// Claim an idle session, open a new one under the cap, or wait for one
    /// to be released. `size_hint` overrides the endpoint's `pool_size`.
    pub async fn acquire(
        &self,
        config: &EndpointConfig,
        size_hint: Option<usize>,
    ) -> XferResult<Arc<dyn RemoteSession>> {
        let key = config.key();
        let cap = self.config.capacity(size_hint.or(config.pool_size));
        let poll = Duration::from_millis(self.config.acquire_poll_ms.max(1));
        let timeout = Duration::from_secs(self.config.acquire_timeout_secs);
        let started = Instant::now();

        loop {
            match self.try_claim(&key, cap).await {
                Claim::Ready(session) => {
                    debug!("Pool {}: reusing session {}", key, session.id());
                    return Ok(session);
                }
                Claim::Open(epoch) => return self.open_entry(config, &key, epoch).await,
                Claim::Full => {}
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!("Pool {}: exhausted after {}ms", key, waited.as_millis());
                return Err(XferError::PoolExhausted {
                    endpoint: key,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            time::sleep(poll).await;
        }
    }

    async fn try_claim(&self, key: &str, cap: usize) -> Claim {
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(key.to_string()).or_insert_with(|| ServerPool {
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
            ..ServerPool::default()
        });
        pool.cap = cap;

        if let Some(entry) = pool.entries.iter_mut().find(|e| e.is_idle()) {
            entry.in_use = true;
            entry.last_used_at = Instant::now();
            return Claim::Ready(entry.session.clone());
        }

        let before = pool.entries.len();
        pool.entries.retain(|e| e.session.is_connected());
        if pool.entries.len() < before {
            debug!("Pool {}: dropped {} dead sessions", key, before - pool.entries.len());
        }

        if pool.live() < cap {
            pool.opening += 1;
            Claim::Open(pool.epoch)
        } else {
            Claim::Full
        }
    }

    async fn open_entry(
        &self,
        config: &EndpointConfig,
        key: &str,
        epoch: u64,
    ) -> XferResult<Arc<dyn RemoteSession>> {
        let opened = self.connector.open(config).await;
        let stale = {
            let mut pools = self.pools.lock().await;
            match pools.get_mut(key).filter(|p| p.epoch == epoch) {
                Some(pool) => {
                    pool.opening = pool.opening.saturating_sub(1);
                    let session = opened?;
                    pool.entries.push(PoolEntry {
                        session: session.clone(),
                        in_use: true,
                        last_used_at: Instant::now(),
                    });
                    info!("Pool {}: grew to {} sessions", key, pool.entries.len());
                    return Ok(session);
                }
                None => opened,
            }
        };

        // The pool was drained while this session was connecting.
        let session = stale?;
        debug!("Pool {}: discarding session {} opened across a drain", key, session.id());
        let _ = session.disconnect().await;
        Err(XferError::Cancelled {
            reason: format!("pool for {} was drained", key),
        })
    }

    /// Return a session. Dead sessions are dropped instead of going back to
    /// the free list.
    pub async fn release(&self, config: &EndpointConfig, session: &Arc<dyn RemoteSession>) {
        let key = config.key();
        let mut pools = self.pools.lock().await;
        let Some(pool) = pools.get_mut(&key) else {
            return;
        };
        let Some(idx) = pool
            .entries
            .iter()
            .position(|e| e.session.id() == session.id())
        else {
            return;
        };

        if session.is_connected() {
            let entry = &mut pool.entries[idx];
            entry.in_use = false;
            entry.last_used_at = Instant::now();
        } else {
            pool.entries.remove(idx);
            debug!("Pool {}: released dead session {}", key, session.id());
        }
    }

    /// Remove one entry regardless of its state.
    pub async fn evict(&self, config: &EndpointConfig, session: &Arc<dyn RemoteSession>) {
        let key = config.key();
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get_mut(&key) {
            pool.entries.retain(|e| e.session.id() != session.id());
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────

    /// Disconnect every session for one endpoint and discard its pool.
    pub async fn drain(&self, config: &EndpointConfig) {
        let key = config.key();
        let removed = self.pools.lock().await.remove(&key);
        if let Some(pool) = removed {
            let count = pool.entries.len();
            disconnect_entries(pool.entries).await;
            if count > 0 {
                info!("Pool {}: drained {} sessions", key, count);
            }
        }
    }

    /// Drain every endpoint's pool, in parallel.
    pub async fn drain_all(&self) {
        let pools: Vec<(String, ServerPool)> = self.pools.lock().await.drain().collect();
        join_all(pools.into_iter().map(|(key, pool)| async move {
            let count = pool.entries.len();
            disconnect_entries(pool.entries).await;
            debug!("Pool {}: drained {} sessions", key, count);
        }))
        .await;
    }

    // ─── Idle sweep ──────────────────────────────────────────────────

    /// Evict idle sessions older than the idle timeout, always keeping the
    /// most recently used idle session of each pool. Returns the number evicted.
    pub async fn sweep_idle(&self) -> usize {
        let ttl = Duration::from_secs(self.config.idle_timeout_secs);
        let now = Instant::now();
        let mut evicted = Vec::new();

        {
            let mut pools = self.pools.lock().await;
            for (key, pool) in pools.iter_mut() {
                pool.entries
                    .retain(|e| e.in_use || e.session.is_connected());

                let mut idle: Vec<usize> = pool
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.is_idle())
                    .map(|(i, _)| i)
                    .collect();
                if idle.len() <= 1 {
                    continue;
                }
                idle.sort_by(|a, b| {
                    pool.entries[*b]
                        .last_used_at
                        .cmp(&pool.entries[*a].last_used_at)
                });

                let mut doomed: Vec<usize> = idle
                    .into_iter()
                    .skip(1)
                    .filter(|i| now.duration_since(pool.entries[*i].last_used_at) > ttl)
                    .collect();
                if doomed.is_empty() {
                    continue;
                }
                doomed.sort_unstable_by(|a, b| b.cmp(a));
                for i in doomed {
                    evicted.push(pool.entries.remove(i));
                }
                debug!("Pool {}: {} sessions left after sweep", key, pool.entries.len());
            }
            pools.retain(|_, p| !p.entries.is_empty() || p.opening > 0);
        }

        let count = evicted.len();
        if count > 0 {
            info!("Pool: evicted {} idle sessions", count);
            disconnect_entries(evicted).await;
        }
        count
    }

    /// Spawn the periodic idle sweep. Calling it again replaces the task.
    pub fn start_maintenance(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.sweep_idle().await;
            }
        });
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop maintenance and drain every pool.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.drain_all().await;
    }

    // ─── Introspection ───────────────────────────────────────────────

    /// Whether any session (or pending open) exists for the key.
    pub async fn knows(&self, key: &str) -> bool {
        self.pools
            .lock()
            .await
            .get(key)
            .map(|p| p.live() > 0)
            .unwrap_or(false)
    }

    /// Stats for one endpoint; an endpoint with no pool yet reports the cap
    /// its configured `pool_size` would get.
    pub async fn stats_for(&self, config: &EndpointConfig) -> PoolStats {
        let max = self.config.capacity(config.pool_size);
        self.pools
            .lock()
            .await
            .get(&config.key())
            .map(|p| p.stats(p.cap))
            .unwrap_or(PoolStats {
                max_sessions: max,
                ..PoolStats::default()
            })
    }

    /// Per-endpoint stats. `max_sessions` is the cap the endpoint's last
    /// acquire ran under.
    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .lock()
            .await
            .iter()
            .map(|(k, p)| (k.clone(), p.stats(p.cap)))
            .collect()
    }
}

async fn disconnect_entries(entries: Vec<PoolEntry>) {
    join_all(entries.into_iter().map(|e| async move {
        if let Err(err) = e.session.disconnect().await {
            debug!("Ignoring disconnect error for {}: {}", e.session.id(), err);
        }
    }))
    .await;
}
