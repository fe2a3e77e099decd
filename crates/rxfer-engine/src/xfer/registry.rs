//! Connection registry: one logical connection per endpoint key.
//!
//! Concurrent `connect` calls for the same key share a single in-flight
//! attempt. Each live session is watched; an unexpected disconnect schedules
//! a reconnect loop with linear backoff (`min(max, base × attempt)`), while a
//! disconnect requested through [`ConnectionRegistry::disconnect`] does not.

use crate::xfer::error::{XferError, XferResult};
use crate::xfer::events::{EngineEvent, EventBus};
use crate::xfer::pool::ConnectionPool;
use crate::xfer::session::{RemoteSession, SessionConnector, SessionEvent};
use crate::xfer::types::*;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

type ConnectFuture = Shared<BoxFuture<'static, XferResult<Arc<dyn RemoteSession>>>>;

struct ConnectionRecord {
    config: EndpointConfig,
    session: Option<Arc<dyn RemoteSession>>,
    state: ConnectionState,
    attempts: u32,
    reconnect: Option<JoinHandle<()>>,
    connecting: Option<ConnectFuture>,
    watcher: Option<JoinHandle<()>>,
    connected_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            session: None,
            state: ConnectionState::Disconnected,
            attempts: 0,
            reconnect: None,
            connecting: None,
            watcher: None,
            connected_at: None,
        }
    }

    fn live_session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.session.as_ref().filter(|s| s.is_connected()).cloned()
    }

    fn stop_tasks(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
        if let Some(handle) = self.watcher.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<String, ConnectionRecord>,
    primary: Option<String>,
}

pub struct ConnectionRegistry {
    connector: Arc<SessionConnector>,
    pool: Arc<ConnectionPool>,
    policy: ReconnectPolicy,
    events: EventBus,
    state: StdMutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<SessionConnector>,
        pool: Arc<ConnectionPool>,
        policy: ReconnectPolicy,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            pool,
            policy,
            events,
            state: StdMutex::new(RegistryState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────

    /// Return the live session for the endpoint, join an attempt already in
    /// flight, or start a new one.
    pub async fn connect(
        self: &Arc<Self>,
        config: &EndpointConfig,
    ) -> XferResult<Arc<dyn RemoteSession>> {
        let key = config.key();
        let attempt = {
            let mut st = self.state();
            let rec = st
                .records
                .entry(key.clone())
                .or_insert_with(|| ConnectionRecord::new(config.clone()));
            if let Some(session) = rec.live_session() {
                return Ok(session);
            }
            match rec.connecting.clone() {
                Some(pending) => {
                    debug!("Joining in-flight connect for {}", key);
                    pending
                }
                None => {
                    rec.config = config.clone();
                    rec.state = ConnectionState::Connecting;
                    let task = tokio::spawn(self.clone().establish(config.clone()));
                    let pending = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(XferError::session(format!("connect task failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    rec.connecting = Some(pending.clone());
                    pending
                }
            }
        };
        attempt.await
    }

    /// Same as [`connect`](Self::connect); reads better at call sites that
    /// only need a usable session.
    pub async fn ensure_connection(
        self: &Arc<Self>,
        config: &EndpointConfig,
    ) -> XferResult<Arc<dyn RemoteSession>> {
        self.connect(config).await
    }

    async fn establish(self: Arc<Self>, config: EndpointConfig) -> XferResult<Arc<dyn RemoteSession>> {
        let key = config.key();
        info!("Connecting to {}", key);

        let opened = async {
            let (resolved, session) = self.connector.build(&config).await?;
            let rx = session.subscribe();
            self.connector.connect_session(&resolved, &session).await?;
            Ok::<_, XferError>((session, rx))
        }
        .await;

        match opened {
            Ok((session, rx)) => {
                let registered = {
                    let mut st = self.state();
                    match st.records.get_mut(&key) {
                        None => None,
                        Some(rec) => {
                            let watcher = tokio::spawn(watch_session(
                                Arc::downgrade(&self),
                                key.clone(),
                                session.id().to_string(),
                                rx,
                            ));
                            rec.session = Some(session.clone());
                            rec.state = ConnectionState::Connected;
                            rec.attempts = 0;
                            rec.connecting = None;
                            rec.connected_at = Some(Utc::now());
                            if let Some(old) = rec.watcher.replace(watcher) {
                                old.abort();
                            }
                            let became_primary = st.primary.is_none();
                            if became_primary {
                                st.primary = Some(key.clone());
                            }
                            Some(became_primary)
                        }
                    }
                };
                let Some(became_primary) = registered else {
                    // Disconnected while the attempt was in flight.
                    let _ = session.disconnect().await;
                    return Err(XferError::Cancelled {
                        reason: format!("{} was disconnected while connecting", key),
                    });
                };
                info!("Connected to {} (session {})", key, session.id());
                self.events.emit(EngineEvent::Connected { key: key.clone() });
                if became_primary {
                    self.events.emit(EngineEvent::PrimaryChanged { key: Some(key) });
                }
                Ok(session)
            }
            Err(e) => {
                {
                    let mut st = self.state();
                    let forget = match st.records.get_mut(&key) {
                        Some(rec) => {
                            rec.connecting = None;
                            if rec.session.is_none() {
                                rec.state = ConnectionState::Disconnected;
                            }
                            rec.session.is_none() && rec.reconnect.is_none() && rec.attempts == 0
                        }
                        None => false,
                    };
                    if forget {
                        st.records.remove(&key);
                    }
                }
                self.events.emit(EngineEvent::ConnectionError {
                    key,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ─── Disconnect ──────────────────────────────────────────────────

    /// Close one endpoint's connection, or every connection when `config`
    /// is `None`. Pending reconnects are cancelled and pools drained.
    pub async fn disconnect(&self, config: Option<&EndpointConfig>) {
        match config {
            Some(cfg) => self.disconnect_key(&cfg.key()).await,
            None => self.disconnect_all().await,
        }
    }

    pub async fn disconnect_all(&self) {
        let keys: Vec<String> = self.state().records.keys().cloned().collect();
        join_all(keys.iter().map(|k| self.disconnect_key(k))).await;
    }

    async fn disconnect_key(&self, key: &str) {
        let (config, session, was_primary) = {
            let mut st = self.state();
            // Without a record, the watcher and any reconnect loop treat the
            // coming disconnect as requested.
            let Some(mut rec) = st.records.remove(key) else {
                return;
            };
            if let Some(handle) = rec.reconnect.take() {
                handle.abort();
            }
            let was_primary = st.primary.as_deref() == Some(key);
            if was_primary {
                st.primary = None;
            }
            (rec.config.clone(), rec.session.take(), was_primary)
        };

        self.pool.drain(&config).await;
        if let Some(session) = session {
            if let Err(e) = session.disconnect().await {
                debug!("Ignoring disconnect error for {}: {}", key, e);
            }
        }
        info!("Disconnected from {}", key);
        self.events.emit(EngineEvent::Disconnected {
            key: key.to_string(),
            manual: true,
        });
        if was_primary {
            self.events.emit(EngineEvent::PrimaryChanged { key: None });
        }
    }

    /// Disconnect everything and stop every background task.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        let mut st = self.state();
        for rec in st.records.values_mut() {
            rec.stop_tasks();
        }
        st.records.clear();
        st.primary = None;
    }

    // ─── Unexpected disconnects ──────────────────────────────────────

    fn on_session_disconnected(self: &Arc<Self>, key: &str, session_id: &str) {
        let (was_primary, reconnect) = {
            let mut st = self.state();
            let Some(rec) = st.records.get_mut(key) else {
                return;
            };
            if rec.session.as_ref().map(|s| s.id()) != Some(session_id) {
                return;
            }
            rec.session = None;
            rec.watcher = None;
            rec.state = ConnectionState::Disconnected;
            rec.connected_at = None;
            let reconnect = rec.config.auto_reconnect
                && self.connector.has_stored_credentials(&rec.config);

            let was_primary = st.primary.as_deref() == Some(key);
            if was_primary {
                st.primary = None;
            }
            (was_primary, reconnect)
        };

        warn!("Connection to {} dropped", key);
        self.events.emit(EngineEvent::Disconnected {
            key: key.to_string(),
            manual: false,
        });
        if was_primary {
            self.events.emit(EngineEvent::PrimaryChanged { key: None });
        }
        if reconnect {
            self.schedule_reconnect(key);
        } else {
            self.state().records.remove(key);
        }
    }

    /// Start the reconnect loop for a key unless one is already pending.
    fn schedule_reconnect(self: &Arc<Self>, key: &str) {
        let mut st = self.state();
        let Some(rec) = st.records.get_mut(key) else {
            return;
        };
        if rec.reconnect.is_some() {
            return;
        }
        rec.reconnect = Some(tokio::spawn(run_reconnect(
            Arc::downgrade(self),
            key.to_string(),
        )));
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub fn get_connection(&self, config: &EndpointConfig) -> Option<Arc<dyn RemoteSession>> {
        self.state()
            .records
            .get(&config.key())
            .and_then(|r| r.live_session())
    }

    /// Whether the registry holds any record (live, connecting or
    /// reconnecting) for the key.
    pub fn knows(&self, key: &str) -> bool {
        self.state().records.contains_key(key)
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.state()
            .records
            .get(key)
            .map(|r| r.live_session().is_some())
            .unwrap_or(false)
    }

    pub fn connection_state(&self, key: &str) -> ConnectionState {
        self.state()
            .records
            .get(key)
            .map(|r| r.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let st = self.state();
        let mut list: Vec<ConnectionInfo> = st
            .records
            .iter()
            .map(|(key, rec)| ConnectionInfo {
                key: key.clone(),
                host: rec.config.host.clone(),
                protocol: rec.config.protocol,
                state: rec.state,
                primary: st.primary.as_deref() == Some(key.as_str()),
                reconnect_attempts: rec.attempts,
                reconnect_pending: rec.reconnect.is_some(),
                connected_at: rec.connected_at,
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub fn primary(&self) -> Option<String> {
        self.state().primary.clone()
    }

    /// Designate a connected endpoint as primary.
    pub fn set_primary(&self, config: &EndpointConfig) -> XferResult<()> {
        let key = config.key();
        {
            let mut st = self.state();
            let connected = st
                .records
                .get(&key)
                .map(|r| r.live_session().is_some())
                .unwrap_or(false);
            if !connected {
                return Err(XferError::NoConnection { endpoint: key });
            }
            if st.primary.as_deref() == Some(key.as_str()) {
                return Ok(());
            }
            st.primary = Some(key.clone());
        }
        self.events.emit(EngineEvent::PrimaryChanged { key: Some(key) });
        Ok(())
    }
}

async fn watch_session(
    registry: Weak<ConnectionRegistry>,
    key: String,
    session_id: String,
    mut rx: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Disconnected) => {
                if let Some(registry) = registry.upgrade() {
                    registry.on_session_disconnected(&key, &session_id);
                }
                break;
            }
            Ok(SessionEvent::Error { message }) => {
                warn!("Session error on {}: {}", key, message);
                if let Some(registry) = registry.upgrade() {
                    registry.events.emit(EngineEvent::ConnectionError {
                        key: key.clone(),
                        message,
                    });
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => debug!("Watcher for {} skipped {} events", key, n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_reconnect(registry: Weak<ConnectionRegistry>, key: String) {
    loop {
        let delay = {
            let Some(this) = registry.upgrade() else {
                return;
            };
            let mut st = this.state();
            let Some(rec) = st.records.get_mut(&key) else {
                return;
            };
            if rec.live_session().is_some() {
                rec.reconnect = None;
                return;
            }
            rec.attempts += 1;
            let attempt = rec.attempts;
            if this.policy.exhausted(attempt) {
                warn!("Giving up on {} after {} reconnect attempts", key, attempt - 1);
                rec.reconnect = None;
                rec.attempts = 0;
                return;
            }
            let delay = this.policy.delay_for(attempt);
            drop(st);
            info!("Reconnecting to {} in {}ms (attempt {})", key, delay.as_millis(), attempt);
            this.events.emit(EngineEvent::Reconnecting {
                key: key.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            delay
        };

        tokio::time::sleep(delay).await;

        let Some(this) = registry.upgrade() else {
            return;
        };
        let config = {
            let mut st = this.state();
            let Some(rec) = st.records.get_mut(&key) else {
                return;
            };
            if rec.live_session().is_some() {
                rec.reconnect = None;
                return;
            }
            rec.config.clone()
        };

        match this.connect(&config).await {
            Ok(_) => {
                if let Some(rec) = this.state().records.get_mut(&key) {
                    rec.reconnect = None;
                }
                return;
            }
            Err(e) => warn!("Reconnect to {} failed: {}", key, e),
        }
    }
}
