// ── Session capability consumed by the engine ────────────────────────────────
//
// The protocol layer (SFTP / FTP / FTPS, bastion hops) lives outside the
// engine. It plugs in through `SessionFactory` and hands back connected
// `RemoteSession` handles; `SessionConnector` is the one routine both the
// registry and the pool use to obtain them.

use crate::xfer::error::{ConnectionFailure, XferError, XferResult};
use crate::xfer::types::*;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Mutex};

// ─── Events ──────────────────────────────────────────────────────────────────

/// Lifecycle and transfer notifications emitted by a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error { message: String },
    TransferStart { progress: TransferProgress },
    TransferComplete { progress: TransferProgress },
}

// ─── Session trait ───────────────────────────────────────────────────────────

/// A handle to one remote endpoint. Implementations use interior
/// mutability; the engine shares them as `Arc<dyn RemoteSession>`.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Unique per session instance.
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Subscribe to this session's event channel.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn connect(&self) -> XferResult<()>;

    async fn disconnect(&self) -> XferResult<()>;

    async fn list(&self, path: &str) -> XferResult<Vec<FileEntry>>;

    /// `Ok(None)` when nothing exists at `path`.
    async fn stat(&self, path: &str) -> XferResult<Option<FileEntry>>;

    async fn exists(&self, path: &str) -> XferResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Stream a local file to the remote path. Returns bytes sent.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> XferResult<u64>;

    /// Stream a remote file to the local path. Returns bytes received.
    async fn download(&self, remote_path: &str, local_path: &Path) -> XferResult<u64>;

    async fn read_file(&self, path: &str) -> XferResult<Vec<u8>>;

    async fn write_file(&self, path: &str, data: &[u8]) -> XferResult<()>;

    async fn mkdir(&self, path: &str) -> XferResult<()>;

    async fn rmdir(&self, path: &str, recursive: bool) -> XferResult<()>;

    async fn delete(&self, path: &str) -> XferResult<()>;

    async fn rename(&self, from: &str, to: &str) -> XferResult<()>;

    async fn chmod(&self, path: &str, mode: u32) -> XferResult<()>;

    /// Remote command execution; SSH-backed sessions only.
    async fn exec(&self, command: &str) -> XferResult<ExecOutput> {
        let _ = command;
        Err(XferError::unsupported("exec"))
    }
}

/// Builds unconnected sessions for an endpoint.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, config: &EndpointConfig) -> XferResult<Arc<dyn RemoteSession>>;
}

// ─── Credentials ─────────────────────────────────────────────────────────────

/// Secret material for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.password.as_deref().map(str::is_empty).unwrap_or(true)
            && self.private_key_path.is_none()
    }

    fn apply(&self, config: &EndpointConfig) -> EndpointConfig {
        let mut resolved = config.clone();
        if self.password.is_some() {
            resolved.password = self.password.clone();
        }
        if self.private_key_path.is_some() {
            resolved.private_key_path = self.private_key_path.clone();
            resolved.passphrase = self.passphrase.clone();
        }
        resolved
    }
}

/// Asked for credentials when an endpoint carries neither password nor key.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// `None` means the user cancelled.
    async fn request(&self, config: &EndpointConfig) -> Option<Credentials>;
}

// ─── Connector ───────────────────────────────────────────────────────────────

/// Resolves credentials, builds a session and connects it.
pub struct SessionConnector {
    factory: Arc<dyn SessionFactory>,
    credentials: Option<Arc<dyn CredentialSource>>,
    /// Credentials obtained by prompting, keyed by endpoint key.
    prompted: StdMutex<HashMap<String, Credentials>>,
    /// One prompt at a time per endpoint key.
    prompt_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionConnector {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        credentials: Option<Arc<dyn CredentialSource>>,
    ) -> Self {
        Self {
            factory,
            credentials,
            prompted: StdMutex::new(HashMap::new()),
            prompt_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn prompt_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.prompt_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.to_string()).or_default().clone()
    }

    fn cached(&self, key: &str) -> Option<Credentials> {
        self.prompted
            .lock()
            .ok()
            .and_then(|map| map.get(key).cloned())
    }

    /// Whether a reconnect could proceed without asking the user.
    pub fn has_stored_credentials(&self, config: &EndpointConfig) -> bool {
        config.has_credentials() || self.cached(&config.key()).is_some()
    }

    /// Drop prompted credentials for an endpoint (after an auth failure).
    pub fn forget(&self, key: &str) {
        if let Ok(mut map) = self.prompted.lock() {
            map.remove(key);
        }
    }

    /// Fill in credentials, prompting the credential source when needed.
    pub async fn resolve(&self, config: &EndpointConfig) -> XferResult<EndpointConfig> {
        if config.has_credentials() {
            return Ok(config.clone());
        }
        let key = config.key();
        if let Some(creds) = self.cached(&key) {
            return Ok(creds.apply(config));
        }

        let source = self.credentials.as_ref().ok_or_else(|| {
            XferError::connection(
                &key,
                ConnectionFailure::CredentialsRequired,
                "no password or private key configured",
            )
        })?;

        // Concurrent opens wait for the first prompt instead of asking again.
        let lock = self.prompt_lock(&key);
        let _prompting = lock.lock().await;
        if let Some(creds) = self.cached(&key) {
            return Ok(creds.apply(config));
        }

        debug!("Requesting credentials for {}", key);
        match source.request(config).await {
            Some(creds) if !creds.is_empty() => {
                if let Ok(mut map) = self.prompted.lock() {
                    map.insert(key, creds.clone());
                }
                Ok(creds.apply(config))
            }
            _ => Err(XferError::connection(
                &key,
                ConnectionFailure::CredentialsRequired,
                "credential prompt cancelled",
            )),
        }
    }

    /// Resolve credentials and build an unconnected session.
    pub async fn build(
        &self,
        config: &EndpointConfig,
    ) -> XferResult<(EndpointConfig, Arc<dyn RemoteSession>)> {
        let resolved = self.resolve(config).await?;
        let session = self.factory.create(&resolved).await?;
        Ok((resolved, session))
    }

    /// Connect a built session under the endpoint's connect timeout.
    pub async fn connect_session(
        &self,
        config: &EndpointConfig,
        session: &Arc<dyn RemoteSession>,
    ) -> XferResult<()> {
        let key = config.key();
        match tokio::time::timeout(config.connect_timeout(), session.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let err = match e {
                    XferError::Connection {
                        failure: ConnectionFailure::Auth,
                        ..
                    } => {
                        self.forget(&key);
                        e
                    }
                    XferError::Connection { .. } => e,
                    other => XferError::connection(&key, ConnectionFailure::Network, other.to_string()),
                };
                warn!("Connecting {} failed: {}", key, err);
                Err(err)
            }
            Err(_) => {
                let _ = session.disconnect().await;
                Err(XferError::connection(
                    &key,
                    ConnectionFailure::Timeout,
                    format!("no response within {}s", config.connect_timeout().as_secs()),
                ))
            }
        }
    }

    /// Build and connect in one step.
    pub async fn open(&self, config: &EndpointConfig) -> XferResult<Arc<dyn RemoteSession>> {
        let (resolved, session) = self.build(config).await?;
        self.connect_session(&resolved, &session).await?;
        info!("Session {} opened to {}", session.id(), resolved.key());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfer::testing::{endpoint, MockFactory, StaticCredentials};
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_connects_session() {
        let factory = MockFactory::new();
        let connector = SessionConnector::new(factory.clone(), None);
        let session = connector.open(&endpoint("h")).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_without_source_fails() {
        let factory = MockFactory::new();
        let connector = SessionConnector::new(factory.clone(), None);
        let mut cfg = endpoint("h");
        cfg.password = None;

        let err = connector.open(&cfg).await.err().unwrap();
        assert_eq!(err.code(), "CONNECTION_CREDENTIALS_REQUIRED");
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_prompted_credentials_are_cached() {
        let factory = MockFactory::new();
        let source = StaticCredentials::new(Some(Credentials::password("pw")));
        let connector = SessionConnector::new(factory.clone(), Some(source.clone()));
        let mut cfg = endpoint("h");
        cfg.password = None;

        assert!(!connector.has_stored_credentials(&cfg));
        connector.open(&cfg).await.unwrap();
        connector.open(&cfg).await.unwrap();
        assert_eq!(source.asked(), 1);
        assert!(connector.has_stored_credentials(&cfg));
        assert_eq!(factory.last_password().as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn test_cancelled_prompt_fails() {
        let factory = MockFactory::new();
        let source = StaticCredentials::new(None);
        let connector = SessionConnector::new(factory, Some(source));
        let mut cfg = endpoint("h");
        cfg.password = None;

        let err = connector.open(&cfg).await.err().unwrap();
        assert!(matches!(
            err,
            XferError::Connection {
                failure: ConnectionFailure::CredentialsRequired,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_classified() {
        let factory = MockFactory::new();
        factory.set_connect_delay(Duration::from_secs(60));
        let connector = SessionConnector::new(factory, None);

        let err = connector.open(&endpoint("h")).await.err().unwrap();
        assert_eq!(err.code(), "CONNECTION_TIMEOUT");
    }

    #[tokio::test]
    async fn test_failed_connect_is_wrapped_as_connection_error() {
        let factory = MockFactory::new();
        factory.fail_connects(true);
        let connector = SessionConnector::new(factory, None);

        let err = connector.open(&endpoint("h")).await.err().unwrap();
        assert_eq!(err.code(), "CONNECTION_NETWORK");
    }

    #[test]
    fn test_session_event_names() {
        let json = serde_json::to_value(SessionEvent::TransferStart {
            progress: TransferProgress {
                direction: TransferDirection::Upload,
                local_path: "/l".into(),
                remote_path: "/r".into(),
                transferred_bytes: 0,
                total_bytes: Some(3),
            },
        })
        .unwrap();
        assert_eq!(json["event"], "transferStart");
        assert_eq!(json["progress"]["totalBytes"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_opens_prompt_once() {
        let factory = MockFactory::new();
        let source = StaticCredentials::new(Some(Credentials::password("pw")));
        source.set_delay(Duration::from_secs(3));
        let connector = Arc::new(SessionConnector::new(factory.clone(), Some(source.clone())));
        let mut cfg = endpoint("h");
        cfg.password = None;

        let opens = (0..4).map(|_| {
            let connector = connector.clone();
            let cfg = cfg.clone();
            tokio::spawn(async move { connector.open(&cfg).await.is_ok() })
        });
        for opened in futures::future::join_all(opens).await {
            assert!(opened.unwrap());
        }
        assert_eq!(source.asked(), 1);
        assert_eq!(factory.created(), 4);
    }
}
