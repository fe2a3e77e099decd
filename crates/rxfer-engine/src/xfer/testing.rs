//! In-memory session fakes for tests.
//!
//! Every session a [`MockFactory`] creates shares one remote filesystem,
//! the way pooled sessions to a real server see the same files.

use crate::xfer::collision::{CollisionPrompt, CollisionPrompter};
use crate::xfer::error::{XferError, XferResult};
use crate::xfer::paths;
use crate::xfer::session::{CredentialSource, Credentials, RemoteSession, SessionEvent, SessionFactory};
use crate::xfer::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// An SFTP endpoint with a password, so no credential prompt is needed.
pub fn endpoint(host: &str) -> EndpointConfig {
    let mut cfg = EndpointConfig::new(Protocol::Sftp, host, "tester");
    cfg.password = Some("secret".into());
    cfg
}

// ── Remote filesystem ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
    },
}

type RemoteFs = Arc<StdMutex<BTreeMap<String, Node>>>;

fn lock_fs(fs: &RemoteFs) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
    match fs.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn entry_for(path: &str, node: &Node) -> FileEntry {
    match node {
        Node::Dir => FileEntry {
            name: paths::file_name(path),
            path: path.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            permissions: Some(0o755),
        },
        Node::File { data, modified } => FileEntry {
            name: paths::file_name(path),
            path: path.to_string(),
            kind: EntryKind::File,
            size: data.len() as u64,
            modified: Some(*modified),
            permissions: Some(0o644),
        },
    }
}

// ── Shared knobs ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Knobs {
    fail_connects: AtomicBool,
    hang_transfers: AtomicBool,
    connect_delay_ms: AtomicUsize,
    transfer_delay_ms: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    transfers: AtomicUsize,
    connects: AtomicUsize,
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct MockSession {
    id: String,
    fs: RemoteFs,
    knobs: Arc<Knobs>,
    connected: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl MockSession {
    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(SessionEvent::Disconnected);
        }
    }

    fn ensure_connected(&self) -> XferResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(XferError::session("not connected"))
        }
    }

    fn require_dir(&self, path: &str) -> XferResult<()> {
        match lock_fs(&self.fs).get(path) {
            Some(Node::Dir) => Ok(()),
            _ => Err(XferError::session(format!("no such directory: {}", path))),
        }
    }

    async fn transfer_gate(&self) -> XferResult<()> {
        self.ensure_connected()?;
        if self.knobs.hang_transfers.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.knobs.transfer_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        Ok(())
    }

    async fn tracked<T, F>(&self, fut: F) -> XferResult<T>
    where
        F: std::future::Future<Output = XferResult<T>>,
    {
        let now = self.knobs.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.knobs.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = fut.await;
        self.knobs.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.knobs.transfers.fetch_add(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn connect(&self) -> XferResult<()> {
        let delay = self.knobs.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.knobs.connects.fetch_add(1, Ordering::SeqCst);
        if self.knobs.fail_connects.load(Ordering::SeqCst) {
            return Err(XferError::session("connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> XferResult<()> {
        self.drop_connection();
        Ok(())
    }

    async fn list(&self, path: &str) -> XferResult<Vec<FileEntry>> {
        self.ensure_connected()?;
        let dir = paths::normalize(path);
        self.require_dir(&dir)?;
        let fs = lock_fs(&self.fs);
        Ok(fs
            .iter()
            .filter(|(p, _)| p.as_str() != dir && paths::parent(p).as_deref() == Some(dir.as_str()))
            .map(|(p, n)| entry_for(p, n))
            .collect())
    }

    async fn stat(&self, path: &str) -> XferResult<Option<FileEntry>> {
        self.ensure_connected()?;
        let p = paths::normalize(path);
        Ok(lock_fs(&self.fs).get(&p).map(|n| entry_for(&p, n)))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> XferResult<u64> {
        self.tracked(async {
            self.transfer_gate().await?;
            let remote = paths::normalize(remote_path);
            if let Some(parent) = paths::parent(&remote) {
                self.require_dir(&parent)?;
            }
            let progress = TransferProgress {
                direction: TransferDirection::Upload,
                local_path: local_path.to_string_lossy().to_string(),
                remote_path: remote.clone(),
                transferred_bytes: 0,
                total_bytes: None,
            };
            let _ = self.events.send(SessionEvent::TransferStart {
                progress: progress.clone(),
            });
            let data = tokio::fs::read(local_path).await?;
            let len = data.len() as u64;
            lock_fs(&self.fs).insert(
                remote,
                Node::File {
                    data,
                    modified: Utc::now(),
                },
            );
            let _ = self.events.send(SessionEvent::TransferComplete {
                progress: TransferProgress {
                    transferred_bytes: len,
                    total_bytes: Some(len),
                    ..progress
                },
            });
            Ok(len)
        })
        .await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> XferResult<u64> {
        self.tracked(async {
            self.transfer_gate().await?;
            let remote = paths::normalize(remote_path);
            let data = match lock_fs(&self.fs).get(&remote) {
                Some(Node::File { data, .. }) => data.clone(),
                _ => return Err(XferError::session(format!("no such file: {}", remote))),
            };
            tokio::fs::write(local_path, &data).await?;
            Ok(data.len() as u64)
        })
        .await
    }

    async fn read_file(&self, path: &str) -> XferResult<Vec<u8>> {
        self.ensure_connected()?;
        match lock_fs(&self.fs).get(&paths::normalize(path)) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            _ => Err(XferError::session(format!("no such file: {}", path))),
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> XferResult<()> {
        self.ensure_connected()?;
        lock_fs(&self.fs).insert(
            paths::normalize(path),
            Node::File {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> XferResult<()> {
        self.ensure_connected()?;
        let p = paths::normalize(path);
        if let Some(parent) = paths::parent(&p) {
            self.require_dir(&parent)?;
        }
        let mut fs = lock_fs(&self.fs);
        if fs.contains_key(&p) {
            return Err(XferError::session(format!("already exists: {}", p)));
        }
        fs.insert(p, Node::Dir);
        Ok(())
    }

    async fn rmdir(&self, path: &str, recursive: bool) -> XferResult<()> {
        self.ensure_connected()?;
        let p = paths::normalize(path);
        let prefix = format!("{}/", p);
        let mut fs = lock_fs(&self.fs);
        let has_children = fs.keys().any(|k| k.starts_with(&prefix));
        if has_children && !recursive {
            return Err(XferError::session(format!("directory not empty: {}", p)));
        }
        fs.retain(|k, _| k != &p && !k.starts_with(&prefix));
        Ok(())
    }

    async fn delete(&self, path: &str) -> XferResult<()> {
        self.ensure_connected()?;
        let p = paths::normalize(path);
        let mut fs = lock_fs(&self.fs);
        match fs.get(&p) {
            Some(Node::File { .. }) => {
                fs.remove(&p);
                Ok(())
            }
            _ => Err(XferError::session(format!("no such file: {}", p))),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> XferResult<()> {
        self.ensure_connected()?;
        let mut fs = lock_fs(&self.fs);
        let node = fs
            .remove(&paths::normalize(from))
            .ok_or_else(|| XferError::session(format!("no such path: {}", from)))?;
        fs.insert(paths::normalize(to), node);
        Ok(())
    }

    async fn chmod(&self, path: &str, _mode: u32) -> XferResult<()> {
        self.ensure_connected()?;
        if lock_fs(&self.fs).contains_key(&paths::normalize(path)) {
            Ok(())
        } else {
            Err(XferError::session(format!("no such path: {}", path)))
        }
    }

    async fn exec(&self, command: &str) -> XferResult<ExecOutput> {
        self.ensure_connected()?;
        Ok(ExecOutput {
            stdout: command.to_string(),
            stderr: String::new(),
            exit_code: 0,
        })
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub struct MockFactory {
    fs: RemoteFs,
    knobs: Arc<Knobs>,
    sessions: StdMutex<Vec<Arc<MockSession>>>,
    last_password: StdMutex<Option<String>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir);
        Arc::new(Self {
            fs: Arc::new(StdMutex::new(tree)),
            knobs: Arc::new(Knobs::default()),
            sessions: StdMutex::new(Vec::new()),
            last_password: StdMutex::new(None),
        })
    }

    /// Sessions constructed so far.
    pub fn created(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn connect_calls(&self) -> usize {
        self.knobs.connects.load(Ordering::SeqCst)
    }

    pub fn last_password(&self) -> Option<String> {
        self.last_password.lock().ok().and_then(|p| p.clone())
    }

    pub fn fail_connects(&self, fail: bool) {
        self.knobs.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub fn hang_transfers(&self, hang: bool) {
        self.knobs.hang_transfers.store(hang, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.knobs
            .connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_transfer_delay(&self, delay: Duration) {
        self.knobs
            .transfer_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Highest number of simultaneous upload/download calls observed.
    pub fn peak_transfers(&self) -> usize {
        self.knobs.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn transfers(&self) -> usize {
        self.knobs.transfers.load(Ordering::SeqCst)
    }

    /// Create a directory and its missing ancestors.
    pub fn put_dir(&self, path: &str) {
        let mut fs = lock_fs(&self.fs);
        let mut cur = paths::normalize(path);
        loop {
            fs.entry(cur.clone()).or_insert(Node::Dir);
            match paths::parent(&cur) {
                Some(p) => cur = p,
                None => break,
            }
        }
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.put_file_at(path, data, Utc::now());
    }

    pub fn put_file_at(&self, path: &str, data: &[u8], modified: DateTime<Utc>) {
        let p = paths::normalize(path);
        if let Some(parent) = paths::parent(&p) {
            self.put_dir(&parent);
        }
        lock_fs(&self.fs).insert(
            p,
            Node::File {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match lock_fs(&self.fs).get(&paths::normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        lock_fs(&self.fs).contains_key(&paths::normalize(path))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(lock_fs(&self.fs).get(&paths::normalize(path)), Some(Node::Dir))
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self, config: &EndpointConfig) -> XferResult<Arc<dyn RemoteSession>> {
        if let Ok(mut p) = self.last_password.lock() {
            *p = config.password.clone();
        }
        let (events, _) = broadcast::channel(64);
        let session = Arc::new(MockSession {
            id: Uuid::new_v4().to_string(),
            fs: self.fs.clone(),
            knobs: self.knobs.clone(),
            connected: AtomicBool::new(false),
            events,
        });
        if let Ok(mut s) = self.sessions.lock() {
            s.push(session.clone());
        }
        Ok(session)
    }
}

// ── Credentials ──────────────────────────────────────────────────────────────

pub struct StaticCredentials {
    creds: Option<Credentials>,
    asked: AtomicUsize,
    delay_ms: AtomicUsize,
}

impl StaticCredentials {
    pub fn new(creds: Option<Credentials>) -> Arc<Self> {
        Arc::new(Self {
            creds,
            asked: AtomicUsize::new(0),
            delay_ms: AtomicUsize::new(0),
        })
    }

    /// Simulate a user taking `delay` to answer.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn request(&self, _config: &EndpointConfig) -> Option<Credentials> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.creds.clone()
    }
}

// ── Collision prompts ────────────────────────────────────────────────────────

/// Answers prompts from a script; `Skip` once the script runs out.
pub struct ScriptedPrompter {
    script: StdMutex<VecDeque<Option<CollisionChoice>>>,
    seen: StdMutex<Vec<CollisionPrompt>>,
    delay_ms: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(script: Vec<Option<CollisionChoice>>) -> Arc<Self> {
        Arc::new(Self {
            script: StdMutex::new(script.into()),
            seen: StdMutex::new(Vec::new()),
            delay_ms: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn prompts(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn seen(&self) -> Vec<CollisionPrompt> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Most prompts ever visible at the same moment.
    pub fn peak_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollisionPrompter for ScriptedPrompter {
    async fn prompt(&self, prompt: CollisionPrompt) -> Option<CollisionChoice> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(prompt);
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let answer = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(Some(CollisionChoice::Skip));
        self.active.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}
