//! Shared types for the transfer engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─── Endpoint ────────────────────────────────────────────────────────

/// Wire protocol spoken by an endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// SSH file-transfer protocol.
    Sftp,
    /// Plain-text FTP.
    Ftp,
    /// FTP over TLS.
    Ftps,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Sftp
    }
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp | Protocol::Ftps => 21,
        }
    }

    /// Whether the protocol runs over SSH and can therefore execute commands.
    pub fn supports_exec(self) -> bool {
        matches!(self, Protocol::Sftp)
    }
}

/// Immutable descriptor of one remote target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Friendly name; replaces the host in the identity key when set.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    /// 0 means "the protocol's default port".
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Remote root directory.
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// Requested number of pooled sessions (capped by the pool's maximum).
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Per-transfer timeout override; the scheduler default applies when unset.
    #[serde(default)]
    pub transfer_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Glob patterns excluded from directory operations.
    #[serde(default)]
    pub ignore: Vec<String>,
}

fn default_remote_path() -> String {
    "/".to_string()
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_true() -> bool {
    true
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: None,
            protocol: Protocol::Sftp,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: None,
            private_key_path: None,
            passphrase: None,
            remote_path: default_remote_path(),
            pool_size: None,
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: None,
            auto_reconnect: true,
            ignore: Vec::new(),
        }
    }
}

impl EndpointConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    /// The port actually dialled.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.protocol.default_port()
        } else {
            self.port
        }
    }

    /// Identity key: `name-or-host:port-username`.
    pub fn key(&self) -> String {
        let label = self
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.host);
        format!("{}:{}-{}", label, self.effective_port(), self.username)
    }

    /// Whether password or key material is present in the descriptor itself.
    pub fn has_credentials(&self) -> bool {
        self.password.as_deref().map(|p| !p.is_empty()).unwrap_or(false)
            || self.private_key_path.is_some()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

// ─── Connection ──────────────────────────────────────────────────────

/// Lifecycle state of a logical connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of one registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub key: String,
    pub host: String,
    pub protocol: Protocol,
    pub state: ConnectionState,
    pub primary: bool,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

// ─── Remote filesystem ───────────────────────────────────────────────

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One entry of a directory listing or a `stat` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<u32>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

// ─── Transfer ────────────────────────────────────────────────────────

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Progress payload carried by session transfer events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub transferred_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// State of a queued transfer. Transitions only move forward:
/// `Pending → Transferring → Completed | Error`, or `Pending → Error`
/// when a pending item is cancelled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Transferring => 1,
            TransferStatus::Completed | TransferStatus::Error => 2,
        }
    }

    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Pre-known collision facts, supplied by directory operations so the
/// worker can skip its own existence probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollisionMetadata {
    pub target_exists: bool,
    pub target_type: Option<EntryKind>,
}

impl CollisionMetadata {
    pub fn absent() -> Self {
        Self {
            target_exists: false,
            target_type: None,
        }
    }

    pub fn existing(kind: EntryKind) -> Self {
        Self {
            target_exists: true,
            target_type: Some(kind),
        }
    }
}

/// What a caller asks the scheduler to move.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub endpoint: EndpointConfig,
    pub metadata: Option<CollisionMetadata>,
    /// Overwrite an existing target without consulting the collision policy.
    pub force_overwrite: bool,
}

impl TransferRequest {
    pub fn upload(local: impl Into<String>, remote: impl Into<String>, endpoint: &EndpointConfig) -> Self {
        Self {
            direction: TransferDirection::Upload,
            local_path: local.into(),
            remote_path: remote.into(),
            endpoint: endpoint.clone(),
            metadata: None,
            force_overwrite: false,
        }
    }

    pub fn download(remote: impl Into<String>, local: impl Into<String>, endpoint: &EndpointConfig) -> Self {
        Self {
            direction: TransferDirection::Download,
            local_path: local.into(),
            remote_path: remote.into(),
            endpoint: endpoint.clone(),
            metadata: None,
            force_overwrite: false,
        }
    }

    pub fn with_metadata(mut self, metadata: CollisionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_overwrite = true;
        self
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub endpoint_key: String,
    #[serde(skip)]
    pub endpoint: EndpointConfig,
    /// Best-effort; filled lazily for uploads.
    pub size: Option<u64>,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub error: Option<String>,
    /// Stable code of the error, when the item failed.
    pub error_code: Option<String>,
    pub metadata: Option<CollisionMetadata>,
    pub force_overwrite: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferItem {
    pub fn from_request(id: String, request: TransferRequest) -> Self {
        Self {
            id,
            direction: request.direction,
            local_path: request.local_path,
            remote_path: request.remote_path,
            endpoint_key: request.endpoint.key(),
            endpoint: request.endpoint,
            size: None,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            error: None,
            error_code: None,
            metadata: request.metadata,
            force_overwrite: request.force_overwrite,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping timestamps. Returns `false` (and leaves the
    /// item untouched) for a backwards or repeated transition.
    pub fn advance(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        match next {
            TransferStatus::Transferring => self.started_at = Some(Utc::now()),
            TransferStatus::Completed | TransferStatus::Error => {
                self.completed_at = Some(Utc::now())
            }
            TransferStatus::Pending => {}
        }
        true
    }

    /// The path written by this transfer.
    pub fn target_path(&self) -> &str {
        match self.direction {
            TransferDirection::Upload => &self.remote_path,
            TransferDirection::Download => &self.local_path,
        }
    }
}

// ─── Collisions ──────────────────────────────────────────────────────

/// Remembered collision decision for the remainder of one operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CollisionPolicy {
    Ask,
    Overwrite,
    Skip,
}

impl Default for CollisionPolicy {
    fn default() -> Self {
        Self::Ask
    }
}

/// Answer to one collision prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CollisionChoice {
    Overwrite,
    Skip,
    OverwriteAll,
    SkipAll,
}

// ─── Directory sync ──────────────────────────────────────────────────

/// Options for directory-level operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// Delete destination files that do not exist on the source side.
    #[serde(default)]
    pub delete_extraneous: bool,
}

/// One failed path in a directory operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub path: String,
    pub error: String,
    pub code: String,
}

/// Aggregate outcome of a directory-level operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<SyncFailure>,
    pub skipped: Vec<String>,
    /// A traversal cap was reached; the candidate list is incomplete.
    pub truncated: bool,
}

impl SyncResult {
    pub fn merge(&mut self, other: SyncResult) {
        self.uploaded.extend(other.uploaded);
        self.downloaded.extend(other.downloaded);
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
        self.truncated |= other.truncated;
    }
}

// ─── Queue / pool snapshots ──────────────────────────────────────────

/// Summary of the transfer queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Statistics about one endpoint's pool (or all pools summed).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_sessions: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max_sessions: usize,
}

// ─── Configuration ───────────────────────────────────────────────────

/// Configuration for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Hard cap on pooled sessions per endpoint.
    #[serde(default = "default_max_pool")]
    pub max_pool_size: usize,
    #[serde(default = "default_acquire_poll")]
    pub acquire_poll_ms: u64,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_pool() -> usize {
    5
}
fn default_acquire_poll() -> u64 {
    50
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool(),
            acquire_poll_ms: default_acquire_poll(),
            acquire_timeout_secs: default_acquire_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl PoolConfig {
    /// Effective per-endpoint cap for an optional size hint.
    pub fn capacity(&self, hint: Option<usize>) -> usize {
        hint.unwrap_or(self.max_pool_size)
            .min(self.max_pool_size)
            .max(1)
    }
}

/// Safety limits for directory expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TraversalLimits {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Directories listed in parallel per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_entries() -> usize {
    100_000
}
fn default_max_depth() -> usize {
    50
}
fn default_batch_size() -> usize {
    25
}

impl Default for TraversalLimits {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_depth: default_max_depth(),
            batch_size: default_batch_size(),
        }
    }
}

/// Configuration for the transfer scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Maximum simultaneously transferring items.
    #[serde(default = "default_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
    #[serde(default)]
    pub traversal: TraversalLimits,
    /// Fail items whose endpoint has neither a registry connection nor pooled sessions.
    #[serde(default = "default_true")]
    pub require_connection: bool,
}

fn default_concurrent() -> usize {
    4
}
fn default_transfer_timeout() -> u64 {
    180
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_concurrent(),
            transfer_timeout_secs: default_transfer_timeout(),
            traversal: TraversalLimits::default(),
            require_connection: true,
        }
    }
}

/// Backoff policy for automatic reconnection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base_delay() -> u64 {
    2_000
}
fn default_max_delay() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Linear growth capped at `max_delay_ms`: `min(max, base × attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(attempt.max(1) as u64)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.map(|max| attempt > max).unwrap_or(false)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}
