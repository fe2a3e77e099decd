//! Transfer scheduler: a FIFO queue drained by at most `max_concurrent`
//! workers, each running one item on a pooled session.
//!
//! Directory-level operations expand a tree with [`traverse::walk`], enqueue
//! one item per file under a fresh collision scope and fold the per-item
//! outcomes into a [`SyncResult`].

use crate::xfer::collision::{CollisionDecision, CollisionPrompt, CollisionResolver};
use crate::xfer::error::{XferError, XferResult};
use crate::xfer::events::{EngineEvent, EventBus};
use crate::xfer::paths;
use crate::xfer::pool::ConnectionPool;
use crate::xfer::registry::ConnectionRegistry;
use crate::xfer::session::RemoteSession;
use crate::xfer::traverse::{self, IgnoreMatcher, LocalLister, RemoteLister, TraversalOutcome};
use crate::xfer::types::*;
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

// ─── Handles ─────────────────────────────────────────────────────────────────

/// Completion handle for one enqueued item.
pub struct TransferHandle {
    id: String,
    rx: oneshot::Receiver<TransferItem>,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the item to reach a terminal state.
    pub async fn wait(self) -> XferResult<TransferItem> {
        self.rx.await.map_err(|_| XferError::Cancelled {
            reason: "scheduler shut down".to_string(),
        })
    }
}

// ─── Queue state ─────────────────────────────────────────────────────────────

struct Job {
    item: TransferItem,
    resolver: Arc<CollisionResolver>,
    done: Option<oneshot::Sender<TransferItem>>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// Every retained item id in enqueue order.
    order: Vec<String>,
    pending: VecDeque<String>,
    active: usize,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        let mut s = QueueStatus {
            total: self.jobs.len(),
            ..QueueStatus::default()
        };
        for job in self.jobs.values() {
            match job.item.status {
                TransferStatus::Pending => s.pending += 1,
                TransferStatus::Transferring => s.active += 1,
                TransferStatus::Completed => s.completed += 1,
                TransferStatus::Error => s.failed += 1,
            }
        }
        s
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.pending.is_empty()
    }
}

fn fail_item(item: &mut TransferItem, err: &XferError) {
    item.advance(TransferStatus::Error);
    item.error = Some(err.to_string());
    item.error_code = Some(err.code().to_string());
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct TransferScheduler {
    registry: Arc<ConnectionRegistry>,
    pool: Arc<ConnectionPool>,
    config: SchedulerConfig,
    events: EventBus,
    resolver: Arc<CollisionResolver>,
    state: StdMutex<QueueState>,
}

impl TransferScheduler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pool: Arc<ConnectionPool>,
        config: SchedulerConfig,
        events: EventBus,
        resolver: Arc<CollisionResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pool,
            config,
            events,
            resolver,
            state: StdMutex::new(QueueState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The resolver used for single-file transfers.
    pub fn collision_resolver(&self) -> &Arc<CollisionResolver> {
        &self.resolver
    }

    // ─── Enqueue / pump ──────────────────────────────────────────────

    /// Queue a single-file transfer under the shared collision scope.
    pub fn enqueue(self: &Arc<Self>, request: TransferRequest) -> TransferHandle {
        let resolver = self.resolver.clone();
        self.enqueue_scoped(request, resolver)
    }

    /// Queue a transfer whose collision answers are remembered in `resolver`.
    pub fn enqueue_scoped(
        self: &Arc<Self>,
        request: TransferRequest,
        resolver: Arc<CollisionResolver>,
    ) -> TransferHandle {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let status = {
            let mut st = self.state();
            st.jobs.insert(
                id.clone(),
                Job {
                    item: TransferItem::from_request(id.clone(), request),
                    resolver,
                    done: Some(tx),
                },
            );
            st.order.push(id.clone());
            st.pending.push_back(id.clone());
            st.status()
        };
        debug!("Enqueued transfer {}", id);
        self.events.emit(EngineEvent::QueueChanged { status });
        self.pump();
        TransferHandle { id, rx }
    }

    /// Start workers for the oldest pending items while below the limit.
    fn pump(self: &Arc<Self>) {
        let limit = self.config.max_concurrent.max(1);
        loop {
            let claimed = {
                let mut st = self.state();
                if st.active >= limit {
                    None
                } else {
                    let mut claimed = None;
                    while let Some(id) = st.pending.pop_front() {
                        let Some(job) = st.jobs.get_mut(&id) else {
                            continue;
                        };
                        if job.item.advance(TransferStatus::Transferring) {
                            claimed = Some((job.item.clone(), job.resolver.clone()));
                            break;
                        }
                    }
                    if claimed.is_some() {
                        st.active += 1;
                    }
                    claimed
                }
            };
            let Some((item, resolver)) = claimed else {
                break;
            };
            self.events.emit(EngineEvent::ItemStarted { item: item.clone() });
            let this = self.clone();
            tokio::spawn(async move {
                this.run(item, resolver).await;
            });
        }
    }

    async fn run(self: Arc<Self>, mut item: TransferItem, resolver: Arc<CollisionResolver>) {
        let outcome = self.execute(&mut item, &resolver).await;
        self.finish(item, outcome);
    }

    fn finish(self: &Arc<Self>, worker_item: TransferItem, outcome: XferResult<()>) {
        let (completed, sender, status) = {
            let mut st = self.state();
            st.active = st.active.saturating_sub(1);
            let job = st.jobs.get_mut(&worker_item.id).map(|job| {
                job.item.size = worker_item.size;
                job.item.bytes_transferred = worker_item.bytes_transferred;
                // A cancelled item is already terminal and stays as it is.
                if !job.item.status.is_terminal() {
                    match &outcome {
                        Ok(()) => {
                            job.item.advance(TransferStatus::Completed);
                        }
                        Err(e) => fail_item(&mut job.item, e),
                    }
                }
                (job.item.clone(), job.done.take())
            });
            let status = st.status();
            match job {
                Some((item, sender)) => (Some(item), sender, status),
                None => (None, None, status),
            }
        };

        if let Err(e) = &outcome {
            warn!("Transfer {} failed: {}", worker_item.target_path(), e);
        }
        if let Some(item) = completed {
            if let Some(tx) = sender {
                let _ = tx.send(item.clone());
                self.events.emit(EngineEvent::ItemCompleted { item });
            }
        }
        self.events.emit(EngineEvent::QueueChanged { status });

        self.pump();
        if self.state().is_idle() {
            info!("Transfer queue complete");
            self.events.emit(EngineEvent::QueueComplete);
        }
    }

    // ─── Per-item execution ──────────────────────────────────────────

    async fn execute(
        &self,
        item: &mut TransferItem,
        resolver: &CollisionResolver,
    ) -> XferResult<()> {
        let endpoint = item.endpoint.clone();
        let key = endpoint.key();
        if self.config.require_connection
            && !self.registry.knows(&key)
            && !self.pool.knows(&key).await
        {
            return Err(XferError::NoConnection { endpoint: key });
        }

        let session = self.pool.acquire(&endpoint, None).await?;
        let result = self.transfer_on(&session, item, resolver).await;
        match &result {
            Err(e) if e.is_timeout() => {
                // A stuck session must not be handed out again.
                let _ = session.disconnect().await;
                self.pool.evict(&endpoint, &session).await;
            }
            _ => self.pool.release(&endpoint, &session).await,
        }
        result
    }

    async fn transfer_on(
        &self,
        session: &Arc<dyn RemoteSession>,
        item: &mut TransferItem,
        resolver: &CollisionResolver,
    ) -> XferResult<()> {
        if item.direction == TransferDirection::Upload && item.size.is_none() {
            if let Ok(meta) = tokio::fs::metadata(&item.local_path).await {
                item.size = Some(meta.len());
            }
        }

        if let Some(existing) = self.collision_target(session, item, resolver).await? {
            if !item.force_overwrite {
                let prompt = CollisionPrompt {
                    item_id: item.id.clone(),
                    direction: item.direction,
                    path: item.target_path().to_string(),
                    target_type: Some(existing),
                };
                if resolver.resolve(prompt).await == CollisionDecision::Skip {
                    return Err(XferError::CollisionSkipped {
                        path: item.target_path().to_string(),
                    });
                }
            }
            if existing == EntryKind::Directory {
                self.remove_directory_target(session, item).await?;
            }
        }

        match item.direction {
            TransferDirection::Upload => {
                if let Some(parent) = paths::parent(&item.remote_path) {
                    ensure_remote_dir(session, &parent).await?;
                }
            }
            TransferDirection::Download => {
                if let Some(parent) = Path::new(&item.local_path).parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }

        let timeout_secs = item
            .endpoint
            .transfer_timeout_secs
            .unwrap_or(self.config.transfer_timeout_secs);
        let local = PathBuf::from(&item.local_path);
        let call = async {
            match item.direction {
                TransferDirection::Upload => session.upload(&local, &item.remote_path).await,
                TransferDirection::Download => session.download(&item.remote_path, &local).await,
            }
        };
        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), call).await;
        match outcome {
            Ok(Ok(bytes)) => {
                item.bytes_transferred = bytes;
                if item.size.is_none() {
                    item.size = Some(bytes);
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(XferError::TransferTimeout {
                path: item.target_path().to_string(),
                timeout_secs,
            }),
        }
    }

    /// Kind of the existing target, if any. Uses caller-supplied metadata
    /// when present; probes unless the scope already says "overwrite".
    async fn collision_target(
        &self,
        session: &Arc<dyn RemoteSession>,
        item: &TransferItem,
        resolver: &CollisionResolver,
    ) -> XferResult<Option<EntryKind>> {
        if let Some(meta) = item.metadata {
            return Ok(meta
                .target_exists
                .then(|| meta.target_type.unwrap_or(EntryKind::File)));
        }
        if item.force_overwrite || resolver.policy() == CollisionPolicy::Overwrite {
            return Ok(None);
        }
        match item.direction {
            TransferDirection::Upload => Ok(session.stat(&item.remote_path).await?.map(|e| e.kind)),
            TransferDirection::Download => match tokio::fs::symlink_metadata(&item.local_path).await {
                Ok(m) if m.is_dir() => Ok(Some(EntryKind::Directory)),
                Ok(_) => Ok(Some(EntryKind::File)),
                Err(_) => Ok(None),
            },
        }
    }

    async fn remove_directory_target(
        &self,
        session: &Arc<dyn RemoteSession>,
        item: &TransferItem,
    ) -> XferResult<()> {
        let target = item.target_path();
        paths::guard_recursive_delete(target)?;
        info!("Replacing directory {} with a file", target);
        match item.direction {
            TransferDirection::Upload => session.rmdir(target, true).await,
            TransferDirection::Download => Ok(tokio::fs::remove_dir_all(target).await?),
        }
    }

    // ─── Queue control ───────────────────────────────────────────────

    /// Drop every pending item. Items already transferring run to completion.
    pub fn cancel_all(self: &Arc<Self>) -> usize {
        let err = XferError::cancelled_by_user();
        let (cancelled, status, idle) = {
            let mut st = self.state();
            let ids: Vec<String> = st.pending.drain(..).collect();
            let mut cancelled = Vec::new();
            for id in ids {
                if let Some(job) = st.jobs.get_mut(&id) {
                    fail_item(&mut job.item, &err);
                    cancelled.push((job.item.clone(), job.done.take()));
                }
            }
            (cancelled, st.status(), st.is_idle())
        };
        let count = cancelled.len();
        for (item, sender) in cancelled {
            if let Some(tx) = sender {
                let _ = tx.send(item.clone());
            }
            self.events.emit(EngineEvent::ItemCompleted { item });
        }
        if count > 0 {
            info!("Cancelled {} pending transfers", count);
            self.events.emit(EngineEvent::QueueChanged { status });
            if idle {
                self.events.emit(EngineEvent::QueueComplete);
            }
        }
        count
    }

    /// Cancel one pending or transferring item. A transferring item is
    /// marked failed at once; its network call still runs to completion.
    pub fn cancel_item(&self, id: &str) -> bool {
        let err = XferError::cancelled_by_user();
        let (item, sender, status, idle) = {
            let mut st = self.state();
            let Some(job) = st.jobs.get_mut(id) else {
                return false;
            };
            if job.item.status.is_terminal() {
                return false;
            }
            fail_item(&mut job.item, &err);
            let item = job.item.clone();
            let sender = job.done.take();
            st.pending.retain(|p| p != id);
            (item, sender, st.status(), st.is_idle())
        };
        if let Some(tx) = sender {
            let _ = tx.send(item.clone());
        }
        self.events.emit(EngineEvent::ItemCompleted { item });
        self.events.emit(EngineEvent::QueueChanged { status });
        if idle {
            self.events.emit(EngineEvent::QueueComplete);
        }
        true
    }

    /// Prune terminal items. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let (removed, status) = {
            let mut st = self.state();
            let before = st.jobs.len();
            st.jobs.retain(|_, job| !job.item.status.is_terminal());
            let QueueState { jobs, order, .. } = &mut *st;
            order.retain(|id| jobs.contains_key(id));
            (before - st.jobs.len(), st.status())
        };
        if removed > 0 {
            self.events.emit(EngineEvent::QueueChanged { status });
        }
        removed
    }

    pub fn status(&self) -> QueueStatus {
        self.state().status()
    }

    /// Every retained item, in enqueue order.
    pub fn list(&self) -> Vec<TransferItem> {
        let st = self.state();
        st.order
            .iter()
            .filter_map(|id| st.jobs.get(id).map(|j| j.item.clone()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<TransferItem> {
        self.state().jobs.get(id).map(|j| j.item.clone())
    }

    // ─── Directory operations ────────────────────────────────────────

    /// Mirror a local tree onto the remote side.
    pub async fn upload_directory(
        self: &Arc<Self>,
        session: &Arc<dyn RemoteSession>,
        local_root: &Path,
        remote_root: &str,
        endpoint: &EndpointConfig,
        options: &SyncOptions,
    ) -> XferResult<SyncResult> {
        let limits = &self.config.traversal;
        let ignore = IgnoreMatcher::new(&endpoint.ignore);
        let local = traverse::walk(&LocalLister::new(local_root), limits, &ignore).await?;

        let remote_existed = session.stat(remote_root).await?.is_some();
        ensure_remote_dir(session, remote_root).await?;
        let remote = if remote_existed {
            traverse::walk(&RemoteLister::new(session.clone(), remote_root), limits, &ignore).await?
        } else {
            TraversalOutcome::default()
        };
        let remote_index = remote.index();

        let mut result = SyncResult {
            skipped: local.skipped.clone(),
            truncated: local.truncated || remote.truncated,
            ..SyncResult::default()
        };
        record_unreadable(&mut result, &local);

        let mut dirs: Vec<&str> = local.directories().map(|d| d.relative_path.as_str()).collect();
        dirs.sort_by_key(|d| paths::depth(d));
        let mut failed_dirs = HashSet::new();
        for dir in dirs {
            let exists = remote_index
                .get(dir)
                .map(|e| e.kind == EntryKind::Directory)
                .unwrap_or(false);
            if exists {
                continue;
            }
            if let Err(e) = session.mkdir(&paths::join(remote_root, dir)).await {
                warn!("Cannot create remote directory {}: {}", dir, e);
                push_failure(&mut result, dir, &e);
                failed_dirs.insert(dir.to_string());
            }
        }

        let scope = self.resolver.scoped();
        let mut handles = Vec::new();
        for file in local.files() {
            let rel = &file.relative_path;
            if under_any(rel, &failed_dirs) {
                continue;
            }
            let metadata = match remote_index.get(rel) {
                Some(existing) => CollisionMetadata::existing(existing.kind),
                None => CollisionMetadata::absent(),
            };
            let request = TransferRequest::upload(
                local_root.join(rel).to_string_lossy().to_string(),
                paths::join(remote_root, rel),
                endpoint,
            )
            .with_metadata(metadata);
            handles.push((rel.clone(), self.enqueue_scoped(request, scope.clone())));
        }
        collect_outcomes(&mut result, handles, TransferDirection::Upload).await;

        if options.delete_extraneous {
            for (rel, kind) in extraneous(&mut result, &remote, &local, &ignore) {
                let target = paths::join(remote_root, &rel);
                let deleted = if kind == EntryKind::Directory {
                    match paths::guard_recursive_delete(&target) {
                        Ok(()) => session.rmdir(&target, true).await,
                        Err(e) => Err(e),
                    }
                } else {
                    session.delete(&target).await
                };
                match deleted {
                    Ok(()) => result.deleted.push(rel),
                    Err(e) => push_failure(&mut result, &rel, &e),
                }
            }
        }

        info!(
            "Upload of {} finished: {} uploaded, {} failed, {} skipped",
            local_root.display(),
            result.uploaded.len(),
            result.failed.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Mirror a remote tree into a local directory.
    pub async fn download_directory(
        self: &Arc<Self>,
        session: &Arc<dyn RemoteSession>,
        remote_root: &str,
        local_root: &Path,
        endpoint: &EndpointConfig,
        options: &SyncOptions,
    ) -> XferResult<SyncResult> {
        let limits = &self.config.traversal;
        let ignore = IgnoreMatcher::new(&endpoint.ignore);
        let remote =
            traverse::walk(&RemoteLister::new(session.clone(), remote_root), limits, &ignore).await?;

        let local_existed = tokio::fs::metadata(local_root).await.is_ok();
        tokio::fs::create_dir_all(local_root).await?;
        let local = if local_existed {
            traverse::walk(&LocalLister::new(local_root), limits, &ignore).await?
        } else {
            TraversalOutcome::default()
        };
        let local_index = local.index();

        let mut result = SyncResult {
            skipped: remote.skipped.clone(),
            truncated: remote.truncated || local.truncated,
            ..SyncResult::default()
        };
        record_unreadable(&mut result, &remote);

        let mut failed_dirs = HashSet::new();
        for dir in remote.directories() {
            let rel = dir.relative_path.as_str();
            if let Err(e) = tokio::fs::create_dir_all(local_root.join(rel)).await {
                push_failure(&mut result, rel, &XferError::from(e));
                failed_dirs.insert(rel.to_string());
            }
        }

        let scope = self.resolver.scoped();
        let mut handles = Vec::new();
        for file in remote.files() {
            let rel = &file.relative_path;
            if under_any(rel, &failed_dirs) {
                continue;
            }
            let metadata = match local_index.get(rel) {
                Some(existing) => CollisionMetadata::existing(existing.kind),
                None => CollisionMetadata::absent(),
            };
            let request = TransferRequest::download(
                paths::join(remote_root, rel),
                local_root.join(rel).to_string_lossy().to_string(),
                endpoint,
            )
            .with_metadata(metadata);
            handles.push((rel.clone(), self.enqueue_scoped(request, scope.clone())));
        }
        collect_outcomes(&mut result, handles, TransferDirection::Download).await;

        if options.delete_extraneous {
            for (rel, kind) in extraneous(&mut result, &local, &remote, &ignore) {
                let target = local_root.join(&rel);
                let deleted = if kind == EntryKind::Directory {
                    match paths::guard_recursive_delete(&target.to_string_lossy()) {
                        Ok(()) => tokio::fs::remove_dir_all(&target).await.map_err(XferError::from),
                        Err(e) => Err(e),
                    }
                } else {
                    tokio::fs::remove_file(&target).await.map_err(XferError::from)
                };
                match deleted {
                    Ok(()) => result.deleted.push(rel),
                    Err(e) => push_failure(&mut result, &rel, &e),
                }
            }
        }

        info!(
            "Download of {} finished: {} downloaded, {} failed, {} skipped",
            remote_root,
            result.downloaded.len(),
            result.failed.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Two-way sync: a download pass of remote files that are missing or
    /// newer locally, then an upload pass of local files that are missing
    /// or newer remotely. Files moved in the first pass are not sent back.
    pub async fn sync_both_ways(
        self: &Arc<Self>,
        session: &Arc<dyn RemoteSession>,
        local_root: &Path,
        remote_root: &str,
        endpoint: &EndpointConfig,
    ) -> XferResult<SyncResult> {
        let limits = &self.config.traversal;
        let ignore = IgnoreMatcher::new(&endpoint.ignore);

        tokio::fs::create_dir_all(local_root).await?;
        ensure_remote_dir(session, remote_root).await?;
        let local = traverse::walk(&LocalLister::new(local_root), limits, &ignore).await?;
        let remote =
            traverse::walk(&RemoteLister::new(session.clone(), remote_root), limits, &ignore).await?;
        let local_index = local.index();
        let remote_index = remote.index();

        let mut result = SyncResult {
            truncated: local.truncated || remote.truncated,
            ..SyncResult::default()
        };
        let mut skipped: Vec<String> = local.skipped.clone();
        for s in &remote.skipped {
            if !skipped.contains(s) {
                skipped.push(s.clone());
            }
        }
        result.skipped = skipped;
        record_unreadable(&mut result, &local);
        record_unreadable(&mut result, &remote);

        // Download pass.
        for dir in remote.directories() {
            if !local_index.contains_key(&dir.relative_path) {
                let rel = dir.relative_path.as_str();
                if let Err(e) = tokio::fs::create_dir_all(local_root.join(rel)).await {
                    push_failure(&mut result, rel, &XferError::from(e));
                }
            }
        }
        let scope = self.resolver.scoped();
        let mut handles = Vec::new();
        let mut pulled = HashSet::new();
        for file in remote.files() {
            let rel = &file.relative_path;
            let wanted = match local_index.get(rel) {
                None => true,
                Some(local_entry) => local_entry.kind == EntryKind::File && newer(file, local_entry),
            };
            if !wanted {
                continue;
            }
            pulled.insert(rel.clone());
            let request = TransferRequest::download(
                paths::join(remote_root, rel),
                local_root.join(rel).to_string_lossy().to_string(),
                endpoint,
            )
            .forced();
            handles.push((rel.clone(), self.enqueue_scoped(request, scope.clone())));
        }
        collect_outcomes(&mut result, handles, TransferDirection::Download).await;

        // Upload pass.
        let mut dirs: Vec<&str> = local
            .directories()
            .map(|d| d.relative_path.as_str())
            .filter(|d| !remote_index.contains_key(*d))
            .collect();
        dirs.sort_by_key(|d| paths::depth(d));
        for dir in dirs {
            if let Err(e) = session.mkdir(&paths::join(remote_root, dir)).await {
                push_failure(&mut result, dir, &e);
            }
        }
        let mut handles = Vec::new();
        for file in local.files() {
            let rel = &file.relative_path;
            if pulled.contains(rel) {
                continue;
            }
            let wanted = match remote_index.get(rel) {
                None => true,
                Some(remote_entry) => remote_entry.kind == EntryKind::File && newer(file, remote_entry),
            };
            if !wanted {
                continue;
            }
            let request = TransferRequest::upload(
                local_root.join(rel).to_string_lossy().to_string(),
                paths::join(remote_root, rel),
                endpoint,
            )
            .forced();
            handles.push((rel.clone(), self.enqueue_scoped(request, scope.clone())));
        }
        collect_outcomes(&mut result, handles, TransferDirection::Upload).await;

        info!(
            "Sync of {} <-> {} finished: {} downloaded, {} uploaded, {} failed",
            local_root.display(),
            remote_root,
            result.downloaded.len(),
            result.uploaded.len(),
            result.failed.len()
        );
        Ok(result)
    }
}

// ─── Directory helpers ───────────────────────────────────────────────────────

/// Create a remote directory and any missing ancestors. Tolerates a
/// concurrent creator.
async fn ensure_remote_dir(session: &Arc<dyn RemoteSession>, path: &str) -> XferResult<()> {
    let mut missing = Vec::new();
    let mut cur = Some(paths::normalize(path));
    while let Some(dir) = cur {
        if dir.is_empty() || session.stat(&dir).await?.is_some() {
            break;
        }
        cur = paths::parent(&dir);
        missing.push(dir);
    }
    for dir in missing.into_iter().rev() {
        if let Err(e) = session.mkdir(&dir).await {
            // Another worker may have created it in the meantime.
            match session.stat(&dir).await? {
                Some(entry) if entry.is_dir() => {}
                _ => return Err(e),
            }
        }
    }
    Ok(())
}

fn newer(candidate: &traverse::CandidateEntry, other: &traverse::CandidateEntry) -> bool {
    match (candidate.modified, other.modified) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

fn under_any(rel: &str, dirs: &HashSet<String>) -> bool {
    dirs.iter()
        .any(|d| rel.starts_with(d.as_str()) && rel[d.len()..].starts_with('/'))
}

/// Top-most destination entries with no source counterpart.
///
/// Nothing is returned when the source listing was truncated, and nothing
/// below an unreadable or symlinked source directory; each withheld pass
/// is recorded in `result.failed`.
fn extraneous(
    result: &mut SyncResult,
    destination: &TraversalOutcome,
    source: &TraversalOutcome,
    ignore: &IgnoreMatcher,
) -> Vec<(String, EntryKind)> {
    if source.truncated {
        warn!("Source listing truncated; not deleting extraneous entries");
        push_failure(
            result,
            ".",
            &XferError::IncompleteListing {
                path: ".".to_string(),
                reason: "source listing was truncated".to_string(),
            },
        );
        return Vec::new();
    }

    let keep: HashSet<&str> = source.entries.iter().map(|e| e.relative_path.as_str()).collect();
    let mut opaque: HashSet<String> = source.unreadable.iter().map(|(dir, _)| dir.clone()).collect();
    opaque.extend(
        source
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Symlink)
            .map(|e| e.relative_path.clone()),
    );

    let mut found: Vec<(String, EntryKind)> = Vec::new();
    let mut withheld: HashSet<String> = HashSet::new();
    for e in &destination.entries {
        let rel = e.relative_path.as_str();
        if keep.contains(rel) || ignore.is_ignored(rel) {
            continue;
        }
        if let Some(dir) = opaque.iter().find(|d| rel.starts_with(d.as_str()) && rel[d.len()..].starts_with('/')) {
            withheld.insert(dir.clone());
            continue;
        }
        found.push((e.relative_path.clone(), e.kind));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));

    let mut withheld: Vec<String> = withheld.into_iter().collect();
    withheld.sort();
    for dir in withheld {
        push_failure(
            result,
            &dir,
            &XferError::IncompleteListing {
                path: dir.clone(),
                reason: "source directory could not be listed".to_string(),
            },
        );
    }

    let mut removed_dirs: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for (rel, kind) in found {
        if under_any(&rel, &removed_dirs) {
            continue;
        }
        if kind == EntryKind::Directory {
            removed_dirs.insert(rel.clone());
        }
        out.push((rel, kind));
    }
    out
}

fn push_failure(result: &mut SyncResult, path: &str, err: &XferError) {
    result.failed.push(SyncFailure {
        path: path.to_string(),
        error: err.to_string(),
        code: err.code().to_string(),
    });
}

fn record_unreadable(result: &mut SyncResult, outcome: &TraversalOutcome) {
    for (path, error) in &outcome.unreadable {
        result.failed.push(SyncFailure {
            path: path.clone(),
            error: error.clone(),
            code: "SESSION".to_string(),
        });
    }
}

async fn collect_outcomes(
    result: &mut SyncResult,
    handles: Vec<(String, TransferHandle)>,
    direction: TransferDirection,
) {
    let waited = join_all(handles.into_iter().map(|(rel, h)| async move { (rel, h.wait().await) })).await;
    for (rel, outcome) in waited {
        match outcome {
            Ok(item) if item.status == TransferStatus::Completed => match direction {
                TransferDirection::Upload => result.uploaded.push(rel),
                TransferDirection::Download => result.downloaded.push(rel),
            },
            Ok(item) => result.failed.push(SyncFailure {
                path: rel,
                error: item.error.unwrap_or_else(|| "transfer failed".to_string()),
                code: item.error_code.unwrap_or_else(|| "SESSION".to_string()),
            }),
            Err(e) => push_failure(result, &rel, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfer::collision::CollisionPrompter;
    use crate::xfer::session::SessionConnector;
    use crate::xfer::testing::{endpoint, MockFactory, ScriptedPrompter};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::fs;

    struct Rig {
        factory: Arc<MockFactory>,
        registry: Arc<ConnectionRegistry>,
        pool: Arc<ConnectionPool>,
        scheduler: Arc<TransferScheduler>,
        events: EventBus,
    }

    fn rig_with(config: SchedulerConfig, prompter: Option<Arc<dyn CollisionPrompter>>) -> Rig {
        let factory = MockFactory::new();
        let connector = Arc::new(SessionConnector::new(factory.clone(), None));
        let pool = Arc::new(ConnectionPool::new(connector.clone(), PoolConfig::default()));
        let events = EventBus::new();
        let registry =
            ConnectionRegistry::new(connector, pool.clone(), ReconnectPolicy::default(), events.clone());
        let resolver = Arc::new(CollisionResolver::new(prompter));
        let scheduler =
            TransferScheduler::new(registry.clone(), pool.clone(), config, events.clone(), resolver);
        Rig {
            factory,
            registry,
            pool,
            scheduler,
            events,
        }
    }

    fn rig() -> Rig {
        rig_with(SchedulerConfig::default(), None)
    }

    fn local_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, data) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_single_upload_completes() {
        let r = rig();
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();
        let dir = local_tree(&[("a.txt", "hello")]);

        let handle = r.scheduler.enqueue(TransferRequest::upload(
            dir.path().join("a.txt").to_string_lossy().to_string(),
            "/a.txt",
            &ep,
        ));
        let item = handle.wait().await.unwrap();

        assert_eq!(item.status, TransferStatus::Completed);
        assert_eq!(item.size, Some(5));
        assert_eq!(item.bytes_transferred, 5);
        assert!(item.started_at.is_some() && item.completed_at.is_some());
        assert_eq!(r.factory.file("/a.txt").unwrap(), b"hello");
        // Transfers run on pooled sessions, not the registry's own.
        assert_eq!(r.factory.created(), 2);
        assert!(session.is_connected());
        assert_eq!(r.pool.stats_for(&ep).await.idle, 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_fails_without_connection() {
        let r = rig();
        let dir = local_tree(&[("a.txt", "x")]);
        let item = r
            .scheduler
            .enqueue(TransferRequest::upload(
                dir.path().join("a.txt").to_string_lossy().to_string(),
                "/a.txt",
                &endpoint("nowhere"),
            ))
            .wait()
            .await
            .unwrap();
        assert_eq!(item.status, TransferStatus::Error);
        assert_eq!(item.error_code.as_deref(), Some("NO_CONNECTION"));
        assert_eq!(r.factory.created(), 0);
    }

    #[tokio::test]
    async fn test_download_creates_parent_dirs() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.put_file("/srv/data.bin", b"abc");
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x/y/data.bin");

        let item = r
            .scheduler
            .enqueue(TransferRequest::download(
                "/srv/data.bin",
                target.to_string_lossy().to_string(),
                &ep,
            ))
            .wait()
            .await
            .unwrap();
        assert_eq!(item.status, TransferStatus::Completed);
        assert_eq!(fs::read(target).unwrap(), b"abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.set_transfer_delay(Duration::from_millis(100));
        let files: Vec<String> = (0..12).map(|i| format!("f{}.txt", i)).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|n| (n.as_str(), "x")).collect();
        let dir = local_tree(&refs);

        let handles: Vec<TransferHandle> = files
            .iter()
            .map(|n| {
                r.scheduler.enqueue(TransferRequest::upload(
                    dir.path().join(n).to_string_lossy().to_string(),
                    format!("/{}", n),
                    &ep,
                ))
            })
            .collect();
        for h in handles {
            assert_eq!(h.wait().await.unwrap().status, TransferStatus::Completed);
        }
        assert_eq!(r.factory.peak_transfers(), 4);
        let status = r.scheduler.status();
        assert_eq!(status.completed, 12);
        assert_eq!(status.pending + status.active, 0);
    }

    #[tokio::test]
    async fn test_status_sequence_is_monotonic() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        let mut rx = r.events.subscribe();
        let dir = local_tree(&[("a.txt", "x")]);

        let handle = r.scheduler.enqueue(TransferRequest::upload(
            dir.path().join("a.txt").to_string_lossy().to_string(),
            "/a.txt",
            &ep,
        ));
        let id = handle.id().to_string();
        handle.wait().await.unwrap();

        let mut seen = vec![TransferStatus::Pending];
        while let Ok(e) = rx.try_recv() {
            match e {
                EngineEvent::ItemStarted { item } | EngineEvent::ItemCompleted { item } if item.id == id => {
                    seen.push(item.status)
                }
                _ => {}
            }
        }
        assert_eq!(
            seen,
            vec![TransferStatus::Pending, TransferStatus::Transferring, TransferStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_transfer_times_out_and_evicts_session() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.hang_transfers(true);
        let dir = local_tree(&[("a.txt", "x")]);

        let started = tokio::time::Instant::now();
        let item = r
            .scheduler
            .enqueue(TransferRequest::upload(
                dir.path().join("a.txt").to_string_lossy().to_string(),
                "/a.txt",
                &ep,
            ))
            .wait()
            .await
            .unwrap();

        assert_eq!(item.status, TransferStatus::Error);
        assert_eq!(item.error_code.as_deref(), Some("TRANSFER_TIMEOUT"));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(180) && waited < Duration::from_secs(181));
        assert_eq!(r.pool.stats_for(&ep).await.total_sessions, 0);
        // The registry's own connection is untouched.
        assert!(r.registry.is_connected(&ep.key()));
    }

    #[tokio::test]
    async fn test_collision_skip_and_overwrite() {
        let prompter = ScriptedPrompter::new(vec![
            Some(CollisionChoice::Skip),
            Some(CollisionChoice::Overwrite),
        ]);
        let r = rig_with(SchedulerConfig { max_concurrent: 1, ..SchedulerConfig::default() }, Some(prompter.clone()));
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.put_file("/a.txt", b"old");
        r.factory.put_file("/b.txt", b"old");
        let dir = local_tree(&[("a.txt", "new"), ("b.txt", "new")]);

        let a = r.scheduler.enqueue(TransferRequest::upload(
            dir.path().join("a.txt").to_string_lossy().to_string(),
            "/a.txt",
            &ep,
        ));
        let b = r.scheduler.enqueue(TransferRequest::upload(
            dir.path().join("b.txt").to_string_lossy().to_string(),
            "/b.txt",
            &ep,
        ));
        let a = a.wait().await.unwrap();
        let b = b.wait().await.unwrap();

        assert_eq!(a.error_code.as_deref(), Some("COLLISION_SKIPPED"));
        assert_eq!(b.status, TransferStatus::Completed);
        assert_eq!(r.factory.file("/a.txt").unwrap(), b"old");
        assert_eq!(r.factory.file("/b.txt").unwrap(), b"new");
        assert_eq!(prompter.prompts(), 2);
    }

    #[tokio::test]
    async fn test_overwriting_directory_target_removes_it() {
        let prompter = ScriptedPrompter::new(vec![Some(CollisionChoice::Overwrite)]);
        let r = rig_with(SchedulerConfig::default(), Some(prompter));
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.put_file("/srv/report/old.txt", b"x");
        let dir = local_tree(&[("report", "file now")]);

        let item = r
            .scheduler
            .enqueue(TransferRequest::upload(
                dir.path().join("report").to_string_lossy().to_string(),
                "/srv/report",
                &ep,
            ))
            .wait()
            .await
            .unwrap();
        assert_eq!(item.status, TransferStatus::Completed);
        assert!(!r.factory.exists("/srv/report/old.txt"));
        assert_eq!(r.factory.file("/srv/report").unwrap(), b"file now");
    }

    #[tokio::test]
    async fn test_directory_target_on_protected_path_is_refused() {
        let prompter = ScriptedPrompter::new(vec![Some(CollisionChoice::Overwrite)]);
        let r = rig_with(SchedulerConfig::default(), Some(prompter));
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.put_dir("/etc");
        let dir = local_tree(&[("etc", "x")]);

        let item = r
            .scheduler
            .enqueue(TransferRequest::upload(
                dir.path().join("etc").to_string_lossy().to_string(),
                "/etc",
                &ep,
            ))
            .wait()
            .await
            .unwrap();
        assert_eq!(item.error_code.as_deref(), Some("DANGEROUS_PATH"));
        assert!(r.factory.is_dir("/etc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_and_active_items() {
        let r = rig_with(SchedulerConfig { max_concurrent: 1, ..SchedulerConfig::default() }, None);
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.set_transfer_delay(Duration::from_secs(5));
        let dir = local_tree(&[("a.txt", "x"), ("b.txt", "x"), ("c.txt", "x")]);
        let enqueue = |n: &str| {
            r.scheduler.enqueue(TransferRequest::upload(
                dir.path().join(n).to_string_lossy().to_string(),
                format!("/{}", n),
                &ep,
            ))
        };
        let a = enqueue("a.txt");
        let b = enqueue("b.txt");
        let c = enqueue("c.txt");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(r.scheduler.cancel_item(a.id()));
        assert!(r.scheduler.cancel_item(b.id()));
        assert!(!r.scheduler.cancel_item("missing"));

        for h in [a, b] {
            let item = h.wait().await.unwrap();
            assert_eq!(item.status, TransferStatus::Error);
            assert_eq!(item.error.as_deref(), Some("cancelled by user"));
        }
        assert_eq!(c.wait().await.unwrap().status, TransferStatus::Completed);
        // The cancelled active item stays failed after its upload finished.
        let all = r.scheduler.list();
        assert_eq!(all.iter().filter(|i| i.status == TransferStatus::Error).count(), 2);
        assert_eq!(r.scheduler.clear_completed(), 3);
        assert!(r.scheduler.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_spares_running_items() {
        let r = rig_with(SchedulerConfig { max_concurrent: 2, ..SchedulerConfig::default() }, None);
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.set_transfer_delay(Duration::from_secs(1));
        let files: Vec<String> = (0..6).map(|i| format!("f{}.txt", i)).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|n| (n.as_str(), "x")).collect();
        let dir = local_tree(&refs);
        let handles: Vec<TransferHandle> = files
            .iter()
            .map(|n| {
                r.scheduler.enqueue(TransferRequest::upload(
                    dir.path().join(n).to_string_lossy().to_string(),
                    format!("/{}", n),
                    &ep,
                ))
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(r.scheduler.cancel_all(), 4);
        let mut completed = 0;
        for h in handles {
            if h.wait().await.unwrap().status == TransferStatus::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 2);
    }

    #[tokio::test]
    async fn test_queue_complete_fires_once_idle() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        let mut rx = r.events.subscribe();
        let dir = local_tree(&[("a.txt", "x"), ("b.txt", "y")]);

        let hs = vec![
            r.scheduler.enqueue(TransferRequest::upload(
                dir.path().join("a.txt").to_string_lossy().to_string(),
                "/a.txt",
                &ep,
            )),
            r.scheduler.enqueue(TransferRequest::upload(
                dir.path().join("b.txt").to_string_lossy().to_string(),
                "/b.txt",
                &ep,
            )),
        ];
        for h in hs {
            h.wait().await.unwrap();
        }
        tokio::task::yield_now().await;

        let mut completes = 0;
        while let Ok(e) = rx.try_recv() {
            if matches!(e, EngineEvent::QueueComplete) {
                completes += 1;
            }
        }
        assert!(completes >= 1);
        assert_eq!(r.scheduler.status().completed, 2);
    }

    #[tokio::test]
    async fn test_upload_directory_with_ignores() {
        let r = rig();
        let mut ep = endpoint("h");
        ep.ignore = vec!["*.tmp".into()];
        let session = r.registry.connect(&ep).await.unwrap();
        let dir = local_tree(&[
            ("a.txt", "a"),
            ("a.tmp", "t"),
            ("b/b1.txt", "b1"),
            ("b/b2.txt", "b2"),
        ]);

        let result = r
            .scheduler
            .upload_directory(&session, dir.path(), "/srv/site", &ep, &SyncOptions::default())
            .await
            .unwrap();

        let mut uploaded = result.uploaded.clone();
        uploaded.sort();
        assert_eq!(uploaded, vec!["a.txt", "b/b1.txt", "b/b2.txt"]);
        assert_eq!(result.skipped, vec!["a.tmp"]);
        assert!(result.failed.is_empty());
        assert_eq!(r.scheduler.status().pending, 0);
        assert_eq!(r.factory.file("/srv/site/b/b2.txt").unwrap(), b"b2");
        assert!(!r.factory.exists("/srv/site/a.tmp"));
    }

    #[tokio::test]
    async fn test_skip_all_covers_whole_directory() {
        let prompter = ScriptedPrompter::new(vec![Some(CollisionChoice::SkipAll)]);
        let r = rig_with(SchedulerConfig::default(), Some(prompter.clone()));
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();

        let names: Vec<String> = (0..50).map(|i| format!("f{:02}.txt", i)).collect();
        for n in &names {
            r.factory.put_file(&format!("/dst/{}", n), b"old");
        }
        let refs: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "new")).collect();
        let dir = local_tree(&refs);

        let result = r
            .scheduler
            .upload_directory(&session, dir.path(), "/dst", &ep, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(prompter.prompts(), 1);
        assert!(result.uploaded.is_empty());
        assert_eq!(result.failed.len(), 50);
        assert!(result.failed.iter().all(|f| f.code == "COLLISION_SKIPPED"));
        assert_eq!(r.factory.file("/dst/f00.txt").unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_each_directory_operation_gets_a_fresh_scope() {
        let prompter = ScriptedPrompter::new(vec![
            Some(CollisionChoice::SkipAll),
            Some(CollisionChoice::OverwriteAll),
        ]);
        let r = rig_with(SchedulerConfig::default(), Some(prompter.clone()));
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();
        r.factory.put_file("/dst/a.txt", b"old");
        r.factory.put_file("/dst/b.txt", b"old");
        let dir = local_tree(&[("a.txt", "new"), ("b.txt", "new")]);

        let first = r
            .scheduler
            .upload_directory(&session, dir.path(), "/dst", &ep, &SyncOptions::default())
            .await
            .unwrap();
        let second = r
            .scheduler
            .upload_directory(&session, dir.path(), "/dst", &ep, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(first.uploaded.len(), 0);
        assert_eq!(second.uploaded.len(), 2);
        assert_eq!(prompter.prompts(), 2);
    }

    #[tokio::test]
    async fn test_upload_directory_deletes_extraneous() {
        let r = rig();
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();
        r.factory.put_file("/site/stale.txt", b"x");
        r.factory.put_file("/site/old/deep.txt", b"x");
        let dir = local_tree(&[("keep.txt", "k")]);

        let result = r
            .scheduler
            .upload_directory(
                &session,
                dir.path(),
                "/site",
                &ep,
                &SyncOptions { delete_extraneous: true },
            )
            .await
            .unwrap();

        let mut deleted = result.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["old", "stale.txt"]);
        assert!(!r.factory.exists("/site/old/deep.txt"));
        assert!(r.factory.exists("/site/keep.txt"));
    }

    #[tokio::test]
    async fn test_download_directory() {
        let r = rig();
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();
        r.factory.put_file("/pub/a.txt", b"a");
        r.factory.put_file("/pub/docs/b.txt", b"b");
        r.factory.put_dir("/pub/empty");
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mirror");

        let result = r
            .scheduler
            .download_directory(&session, "/pub", &target, &ep, &SyncOptions::default())
            .await
            .unwrap();

        let mut downloaded = result.downloaded.clone();
        downloaded.sort();
        assert_eq!(downloaded, vec!["a.txt", "docs/b.txt"]);
        assert_eq!(fs::read(target.join("docs/b.txt")).unwrap(), b"b");
        assert!(target.join("empty").is_dir());
    }

    #[tokio::test]
    async fn test_sync_both_ways_newer_wins() {
        let r = rig();
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();
        let dir = local_tree(&[("local_only.txt", "l"), ("shared.txt", "local")]);

        let far_future = Utc::now() + ChronoDuration::days(365);
        let long_ago = Utc::now() - ChronoDuration::days(365);
        r.factory.put_file_at("/sync/remote_only.txt", b"r", long_ago);
        r.factory.put_file_at("/sync/shared.txt", b"remote", far_future);

        let result = r
            .scheduler
            .sync_both_ways(&session, dir.path(), "/sync", &ep)
            .await
            .unwrap();

        let mut downloaded = result.downloaded.clone();
        downloaded.sort();
        assert_eq!(downloaded, vec!["remote_only.txt", "shared.txt"]);
        assert_eq!(result.uploaded, vec!["local_only.txt"]);
        assert_eq!(fs::read(dir.path().join("shared.txt")).unwrap(), b"remote");
        assert_eq!(r.factory.file("/sync/shared.txt").unwrap(), b"remote");
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_upload_creates_missing_remote_parents() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        let dir = local_tree(&[("a.txt", "payload")]);

        let item = r
            .scheduler
            .enqueue(TransferRequest::upload(
                dir.path().join("a.txt").to_string_lossy().to_string(),
                "/drop/nested/a.txt",
                &ep,
            ))
            .wait()
            .await
            .unwrap();

        assert_eq!(item.status, TransferStatus::Completed);
        assert!(r.factory.is_dir("/drop/nested"));
        assert_eq!(r.factory.file("/drop/nested/a.txt").unwrap(), b"payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_everything_still_completes_queue_once() {
        let r = rig_with(SchedulerConfig { max_concurrent: 1, ..SchedulerConfig::default() }, None);
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        r.factory.set_transfer_delay(Duration::from_secs(5));
        let mut rx = r.events.subscribe();
        let dir = local_tree(&[("a.txt", "x"), ("b.txt", "y")]);
        let a = r.scheduler.enqueue(TransferRequest::upload(
            dir.path().join("a.txt").to_string_lossy().to_string(),
            "/a.txt",
            &ep,
        ));
        let b = r.scheduler.enqueue(TransferRequest::upload(
            dir.path().join("b.txt").to_string_lossy().to_string(),
            "/b.txt",
            &ep,
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(r.scheduler.cancel_item(b.id()));
        assert!(r.scheduler.cancel_item(a.id()));
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let mut completes = 0;
        while let Ok(e) = rx.try_recv() {
            if matches!(e, EngineEvent::QueueComplete) {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
        assert_eq!(r.scheduler.status().failed, 2);
    }

    #[tokio::test]
    async fn test_truncated_source_listing_deletes_nothing() {
        let config = SchedulerConfig {
            traversal: TraversalLimits {
                max_entries: 2,
                ..TraversalLimits::default()
            },
            ..SchedulerConfig::default()
        };
        let r = rig_with(config, None);
        let ep = endpoint("h");
        let session = r.registry.connect(&ep).await.unwrap();
        let names: Vec<String> = (0..12).map(|i| format!("c{}.txt", i)).collect();
        for n in &names {
            r.factory.put_file(&format!("/pub/{}", n), b"same");
        }
        let refs: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "same")).collect();
        let dir = local_tree(&refs);

        let result = r
            .scheduler
            .download_directory(
                &session,
                "/pub",
                dir.path(),
                &ep,
                &SyncOptions { delete_extraneous: true },
            )
            .await
            .unwrap();

        assert!(result.truncated);
        assert!(result.deleted.is_empty());
        assert!(result.failed.iter().any(|f| f.code == "INCOMPLETE_LISTING"));
        for n in &names {
            assert!(dir.path().join(n).exists(), "{} was deleted", n);
        }
    }

    #[tokio::test]
    async fn test_unreadable_and_symlinked_sources_shield_their_subtrees() {
        let entry = |rel: &str, kind: EntryKind| traverse::CandidateEntry {
            relative_path: rel.to_string(),
            kind,
            size: 0,
            modified: None,
        };
        let source = TraversalOutcome {
            entries: vec![entry("locked", EntryKind::Directory), entry("link", EntryKind::Symlink)],
            unreadable: vec![("locked".to_string(), "permission denied".to_string())],
            ..TraversalOutcome::default()
        };
        let destination = TraversalOutcome {
            entries: vec![
                entry("locked", EntryKind::Directory),
                entry("locked/a.txt", EntryKind::File),
                entry("link", EntryKind::Directory),
                entry("link/b.txt", EntryKind::File),
                entry("gone.txt", EntryKind::File),
            ],
            ..TraversalOutcome::default()
        };
        let mut result = SyncResult::default();

        let doomed = extraneous(&mut result, &destination, &source, &IgnoreMatcher::new(&[]));

        assert_eq!(doomed, vec![("gone.txt".to_string(), EntryKind::File)]);
        let mut shielded: Vec<&str> = result.failed.iter().map(|f| f.path.as_str()).collect();
        shielded.sort();
        assert_eq!(shielded, vec!["link", "locked"]);
        assert!(result.failed.iter().all(|f| f.code == "INCOMPLETE_LISTING"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_uploads_share_a_new_remote_directory() {
        let r = rig();
        let ep = endpoint("h");
        r.registry.connect(&ep).await.unwrap();
        let names: Vec<String> = (0..8).map(|i| format!("f{}.bin", i)).collect();
        let refs: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "data")).collect();
        let dir = local_tree(&refs);

        let handles: Vec<TransferHandle> = names
            .iter()
            .map(|n| {
                r.scheduler.enqueue(TransferRequest::upload(
                    dir.path().join(n).to_string_lossy().to_string(),
                    format!("/incoming/batch/{}", n),
                    &ep,
                ))
            })
            .collect();
        for h in handles {
            assert_eq!(h.wait().await.unwrap().status, TransferStatus::Completed);
        }
        assert!(r.factory.is_dir("/incoming/batch"));
    }
}
