//! High-level orchestrator: owns the registry, the pool and the scheduler
//! and exposes the operations callers (UI commands, watchers) delegate to.

use crate::xfer::collision::{CollisionPrompter, CollisionResolver};
use crate::xfer::error::XferResult;
use crate::xfer::events::{EngineEvent, EventBus};
use crate::xfer::pool::ConnectionPool;
use crate::xfer::registry::ConnectionRegistry;
use crate::xfer::scheduler::{TransferHandle, TransferScheduler};
use crate::xfer::session::{CredentialSource, RemoteSession, SessionConnector, SessionFactory};
use crate::xfer::types::*;
use log::info;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct TransferEngine {
    registry: Arc<ConnectionRegistry>,
    pool: Arc<ConnectionPool>,
    scheduler: Arc<TransferScheduler>,
    events: EventBus,
}

impl TransferEngine {
    /// Wire up the engine and spawn the pool maintenance task; call from
    /// within a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn SessionFactory>,
        credentials: Option<Arc<dyn CredentialSource>>,
        prompter: Option<Arc<dyn CollisionPrompter>>,
    ) -> Self {
        let events = EventBus::new();
        let connector = Arc::new(SessionConnector::new(factory, credentials));
        let pool = Arc::new(ConnectionPool::new(connector.clone(), config.pool));
        let registry =
            ConnectionRegistry::new(connector, pool.clone(), config.reconnect, events.clone());
        let scheduler = TransferScheduler::new(
            registry.clone(),
            pool.clone(),
            config.scheduler,
            events.clone(),
            Arc::new(CollisionResolver::new(prompter)),
        );
        pool.start_maintenance();
        info!("Transfer engine started");
        Self {
            registry,
            pool,
            scheduler,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler> {
        &self.scheduler
    }

    // ─── Connections ─────────────────────────────────────────────────

    pub async fn connect(&self, config: &EndpointConfig) -> XferResult<Arc<dyn RemoteSession>> {
        self.registry.connect(config).await
    }

    pub async fn ensure_connection(
        &self,
        config: &EndpointConfig,
    ) -> XferResult<Arc<dyn RemoteSession>> {
        self.registry.ensure_connection(config).await
    }

    /// `None` disconnects every endpoint.
    pub async fn disconnect(&self, config: Option<&EndpointConfig>) {
        self.registry.disconnect(config).await
    }

    pub fn get_connection(&self, config: &EndpointConfig) -> Option<Arc<dyn RemoteSession>> {
        self.registry.get_connection(config)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.registry.list_connections()
    }

    pub fn primary(&self) -> Option<String> {
        self.registry.primary()
    }

    pub fn set_primary(&self, config: &EndpointConfig) -> XferResult<()> {
        self.registry.set_primary(config)
    }

    pub async fn get_pooled_connection(
        &self,
        config: &EndpointConfig,
    ) -> XferResult<Arc<dyn RemoteSession>> {
        self.pool.acquire(config, None).await
    }

    pub async fn release_pooled_connection(
        &self,
        config: &EndpointConfig,
        session: &Arc<dyn RemoteSession>,
    ) {
        self.pool.release(config, session).await
    }

    pub async fn pool_stats(&self) -> HashMap<String, PoolStats> {
        self.pool.stats().await
    }

    // ─── Transfers ───────────────────────────────────────────────────

    pub fn upload_file(
        &self,
        local_path: &str,
        remote_path: &str,
        config: &EndpointConfig,
        metadata: Option<CollisionMetadata>,
    ) -> TransferHandle {
        let mut request = TransferRequest::upload(local_path, remote_path, config);
        request.metadata = metadata;
        self.scheduler.enqueue(request)
    }

    pub fn download_file(
        &self,
        remote_path: &str,
        local_path: &str,
        config: &EndpointConfig,
        metadata: Option<CollisionMetadata>,
    ) -> TransferHandle {
        let mut request = TransferRequest::download(remote_path, local_path, config);
        request.metadata = metadata;
        self.scheduler.enqueue(request)
    }

    pub fn enqueue(&self, request: TransferRequest) -> TransferHandle {
        self.scheduler.enqueue(request)
    }

    pub async fn upload_directory(
        &self,
        session: &Arc<dyn RemoteSession>,
        local_root: &Path,
        remote_root: &str,
        config: &EndpointConfig,
        options: &SyncOptions,
    ) -> XferResult<SyncResult> {
        self.scheduler
            .upload_directory(session, local_root, remote_root, config, options)
            .await
    }

    pub async fn download_directory(
        &self,
        session: &Arc<dyn RemoteSession>,
        remote_root: &str,
        local_root: &Path,
        config: &EndpointConfig,
        options: &SyncOptions,
    ) -> XferResult<SyncResult> {
        self.scheduler
            .download_directory(session, remote_root, local_root, config, options)
            .await
    }

    pub async fn sync_both_ways(
        &self,
        session: &Arc<dyn RemoteSession>,
        local_root: &Path,
        remote_root: &str,
        config: &EndpointConfig,
    ) -> XferResult<SyncResult> {
        self.scheduler
            .sync_both_ways(session, local_root, remote_root, config)
            .await
    }

    // ─── Queue control ───────────────────────────────────────────────

    pub fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn cancel_item(&self, id: &str) -> bool {
        self.scheduler.cancel_item(id)
    }

    pub fn clear_completed(&self) -> usize {
        self.scheduler.clear_completed()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.scheduler.status()
    }

    pub fn transfers(&self) -> Vec<TransferItem> {
        self.scheduler.list()
    }

    pub fn transfer(&self, id: &str) -> Option<TransferItem> {
        self.scheduler.get(id)
    }

    /// Reset remembered "overwrite all" / "skip all" answers for single-file
    /// transfers.
    pub fn reset_collision_policy(&self) {
        self.scheduler.collision_resolver().reset();
    }

    // ─── Teardown ────────────────────────────────────────────────────

    /// Cancel pending work, stop reconnect timers and maintenance, close
    /// every connection and drain every pool.
    pub async fn shutdown(&self) {
        self.scheduler.cancel_all();
        self.registry.shutdown().await;
        self.pool.shutdown().await;
        info!("Transfer engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfer::testing::{endpoint, MockFactory, ScriptedPrompter};
    use std::time::Duration;

    #[tokio::test]
    async fn test_upload_then_download_round_trip_through_engine() {
        let factory = MockFactory::new();
        let engine = TransferEngine::new(EngineConfig::default(), factory.clone(), None, None);
        let ep = endpoint("h");
        engine.connect(&ep).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"payload").unwrap();
        let up = engine
            .upload_file(&src.to_string_lossy(), "/in.txt", &ep, None)
            .wait()
            .await
            .unwrap();
        assert_eq!(up.status, TransferStatus::Completed);

        let dst = dir.path().join("dst.txt");
        let down = engine
            .download_file("/in.txt", &dst.to_string_lossy(), &ep, None)
            .wait()
            .await
            .unwrap();
        assert_eq!(down.status, TransferStatus::Completed);
        assert_eq!(std::fs::read(dst).unwrap(), b"payload");
        assert_eq!(engine.queue_status().completed, 2);
        assert_eq!(engine.clear_completed(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_all_persists_for_single_files_until_reset() {
        let factory = MockFactory::new();
        let prompter = ScriptedPrompter::new(vec![
            Some(CollisionChoice::OverwriteAll),
            Some(CollisionChoice::Skip),
        ]);
        let engine =
            TransferEngine::new(EngineConfig::default(), factory.clone(), None, Some(prompter.clone()));
        let ep = endpoint("h");
        engine.connect(&ep).await.unwrap();
        factory.put_file("/a.txt", b"old");
        factory.put_file("/b.txt", b"old");
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("x.txt");
        std::fs::write(&src, b"new").unwrap();
        let local = src.to_string_lossy().to_string();

        engine.upload_file(&local, "/a.txt", &ep, None).wait().await.unwrap();
        engine.upload_file(&local, "/b.txt", &ep, None).wait().await.unwrap();
        assert_eq!(prompter.prompts(), 1);

        engine.reset_collision_policy();
        let item = engine.upload_file(&local, "/a.txt", &ep, None).wait().await.unwrap();
        assert_eq!(item.error_code.as_deref(), Some("COLLISION_SKIPPED"));
        assert_eq!(prompter.prompts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let factory = MockFactory::new();
        let engine = TransferEngine::new(EngineConfig::default(), factory.clone(), None, None);
        let mut rx = engine.subscribe();
        let a = endpoint("a");
        let b = endpoint("b");
        engine.connect(&a).await.unwrap();
        engine.connect(&b).await.unwrap();
        let pooled = engine.get_pooled_connection(&a).await.unwrap();
        engine.release_pooled_connection(&a, &pooled).await;

        engine.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(engine.list_connections().is_empty());
        assert!(engine.pool_stats().await.is_empty());
        assert!(factory.sessions().iter().all(|s| !s.is_connected()));
        assert_eq!(factory.created(), 3);

        let mut manual = 0;
        while let Ok(e) = rx.try_recv() {
            if let EngineEvent::Disconnected { manual: true, .. } = e {
                manual += 1;
            }
        }
        assert_eq!(manual, 2);
    }
}
