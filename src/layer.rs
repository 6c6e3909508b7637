//! The assembled offline layer: every component constructed from one config,
//! with an explicit start and an explicit teardown.

use crate::cache::{
    CacheOrchestrator, CacheStorage, HttpFetcher, OrchestratorOptions, ResourceRequest,
    ResourceResponse, VersionTag,
};
use crate::config::Config;
use crate::control::{command_channel, serve_commands, CommandEnvelope, ControlHandle, EventBus};
use crate::detect::{
    image, load_weights, CategoryTable, DetectionOutcome, DetectionRequest, DetectionRouter,
    FeedbackRequest, LocalEngine, RemoteBackend,
};
use crate::error::{OfflineError, OfflineResult};
use crate::health::HealthMonitor;
use crate::lifecycle::{InstallReport, LifecycleController};
use crate::observability::Metrics;
use crate::sync::{spawn_flush_loop, FlushReport, OfflineSyncQueue, SyncKind};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a side-effect report was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Delivered to the backend immediately.
    Sent,
    /// Persisted in the sync queue for later delivery.
    Queued { task_id: String },
}

pub struct OfflineLayer {
    config: Config,
    events: EventBus,
    metrics: Arc<Metrics>,
    cache: CacheOrchestrator,
    lifecycle: LifecycleController,
    health: HealthMonitor,
    remote: Arc<RemoteBackend>,
    router: DetectionRouter,
    sync: Arc<OfflineSyncQueue>,
    control: ControlHandle,
    commands: Mutex<Option<mpsc::Receiver<CommandEnvelope>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineLayer {
    /// Construct every component. No background task runs until [`start`].
    ///
    /// [`start`]: OfflineLayer::start
    pub fn open(config: Config, local: Arc<dyn LocalEngine>) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

        let storage = match CacheStorage::open(&config.cache_db_path()) {
            Ok(storage) => storage,
            Err(e) => {
                tracing::warn!(error = %e, "Cache DB unavailable, caching in memory only");
                CacheStorage::open_in_memory()?
            }
        };
        // Serve what the previous run left active; the configured version
        // only takes over once it is installed.
        let generation = match storage.active_generation() {
            Ok(Some(active)) => active,
            Ok(None) => VersionTag::new(config.version.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read active generation");
                VersionTag::new(config.version.clone())
            }
        };
        let cache = CacheOrchestrator::new(
            storage,
            Arc::new(HttpFetcher::new(config.cache.network_timeout())),
            events.clone(),
            metrics.clone(),
            OrchestratorOptions {
                generation,
                network_timeout: config.cache.network_timeout(),
                offline_fallback_path: config.cache.offline_fallback_path.clone(),
            },
        );
        let lifecycle = LifecycleController::new(cache.clone(), events.clone());
        if let Err(e) = lifecycle.restore() {
            tracing::warn!(error = %e, "Failed to restore active cache generation");
        }

        let remote = Arc::new(RemoteBackend::new(
            &config.backend.base_url,
            config.backend.request_timeout(),
            config.backend.probe_timeout(),
        ));
        let health = HealthMonitor::new(
            remote.clone(),
            config.backend.probe_timeout(),
            config.backend.recovery_threshold,
            metrics.clone(),
        );
        let router = DetectionRouter::new(
            health.clone(),
            remote.clone(),
            local,
            CategoryTable::default(),
            events.clone(),
            metrics.clone(),
            config.backend.request_timeout(),
            config.detection.max_image_side,
        );

        let sync = match OfflineSyncQueue::open(
            &config.sync_db_path(),
            config.sync.clone(),
            events.clone(),
            metrics.clone(),
        ) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::warn!(error = %e, "Sync DB unavailable, queueing in memory only");
                OfflineSyncQueue::open_in_memory(config.sync.clone(), events.clone(), metrics.clone())?
            }
        };

        let (control, commands) = command_channel();
        Ok(Self {
            config,
            events,
            metrics,
            cache,
            lifecycle,
            health,
            remote,
            router,
            sync: Arc::new(sync),
            control,
            commands: Mutex::new(Some(commands)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the health monitor, the sync flush loop and the control loop.
    pub fn start(&self) {
        self.health.start(self.config.backend.probe_interval());

        let mut tasks = self.tasks.lock();
        tasks.push(spawn_flush_loop(
            self.sync.clone(),
            self.remote.clone(),
            self.health.subscribe(),
            self.config.sync.flush_interval(),
            self.cancel.clone(),
        ));
        if let Some(commands) = self.commands.lock().take() {
            tasks.push(serve_commands(
                commands,
                Arc::new(self.lifecycle.clone()),
                self.cancel.clone(),
            ));
        }
        tracing::info!(
            version = %self.config.version,
            backend = %self.config.backend.base_url,
            "Offline layer started"
        );
    }

    /// Make the configured generation active: adopt it if a previous run
    /// finished installing it, otherwise install it from the precache
    /// manifest.
    pub async fn ensure_installed(&self) -> Result<Option<InstallReport>> {
        let version = VersionTag::new(self.config.version.clone());
        if self.lifecycle.active_version().as_ref() == Some(&version) {
            return Ok(None);
        }
        if self.lifecycle.resume(&version)? {
            return Ok(None);
        }
        let report = self
            .lifecycle
            .install(version, &self.config.cache.precache)
            .await?;
        Ok(Some(report))
    }

    /// Fetch the configured model weights through the cache and load them
    /// into the local engine. No-op without `detection.model_url`.
    pub async fn load_local_model(&self) -> OfflineResult<bool> {
        let Some(url) = &self.config.detection.model_url else {
            return Ok(false);
        };
        load_weights(self.router.local_engine().as_ref(), &self.cache, url).await?;
        Ok(self.router.local_engine().is_loaded())
    }

    pub async fn detect(&self, request: &DetectionRequest) -> DetectionOutcome {
        self.router.detect(request).await
    }

    /// Detect from base64 (optionally data-URL) image data using the
    /// configured threshold and model version.
    pub async fn detect_image_data(&self, image_data: &str) -> OfflineResult<DetectionOutcome> {
        let bytes = image::decode_image_data(image_data)?;
        Ok(self.detect(&self.request_for(bytes)).await)
    }

    pub fn request_for(&self, image: Vec<u8>) -> DetectionRequest {
        DetectionRequest::new(
            image,
            self.config.detection.confidence_threshold,
            self.config.detection.model_version.clone(),
        )
    }

    pub async fn resolve(&self, request: &ResourceRequest) -> OfflineResult<ResourceResponse> {
        self.cache.resolve(request).await
    }

    /// Send a side effect now if the backend is available, otherwise (or if
    /// sending fails) persist it for the next flush.
    pub async fn report(&self, kind: SyncKind, payload: serde_json::Value) -> OfflineResult<ReportOutcome> {
        if self.health.is_available() {
            match self.remote.post_json(kind.endpoint(), &payload).await {
                Ok(()) => {
                    self.metrics.sync_task("sent");
                    return Ok(ReportOutcome::Sent);
                }
                Err(e) => {
                    tracing::info!(kind = kind.as_str(), error = %e, "Direct report failed, queueing");
                    if e.is_unreachable() {
                        self.health.mark_unavailable(&e);
                    }
                }
            }
        }
        let task = self.sync.enqueue(kind, payload)?;
        Ok(ReportOutcome::Queued { task_id: task.id })
    }

    pub async fn submit_feedback(&self, feedback: &FeedbackRequest) -> OfflineResult<ReportOutcome> {
        let payload = serde_json::to_value(feedback)
            .map_err(|e| OfflineError::MalformedPayload(e.to_string()))?;
        self.report(SyncKind::Feedback, payload).await
    }

    pub async fn flush_sync(&self, force: bool) -> OfflineResult<FlushReport> {
        self.sync.flush(self.remote.as_ref(), force).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn cache(&self) -> &CacheOrchestrator {
        &self.cache
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn sync_queue(&self) -> &OfflineSyncQueue {
        &self.sync
    }

    /// Stop every background task and wait for in-flight cache refreshes.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.health.dispose().await;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task failed during shutdown: {e}");
            }
        }
        self.cache.settle().await;
        tracing::info!("Offline layer stopped");
    }
}
