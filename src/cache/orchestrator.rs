//! Cache orchestrator: resolves every outbound fetch through cache and network
//! according to the strategy of the partition the request belongs to.
//!
//! ## Strategies
//! - **CacheFirst** (models, images): cached entry if present, else network
//!   and store.
//! - **NetworkFirst** (API, JSON data): network and overwrite, else last
//!   cached entry, else offline page (navigations) or the failure.
//! - **StaleWhileRevalidate** (app shell): cached entry immediately plus a
//!   background refresh for next time.
//!
//! Writers to the same key are serialised by a per-key async lock, so a
//! background refresh and a concurrent CacheFirst population cannot lose
//! each other's update. Storage failures never fail a resolve; they are
//! logged and the response is served without persistence.

use super::fetch::{FetchedResource, Fetcher};
use super::identity::{
    classify, CachePartition, PartitionId, ResourceIdentity, ResourceRequest, Strategy,
    VersionTag,
};
use super::storage::{CacheEntry, CacheStorage, EntryMeta, GenerationStatus, PutOutcome};
use crate::control::{AgentEvent, EventBus, Notice};
use crate::error::{OfflineError, OfflineResult};
use crate::observability::Metrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Body of the page synthesized for offline navigations with nothing cached.
const OFFLINE_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>Offline</title></head><body><h1>You are offline</h1>\
<p>Scanning still works with the on-device model. Reconnect to sync your history.</p>\
</body></html>";

// ── Responses ───────────────────────────────────────────────────

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Network,
    Cache,
    /// Offline fallback page (cached or synthesized).
    Offline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

impl ResourceResponse {
    fn from_entry(entry: CacheEntry, source: ResponseSource) -> Self {
        Self {
            status: 200,
            content_type: entry.content_type,
            body: entry.payload,
            source,
        }
    }

    fn from_network(fetched: FetchedResource) -> Self {
        Self {
            status: fetched.status,
            content_type: fetched.content_type,
            body: fetched.body,
            source: ResponseSource::Network,
        }
    }

    fn synthesized_offline() -> Self {
        Self {
            status: 503,
            content_type: Some("text/html; charset=utf-8".into()),
            body: OFFLINE_PAGE.as_bytes().to_vec(),
            source: ResponseSource::Offline,
        }
    }
}

// ── Cache info ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition: PartitionId,
    pub strategy: Strategy,
    pub storage_name: String,
    pub entries: u64,
    pub bytes: u64,
}

/// Snapshot answered to `GET_CACHE_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub generation: VersionTag,
    pub partitions: Vec<PartitionInfo>,
    /// Generations other than the active one still present in storage.
    pub other_generations: Vec<VersionTag>,
}

// ── Per-key locks ───────────────────────────────────────────────

#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, slot: String) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Drop slots nobody holds or waits on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(slot).or_default())
        };
        lock.lock_owned().await
    }
}

// ── Orchestrator ────────────────────────────────────────────────

/// Settings the orchestrator needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub generation: VersionTag,
    pub network_timeout: Duration,
    pub offline_fallback_path: String,
}

struct Inner {
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    generation: RwLock<VersionTag>,
    locks: KeyLocks,
    events: EventBus,
    metrics: Arc<Metrics>,
    network_timeout: Duration,
    offline_fallback_path: String,
    refreshes: Mutex<Vec<JoinHandle<()>>>,
}

/// Sole owner of cache storage. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheOrchestrator {
    inner: Arc<Inner>,
}

impl CacheOrchestrator {
    pub fn new(
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        events: EventBus,
        metrics: Arc<Metrics>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                fetcher,
                generation: RwLock::new(options.generation),
                locks: KeyLocks::default(),
                events,
                metrics,
                network_timeout: options.network_timeout,
                offline_fallback_path: options.offline_fallback_path,
                refreshes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The generation new resolves are served from.
    pub fn generation(&self) -> VersionTag {
        self.inner.generation.read().clone()
    }

    /// Switch the active generation. Called by the lifecycle controller at
    /// activation only.
    pub(crate) fn set_generation(&self, generation: VersionTag) {
        *self.inner.generation.write() = generation;
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.inner.fetcher)
    }

    /// Resolve a request against the active generation.
    pub async fn resolve(&self, request: &ResourceRequest) -> OfflineResult<ResourceResponse> {
        let generation = self.generation();
        self.resolve_in(&generation, request).await
    }

    /// Resolve a request against a specific generation (used by clients
    /// pinned to an older generation during rollover).
    pub async fn resolve_in(
        &self,
        generation: &VersionTag,
        request: &ResourceRequest,
    ) -> OfflineResult<ResourceResponse> {
        if !request.is_cacheable() {
            return self.fetch_with_deadline(request).await.map(ResourceResponse::from_network);
        }

        let partition = CachePartition::new(classify(request), generation.clone());
        let key = request.identity();
        match partition.strategy {
            Strategy::CacheFirst => self.cache_first(&partition, &key, request).await,
            Strategy::NetworkFirst => self.network_first(&partition, &key, request).await,
            Strategy::StaleWhileRevalidate => {
                self.stale_while_revalidate(&partition, &key, request).await
            }
        }
    }

    async fn cache_first(
        &self,
        partition: &CachePartition,
        key: &ResourceIdentity,
        request: &ResourceRequest,
    ) -> OfflineResult<ResourceResponse> {
        if let Some(entry) = self.read(partition, key) {
            self.inner.metrics.cache_lookup(partition.id.as_str(), "hit");
            return Ok(ResourceResponse::from_entry(entry, ResponseSource::Cache));
        }

        let _guard = self.inner.locks.acquire(lock_slot(partition, key)).await;
        // Another caller may have populated the slot while we waited.
        if let Some(entry) = self.read(partition, key) {
            self.inner.metrics.cache_lookup(partition.id.as_str(), "hit");
            return Ok(ResourceResponse::from_entry(entry, ResponseSource::Cache));
        }

        self.inner.metrics.cache_lookup(partition.id.as_str(), "miss");
        match self.fetch_with_deadline(request).await {
            Ok(fetched) => {
                self.write(partition, key, request, &fetched);
                Ok(ResourceResponse::from_network(fetched))
            }
            Err(e) => self.uncached_failure(partition, request, e),
        }
    }

    async fn network_first(
        &self,
        partition: &CachePartition,
        key: &ResourceIdentity,
        request: &ResourceRequest,
    ) -> OfflineResult<ResourceResponse> {
        match self.fetch_with_deadline(request).await {
            Ok(fetched) => {
                let _guard = self.inner.locks.acquire(lock_slot(partition, key)).await;
                self.write(partition, key, request, &fetched);
                self.inner.metrics.cache_lookup(partition.id.as_str(), "network");
                Ok(ResourceResponse::from_network(fetched))
            }
            Err(e) => {
                if let Some(entry) = self.read(partition, key) {
                    tracing::info!(
                        partition = %partition.id,
                        url = %request.url,
                        error = %e,
                        "Network failed, serving cached response"
                    );
                    self.inner.metrics.cache_lookup(partition.id.as_str(), "fallback");
                    return Ok(ResourceResponse::from_entry(entry, ResponseSource::Cache));
                }
                self.uncached_failure(partition, request, e)
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        partition: &CachePartition,
        key: &ResourceIdentity,
        request: &ResourceRequest,
    ) -> OfflineResult<ResourceResponse> {
        if let Some(entry) = self.read(partition, key) {
            self.inner.metrics.cache_lookup(partition.id.as_str(), "hit");
            self.spawn_refresh(partition.clone(), key.clone(), request.clone());
            return Ok(ResourceResponse::from_entry(entry, ResponseSource::Cache));
        }

        let _guard = self.inner.locks.acquire(lock_slot(partition, key)).await;
        self.inner.metrics.cache_lookup(partition.id.as_str(), "miss");
        match self.fetch_with_deadline(request).await {
            Ok(fetched) => {
                self.write(partition, key, request, &fetched);
                Ok(ResourceResponse::from_network(fetched))
            }
            Err(e) => self.uncached_failure(partition, request, e),
        }
    }

    /// Refresh a stale-while-revalidate entry in the background. The caller
    /// already has its response and never waits on this.
    fn spawn_refresh(&self, partition: CachePartition, key: ResourceIdentity, request: ResourceRequest) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = this.inner.locks.acquire(lock_slot(&partition, &key)).await;
            match this.fetch_with_deadline(&request).await {
                Ok(fetched) => this.write(&partition, &key, &request, &fetched),
                Err(e) => tracing::debug!(
                    partition = %partition.id,
                    url = %request.url,
                    error = %e,
                    "Background revalidation failed, keeping cached copy"
                ),
            }
        });

        let mut refreshes = self.inner.refreshes.lock();
        refreshes.retain(|h| !h.is_finished());
        refreshes.push(handle);
    }

    /// Wait for every background refresh started so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.refreshes.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Background refresh task failed: {e}");
            }
        }
    }

    fn uncached_failure(
        &self,
        partition: &CachePartition,
        request: &ResourceRequest,
        error: OfflineError,
    ) -> OfflineResult<ResourceResponse> {
        if request.navigation {
            self.inner.metrics.cache_lookup(partition.id.as_str(), "offline");
            return Ok(self.offline_response(&partition.generation, request));
        }
        self.inner.metrics.cache_lookup(partition.id.as_str(), "error");
        tracing::debug!(
            partition = %partition.id,
            url = %request.url,
            error = %error,
            "Uncached resource failed"
        );
        Err(error)
    }

    /// Cached offline page from the shell partition, else a synthesized one.
    fn offline_response(&self, generation: &VersionTag, request: &ResourceRequest) -> ResourceResponse {
        if let Ok(mut url) = reqwest::Url::parse(&request.url) {
            url.set_path(&self.inner.offline_fallback_path);
            url.set_query(None);
            let fallback = ResourceRequest::get(url.to_string());
            let partition = CachePartition::new(PartitionId::Static, generation.clone());
            if let Some(entry) = self.read(&partition, &fallback.identity()) {
                return ResourceResponse::from_entry(entry, ResponseSource::Offline);
            }
        }
        ResourceResponse::synthesized_offline()
    }

    async fn fetch_with_deadline(&self, request: &ResourceRequest) -> OfflineResult<FetchedResource> {
        let deadline = self.inner.network_timeout;
        match tokio::time::timeout(deadline, self.inner.fetcher.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(OfflineError::Timeout(deadline)),
        }
    }

    /// Read an entry, treating storage errors and digest mismatches as misses.
    fn read(&self, partition: &CachePartition, key: &ResourceIdentity) -> Option<CacheEntry> {
        match self.inner.storage.get(partition, key) {
            Ok(Some(entry)) if entry.is_intact() => Some(entry),
            Ok(Some(entry)) => {
                tracing::warn!(
                    partition = %partition.id,
                    url = %entry.url,
                    "Cached payload does not match its digest, evicting"
                );
                if let Err(e) = self.inner.storage.delete(partition, key) {
                    tracing::warn!("Failed to evict corrupt entry: {e}");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                self.degraded(&e);
                None
            }
        }
    }

    /// Store a network response. Failure is a degraded-mode hint, not an error.
    fn write(
        &self,
        partition: &CachePartition,
        key: &ResourceIdentity,
        request: &ResourceRequest,
        fetched: &FetchedResource,
    ) {
        let entry = CacheEntry::new(
            partition,
            key.clone(),
            request.canonical_url(),
            fetched.content_type.clone(),
            fetched.body.clone(),
        );
        match self.inner.storage.put(&entry) {
            Ok(PutOutcome::Replaced) => {
                tracing::debug!(partition = %partition.id, url = %entry.url, "Cached resource replaced");
                self.inner.events.emit(AgentEvent::CacheUpdated {
                    partition: partition.id,
                    key: key.clone(),
                    url: entry.url,
                });
            }
            Ok(PutOutcome::Inserted | PutOutcome::Unchanged) => {}
            Err(e) => self.degraded(&e),
        }
    }

    fn degraded(&self, error: &OfflineError) {
        tracing::warn!(error = %error, "Cache storage failing, continuing without persistence");
        self.inner.events.emit(AgentEvent::Notice(Notice::CacheDegraded {
            reason: error.to_string(),
        }));
    }

    // ── Lifecycle / control support ─────────────────────────────

    /// Populate one resource into `generation` during install. Returns the
    /// partition it landed in.
    pub async fn precache(&self, generation: &VersionTag, url: &str) -> OfflineResult<PartitionId> {
        let request = ResourceRequest::get(url);
        let partition = CachePartition::new(classify(&request), generation.clone());
        let key = request.identity();
        let fetched = self.fetch_with_deadline(&request).await?;
        let _guard = self.inner.locks.acquire(lock_slot(&partition, &key)).await;
        let entry = CacheEntry::new(
            &partition,
            key,
            request.canonical_url(),
            fetched.content_type,
            fetched.body,
        );
        self.inner.storage.put(&entry)?;
        Ok(partition.id)
    }

    /// Remove entries of `partition` (active generation) matching `predicate`.
    pub fn evict<F>(&self, partition: PartitionId, predicate: F) -> OfflineResult<usize>
    where
        F: Fn(&EntryMeta) -> bool,
    {
        let generation = self.generation();
        self.evict_in(&generation, partition, predicate)
    }

    pub fn evict_in<F>(
        &self,
        generation: &VersionTag,
        partition: PartitionId,
        predicate: F,
    ) -> OfflineResult<usize>
    where
        F: Fn(&EntryMeta) -> bool,
    {
        let partition = CachePartition::new(partition, generation.clone());
        let removed = self.inner.storage.evict_where(&partition, predicate)?;
        if removed > 0 {
            tracing::info!(partition = %partition.storage_name(), removed, "Evicted cache entries");
        }
        Ok(removed)
    }

    /// Clear one partition of the active generation, or every partition.
    pub fn clear(&self, partition: Option<PartitionId>) -> OfflineResult<usize> {
        let generation = self.generation();
        let targets: Vec<PartitionId> = match partition {
            Some(p) => vec![p],
            None => PartitionId::ALL.to_vec(),
        };
        let mut removed = 0;
        for id in targets {
            removed += self
                .inner
                .storage
                .clear_partition(&CachePartition::new(id, generation.clone()))?;
        }
        tracing::info!(generation = %generation, removed, "Cleared cache");
        Ok(removed)
    }

    /// Every generation present in storage.
    pub fn stored_generations(&self) -> OfflineResult<Vec<VersionTag>> {
        self.inner.storage.generations()
    }

    pub fn generation_status(&self, generation: &VersionTag) -> OfflineResult<Option<GenerationStatus>> {
        self.inner.storage.generation_status(generation)
    }

    /// The generation recorded as active by a previous run.
    pub fn persisted_active(&self) -> OfflineResult<Option<VersionTag>> {
        self.inner.storage.active_generation()
    }

    pub(crate) fn mark_installed(&self, generation: &VersionTag) -> OfflineResult<()> {
        self.inner.storage.mark_installed(generation)
    }

    pub(crate) fn mark_active(&self, generation: &VersionTag) -> OfflineResult<()> {
        self.inner.storage.mark_active(generation)
    }

    /// Delete every stored generation not in `keep`. Returns removed entries.
    pub fn delete_generations_except(&self, keep: &[VersionTag]) -> OfflineResult<usize> {
        let mut removed = 0;
        for generation in self.inner.storage.generations()? {
            if keep.contains(&generation) {
                continue;
            }
            let n = self.inner.storage.delete_generation(&generation)?;
            tracing::info!(generation = %generation, removed = n, "Deleted stale cache generation");
            removed += n;
        }
        Ok(removed)
    }

    pub fn cache_info(&self) -> OfflineResult<CacheInfo> {
        let generation = self.generation();
        let mut partitions = Vec::with_capacity(PartitionId::ALL.len());
        for id in PartitionId::ALL {
            let partition = CachePartition::new(id, generation.clone());
            let stats = self.inner.storage.stats(&partition)?;
            partitions.push(PartitionInfo {
                partition: id,
                strategy: partition.strategy,
                storage_name: partition.storage_name(),
                entries: stats.entries,
                bytes: stats.bytes,
            });
        }
        let other_generations = self
            .inner
            .storage
            .generations()?
            .into_iter()
            .filter(|g| *g != generation)
            .collect();
        Ok(CacheInfo {
            generation,
            partitions,
            other_generations,
        })
    }
}

fn lock_slot(partition: &CachePartition, key: &ResourceIdentity) -> String {
    format!("{}/{}", partition.storage_name(), key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// In-process fetcher with an on/off switch and a call counter.
    struct FakeFetcher {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        online: AtomicBool,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeFetcher {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn serve(&self, url: &str, body: &[u8]) {
            self.bodies.lock().insert(url.to_string(), body.to_vec());
        }

        fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, request: &ResourceRequest) -> OfflineResult<FetchedResource> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if !self.online.load(Ordering::SeqCst) {
                return Err(OfflineError::NetworkUnavailable("offline".into()));
            }
            match self.bodies.lock().get(&request.url) {
                Some(body) => Ok(FetchedResource {
                    status: 200,
                    content_type: Some("text/plain".into()),
                    body: body.clone(),
                }),
                None => Err(OfflineError::BackendRejected { status: 404 }),
            }
        }

        async fn verify(&self, _url: &str) -> OfflineResult<()> {
            Ok(())
        }
    }

    fn options(timeout: Duration) -> OrchestratorOptions {
        OrchestratorOptions {
            generation: VersionTag::new("v1"),
            network_timeout: timeout,
            offline_fallback_path: "/offline.html".into(),
        }
    }

    fn orchestrator(fetcher: Arc<dyn Fetcher>) -> (CacheOrchestrator, EventBus) {
        let events = EventBus::new();
        let orch = CacheOrchestrator::new(
            CacheStorage::open_in_memory().unwrap(),
            fetcher,
            events.clone(),
            Arc::new(Metrics::new().unwrap()),
            options(Duration::from_secs(2)),
        );
        (orch, events)
    }

    #[tokio::test]
    async fn cache_first_hits_network_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/waste.onnx"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"weights".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let (orch, _) = orchestrator(Arc::new(super::super::fetch::HttpFetcher::new(
            Duration::from_secs(2),
        )));
        let req = ResourceRequest::get(format!("{}/models/waste.onnx", server.uri()));

        let first = orch.resolve(&req).await.unwrap();
        assert_eq!(first.source, ResponseSource::Network);
        let second = orch.resolve(&req).await.unwrap();
        assert_eq!(second.source, ResponseSource::Cache);
        assert_eq!(second.body, b"weights");
    }

    #[tokio::test]
    async fn concurrent_cache_first_misses_fetch_once() {
        let fetcher = FakeFetcher::with_delay(Duration::from_millis(100));
        fetcher.serve("https://app.example/img/bottle.png", b"png");
        let (orch, _) = orchestrator(fetcher.clone());
        let req = ResourceRequest::get("https://app.example/img/bottle.png");

        let (a, b) = tokio::join!(orch.resolve(&req), orch.resolve(&req));
        assert_eq!(a.unwrap().body, b"png");
        assert_eq!(b.unwrap().body, b"png");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn network_first_falls_back_to_cache_offline() {
        let fetcher = FakeFetcher::new();
        fetcher.serve("https://app.example/api/categories", b"[1,2]");
        let (orch, _) = orchestrator(fetcher.clone());
        let req = ResourceRequest::get("https://app.example/api/categories");

        assert_eq!(orch.resolve(&req).await.unwrap().source, ResponseSource::Network);

        fetcher.set_online(false);
        let offline = orch.resolve(&req).await.unwrap();
        assert_eq!(offline.source, ResponseSource::Cache);
        assert_eq!(offline.body, b"[1,2]");
    }

    #[tokio::test]
    async fn network_first_without_cache_surfaces_error() {
        let fetcher = FakeFetcher::new();
        fetcher.set_online(false);
        let (orch, _) = orchestrator(fetcher);
        let err = orch
            .resolve(&ResourceRequest::get("https://app.example/api/nothing"))
            .await
            .unwrap_err();
        assert!(err.is_recoverable_network());
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_cache_and_refreshes() {
        let fetcher = FakeFetcher::new();
        fetcher.serve("https://app.example/assets/app.js", b"v1");
        let (orch, events) = orchestrator(fetcher.clone());
        let mut rx = events.subscribe();
        let req = ResourceRequest::get("https://app.example/assets/app.js");

        assert_eq!(orch.resolve(&req).await.unwrap().source, ResponseSource::Network);

        fetcher.serve("https://app.example/assets/app.js", b"v2");
        let stale = orch.resolve(&req).await.unwrap();
        assert_eq!(stale.source, ResponseSource::Cache);
        assert_eq!(stale.body, b"v1");

        orch.settle().await;
        let fresh = orch.resolve(&req).await.unwrap();
        assert_eq!(fresh.body, b"v2");
        orch.settle().await;

        match rx.try_recv().unwrap() {
            AgentEvent::CacheUpdated { partition, key, .. } => {
                assert_eq!(partition, PartitionId::Static);
                assert_eq!(key, req.identity());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_while_revalidate_offline_serves_cache() {
        let fetcher = FakeFetcher::new();
        fetcher.serve("https://app.example/index.html", b"<html>");
        let (orch, events) = orchestrator(fetcher.clone());
        let mut rx = events.subscribe();
        let req = ResourceRequest::get("https://app.example/index.html");
        orch.resolve(&req).await.unwrap();

        fetcher.set_online(false);
        let res = orch.resolve(&req).await.unwrap();
        orch.settle().await;
        assert_eq!(res.source, ResponseSource::Cache);
        assert_eq!(res.body, b"<html>");
        assert!(rx.try_recv().is_err(), "failed refresh must not emit events");
    }

    #[tokio::test]
    async fn offline_navigation_gets_fallback_page() {
        let fetcher = FakeFetcher::new();
        fetcher.set_online(false);
        let (orch, _) = orchestrator(fetcher.clone());

        let res = orch
            .resolve(&ResourceRequest::navigate("https://app.example/history"))
            .await
            .unwrap();
        assert_eq!(res.status, 503);
        assert_eq!(res.source, ResponseSource::Offline);

        fetcher.set_online(true);
        fetcher.serve("https://app.example/offline.html", b"cached offline page");
        orch.precache(&orch.generation(), "https://app.example/offline.html")
            .await
            .unwrap();
        fetcher.set_online(false);

        let res = orch
            .resolve(&ResourceRequest::navigate("https://app.example/history?tab=2"))
            .await
            .unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.source, ResponseSource::Offline);
        assert_eq!(res.body, b"cached offline page");
    }

    #[tokio::test]
    async fn non_get_passes_through_uncached() {
        let fetcher = FakeFetcher::new();
        fetcher.serve("https://app.example/api/feedback", b"ok");
        let (orch, _) = orchestrator(fetcher.clone());
        let req = ResourceRequest::post("https://app.example/api/feedback", b"{}".to_vec());

        orch.resolve(&req).await.unwrap();
        orch.resolve(&req).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        let info = orch.cache_info().unwrap();
        assert!(info.partitions.iter().all(|p| p.entries == 0));
    }

    #[tokio::test]
    async fn slow_network_is_timeout() {
        let fetcher = FakeFetcher::with_delay(Duration::from_millis(500));
        fetcher.serve("https://app.example/img/a.png", b"x");
        let events = EventBus::new();
        let orch = CacheOrchestrator::new(
            CacheStorage::open_in_memory().unwrap(),
            fetcher,
            events,
            Arc::new(Metrics::new().unwrap()),
            options(Duration::from_millis(50)),
        );
        let err = orch
            .resolve(&ResourceRequest::get("https://app.example/img/a.png"))
            .await
            .unwrap_err();
        assert_eq!(err, OfflineError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("cache.db");
        let req = ResourceRequest::get("https://app.example/img/can.png");
        {
            let storage = CacheStorage::open(&db).unwrap();
            let partition = CachePartition::new(PartitionId::Images, VersionTag::new("v1"));
            let mut entry =
                CacheEntry::new(&partition, req.identity(), req.url.clone(), None, b"good".to_vec());
            entry.payload = b"flipped".to_vec();
            storage.put(&entry).unwrap();
        }

        let fetcher = FakeFetcher::new();
        fetcher.serve(&req.url, b"fresh");
        let orch = CacheOrchestrator::new(
            CacheStorage::open(&db).unwrap(),
            fetcher.clone(),
            EventBus::new(),
            Arc::new(Metrics::new().unwrap()),
            options(Duration::from_secs(2)),
        );

        let res = orch.resolve(&req).await.unwrap();
        assert_eq!(res.source, ResponseSource::Network);
        assert_eq!(res.body, b"fresh");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn evict_clear_and_info() {
        let fetcher = FakeFetcher::new();
        fetcher.serve("https://app.example/img/big.png", &[0u8; 64]);
        fetcher.serve("https://app.example/img/small.png", &[0u8; 4]);
        fetcher.serve("https://app.example/api/stats", b"{}");
        let (orch, _) = orchestrator(fetcher);
        for url in [
            "https://app.example/img/big.png",
            "https://app.example/img/small.png",
            "https://app.example/api/stats",
        ] {
            orch.resolve(&ResourceRequest::get(url)).await.unwrap();
        }

        assert_eq!(orch.evict(PartitionId::Images, |m| m.size_bytes > 10).unwrap(), 1);

        let info = orch.cache_info().unwrap();
        assert_eq!(info.generation, VersionTag::new("v1"));
        let images = info
            .partitions
            .iter()
            .find(|p| p.partition == PartitionId::Images)
            .unwrap();
        assert_eq!(images.entries, 1);
        assert_eq!(images.bytes, 4);
        assert_eq!(images.storage_name, "ecoscan-images-v1");

        assert_eq!(orch.clear(Some(PartitionId::Api)).unwrap(), 1);
        assert_eq!(orch.clear(None).unwrap(), 1);
        assert!(orch.cache_info().unwrap().partitions.iter().all(|p| p.entries == 0));
    }

    #[tokio::test]
    async fn generations_are_dropped_except_kept() {
        let fetcher = FakeFetcher::new();
        fetcher.serve("https://app.example/index.html", b"x");
        let (orch, _) = orchestrator(fetcher);
        orch.precache(&VersionTag::new("v1"), "https://app.example/index.html")
            .await
            .unwrap();
        orch.precache(&VersionTag::new("v2"), "https://app.example/index.html")
            .await
            .unwrap();

        orch.set_generation(VersionTag::new("v2"));
        assert_eq!(
            orch.cache_info().unwrap().other_generations,
            vec![VersionTag::new("v1")]
        );
        assert_eq!(orch.delete_generations_except(&[VersionTag::new("v2")]).unwrap(), 1);
        assert_eq!(orch.stored_generations().unwrap(), vec![VersionTag::new("v2")]);
    }
}
