//! Generation lifecycle: `Installing → Waiting → Active → Superseded`.
//!
//! Exactly one generation is active at a time. A new generation installs into
//! its own namespace while the active one keeps serving, then waits until no
//! client is pinned to the active generation (or `SKIP_WAITING` arrives).
//! A superseded generation's entries are deleted once its last client lease
//! is released; nothing is deleted before activation.

use crate::cache::{CacheOrchestrator, PartitionId, ResourceRequest, ResourceResponse, VersionTag};
use crate::control::{AgentEvent, Command, CommandHandler, CommandReply, EventBus};
use crate::error::OfflineResult;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Installing,
    Waiting,
    Active,
    Superseded,
}

/// One generation's lifecycle instance.
#[derive(Debug)]
pub struct GenerationLifecycle {
    version: VersionTag,
    state: RwLock<LifecycleState>,
    leases: AtomicUsize,
}

impl GenerationLifecycle {
    fn new(version: VersionTag) -> Arc<Self> {
        Arc::new(Self {
            version,
            state: RwLock::new(LifecycleState::Installing),
            leases: AtomicUsize::new(0),
        })
    }

    pub fn version(&self) -> &VersionTag {
        &self.version
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Clients currently pinned to this generation.
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn transition(&self, to: LifecycleState) {
        let mut state = self.state.write();
        tracing::debug!(version = %self.version, from = ?*state, to = ?to, "Lifecycle transition");
        *state = to;
    }
}

/// What `install` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub version: VersionTag,
    /// URLs stored, with the partition each landed in.
    pub stored: Vec<(String, PartitionId)>,
    /// URLs whose verification fetch failed.
    pub skipped: Vec<String>,
    /// Whether the new generation became active as part of the install.
    pub activated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Activation {
    Activated { version: VersionTag },
    /// Clients are still pinned to the active generation.
    Deferred { pinned: usize },
    NothingWaiting,
}

/// Point-in-time view for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleSnapshot {
    pub active: Option<VersionTag>,
    pub active_leases: usize,
    pub waiting: Option<VersionTag>,
    pub installing: Option<VersionTag>,
    /// Superseded generations still pinned by clients.
    pub superseded: Vec<(VersionTag, usize)>,
}

#[derive(Default)]
struct Generations {
    active: Option<Arc<GenerationLifecycle>>,
    waiting: Option<Arc<GenerationLifecycle>>,
    installing: Option<Arc<GenerationLifecycle>>,
    superseded: Vec<Arc<GenerationLifecycle>>,
    skip_waiting: bool,
}

struct Inner {
    cache: CacheOrchestrator,
    events: EventBus,
    generations: Mutex<Generations>,
}

/// Drives generations through their lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(cache: CacheOrchestrator, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                events,
                generations: Mutex::new(Generations::default()),
            }),
        }
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let g = self.inner.generations.lock();
        LifecycleSnapshot {
            active: g.active.as_ref().map(|l| l.version.clone()),
            active_leases: g.active.as_ref().map_or(0, |l| l.leases()),
            waiting: g.waiting.as_ref().map(|l| l.version.clone()),
            installing: g.installing.as_ref().map(|l| l.version.clone()),
            superseded: g
                .superseded
                .iter()
                .map(|l| (l.version.clone(), l.leases()))
                .collect(),
        }
    }

    pub fn active_version(&self) -> Option<VersionTag> {
        self.inner
            .generations
            .lock()
            .active
            .as_ref()
            .map(|l| l.version.clone())
    }

    /// Adopt `version` as active without installing when a previous run
    /// recorded it as completely installed. Entries alone do not count: they
    /// may come from resolves or from an install that never finished.
    /// Returns whether it was adopted.
    pub fn resume(&self, version: &VersionTag) -> OfflineResult<bool> {
        if self.inner.cache.generation_status(version)?.is_none() {
            return Ok(false);
        }
        let lifecycle = GenerationLifecycle::new(version.clone());
        let mut g = self.inner.generations.lock();
        if g.active.is_some() {
            return Ok(false);
        }
        self.inner.activate_locked(&mut g, lifecycle);
        tracing::info!(version = %version, "Resumed installed cache generation");
        Ok(true)
    }

    /// Adopt the generation a previous run left active, so it keeps serving
    /// until a newer one activates.
    pub fn restore(&self) -> OfflineResult<Option<VersionTag>> {
        let Some(version) = self.inner.cache.persisted_active()? else {
            return Ok(None);
        };
        Ok(self.resume(&version)?.then_some(version))
    }

    /// Populate every partition of `version` from `manifest`. Files whose
    /// verification fetch fails are skipped; any other failure aborts the
    /// install and discards what was stored for `version`.
    pub async fn install(&self, version: VersionTag, manifest: &[String]) -> Result<InstallReport> {
        let lifecycle = {
            let mut g = self.inner.generations.lock();
            if let Some(active) = &g.active {
                if active.version == version {
                    bail!("generation {version} is already active");
                }
            }
            if let Some(installing) = &g.installing {
                bail!("generation {} is already installing", installing.version);
            }
            let lifecycle = GenerationLifecycle::new(version.clone());
            g.installing = Some(lifecycle.clone());
            lifecycle
        };
        tracing::info!(version = %version, files = manifest.len(), "Installing cache generation");

        let populated = match self.populate(&version, manifest).await {
            Ok(files) => self.inner.cache.mark_installed(&version).map(|()| files),
            Err(e) => Err(e),
        };
        match populated {
            Ok((stored, skipped)) => {
                let activated = self.finish_install(lifecycle);
                tracing::info!(
                    version = %version,
                    stored = stored.len(),
                    skipped = skipped.len(),
                    activated,
                    "Cache generation installed"
                );
                Ok(InstallReport {
                    version,
                    stored,
                    skipped,
                    activated,
                })
            }
            Err(e) => {
                self.inner.generations.lock().installing = None;
                if let Err(cleanup) = self.inner.cache.delete_generations_except(&self.keep_set()) {
                    tracing::warn!(error = %cleanup, "Failed to discard partial generation");
                }
                Err(anyhow::Error::new(e).context(format!("install of generation {version} failed")))
            }
        }
    }

    async fn populate(
        &self,
        version: &VersionTag,
        manifest: &[String],
    ) -> OfflineResult<(Vec<(String, PartitionId)>, Vec<String>)> {
        let fetcher = self.inner.cache.fetcher();
        let mut stored = Vec::with_capacity(manifest.len());
        let mut skipped = Vec::new();
        for url in manifest {
            if let Err(e) = fetcher.verify(url).await {
                tracing::warn!(url = %url, error = %e, "Verification failed, omitting from install");
                skipped.push(url.clone());
                continue;
            }
            let partition = self.inner.cache.precache(version, url).await?;
            stored.push((url.clone(), partition));
        }
        Ok((stored, skipped))
    }

    /// Installing → Waiting, then activate if nothing holds the old one.
    fn finish_install(&self, lifecycle: Arc<GenerationLifecycle>) -> bool {
        let mut g = self.inner.generations.lock();
        g.installing = None;
        lifecycle.transition(LifecycleState::Waiting);

        if g.active.is_none() {
            let version = lifecycle.version.clone();
            self.inner.activate_locked(&mut g, lifecycle);
            self.inner.events.emit(AgentEvent::OfflineReady { version });
            return true;
        }

        // A newer waiting generation replaces an older one that never activated.
        if let Some(previous) = g.waiting.replace(lifecycle.clone()) {
            tracing::info!(version = %previous.version, "Discarding never-activated generation");
            previous.transition(LifecycleState::Superseded);
            g.superseded.push(previous);
        }
        self.inner.events.emit(AgentEvent::UpdateAvailable {
            version: lifecycle.version.clone(),
        });
        matches!(
            self.inner.try_activate_locked(&mut g),
            Activation::Activated { .. }
        )
    }

    /// Activate the waiting generation if no client pins the active one.
    pub fn activate(&self) -> Activation {
        let mut g = self.inner.generations.lock();
        self.inner.try_activate_locked(&mut g)
    }

    /// Activate the waiting generation now, even with clients pinned to the
    /// old one. If nothing is waiting yet, the next install activates at once.
    pub fn skip_waiting(&self) -> Activation {
        let mut g = self.inner.generations.lock();
        g.skip_waiting = true;
        self.inner.try_activate_locked(&mut g)
    }

    /// Pin a client to the active generation until the lease drops.
    pub fn connect_client(&self) -> Option<ClientLease> {
        let g = self.inner.generations.lock();
        let lifecycle = g.active.clone()?;
        lifecycle.leases.fetch_add(1, Ordering::SeqCst);
        Some(ClientLease {
            lifecycle,
            controller: self.clone(),
        })
    }

    fn keep_set(&self) -> Vec<VersionTag> {
        let g = self.inner.generations.lock();
        Inner::keep_set(&g)
    }

    fn release(&self) {
        let mut g = self.inner.generations.lock();
        if let Activation::Activated { .. } = self.inner.try_activate_locked(&mut g) {
            return;
        }
        if let Err(e) = self.inner.collect_locked(&mut g) {
            tracing::warn!(error = %e, "Garbage collection after lease release failed");
        }
    }
}

impl Inner {
    fn try_activate_locked(&self, g: &mut Generations) -> Activation {
        let Some(waiting) = g.waiting.clone() else {
            return Activation::NothingWaiting;
        };
        let pinned = g.active.as_ref().map_or(0, |a| a.leases());
        if pinned > 0 && !g.skip_waiting {
            tracing::debug!(version = %waiting.version, pinned, "Activation deferred");
            return Activation::Deferred { pinned };
        }
        g.waiting = None;
        let version = waiting.version.clone();
        self.activate_locked(g, waiting);
        Activation::Activated { version }
    }

    /// Make `lifecycle` the active generation and collect what is unpinned.
    fn activate_locked(&self, g: &mut Generations, lifecycle: Arc<GenerationLifecycle>) {
        if let Some(old) = g.active.take() {
            old.transition(LifecycleState::Superseded);
            g.superseded.push(old);
        }
        lifecycle.transition(LifecycleState::Active);
        if let Err(e) = self.cache.mark_active(&lifecycle.version) {
            tracing::warn!(version = %lifecycle.version, error = %e, "Failed to persist active generation");
        }
        self.cache.set_generation(lifecycle.version.clone());
        let version = lifecycle.version.clone();
        g.active = Some(lifecycle);
        g.skip_waiting = false;
        tracing::info!(version = %version, "Cache generation activated");
        self.events.emit(AgentEvent::Activated { version });

        if let Err(e) = self.collect_locked(g) {
            tracing::warn!(error = %e, "Garbage collection after activation failed");
        }
    }

    fn collect_locked(&self, g: &mut Generations) -> OfflineResult<usize> {
        g.superseded.retain(|l| l.leases() > 0);
        self.cache.delete_generations_except(&Self::keep_set(g))
    }

    fn keep_set(g: &Generations) -> Vec<VersionTag> {
        g.active
            .iter()
            .chain(g.waiting.iter())
            .chain(g.installing.iter())
            .chain(g.superseded.iter())
            .map(|l| l.version.clone())
            .collect()
    }
}

/// A client pinned to one generation. Dropping it releases the pin.
pub struct ClientLease {
    lifecycle: Arc<GenerationLifecycle>,
    controller: LifecycleController,
}

impl ClientLease {
    pub fn generation(&self) -> &VersionTag {
        &self.lifecycle.version
    }

    /// Resolve against the generation this client is pinned to.
    pub async fn resolve(&self, request: &ResourceRequest) -> OfflineResult<ResourceResponse> {
        self.controller
            .inner
            .cache
            .resolve_in(&self.lifecycle.version, request)
            .await
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.lifecycle.leases.fetch_sub(1, Ordering::SeqCst);
        self.controller.release();
    }
}

#[async_trait]
impl CommandHandler for LifecycleController {
    async fn handle(&self, command: Command) -> CommandReply {
        match command {
            Command::SkipWaiting => {
                let outcome = self.skip_waiting();
                tracing::info!(?outcome, "SKIP_WAITING");
                CommandReply::Ack
            }
            Command::ClearCache { partition } => match self.inner.cache.clear(partition) {
                Ok(removed) => CommandReply::Cleared { removed },
                Err(e) => CommandReply::Error {
                    message: e.to_string(),
                },
            },
            Command::GetCacheInfo => match self.inner.cache.cache_info() {
                Ok(info) => CommandReply::CacheInfo(info),
                Err(e) => CommandReply::Error {
                    message: e.to_string(),
                },
            },
        }
    }
}
