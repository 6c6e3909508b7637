//! Remote backend availability with hysteresis.
//!
//! One probe runs on start and then on a fixed interval until disposal.
//! Readers get the last snapshot without any I/O. A failed detection call
//! downgrades availability out-of-band; probes that were already in flight
//! when that happened cannot overwrite the downgrade.

use crate::error::{OfflineError, OfflineResult};
use crate::observability::Metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A single bounded reachability check of the remote backend.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> OfflineResult<()>;
}

/// Availability snapshot. Mutated only by [`HealthMonitor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub available: bool,
    /// When the last probe result (or out-of-band downgrade) was applied.
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Published state plus the ticket of the most recent out-of-band
/// downgrade. Both change under one lock.
#[derive(Default)]
struct Tracked {
    state: HealthState,
    downgraded_at: u64,
}

struct Inner {
    probe: Arc<dyn HealthProbe>,
    probe_timeout: Duration,
    recovery_threshold: u32,
    state: RwLock<Tracked>,
    /// Monotonic ordering of probe starts and downgrades.
    tickets: AtomicU64,
    tx: watch::Sender<bool>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        probe_timeout: Duration,
        recovery_threshold: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                probe,
                probe_timeout,
                recovery_threshold: recovery_threshold.max(1),
                state: RwLock::new(Tracked::default()),
                tickets: AtomicU64::new(1),
                tx,
                metrics,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Last computed availability. Never blocks, never touches the network.
    pub fn is_available(&self) -> bool {
        self.inner.state.read().state.available
    }

    pub fn snapshot(&self) -> HealthState {
        self.inner.state.read().state.clone()
    }

    /// Availability changes. The current value is already marked seen.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Run one bounded probe and apply its result. Returns availability
    /// after the update.
    pub async fn probe(&self) -> bool {
        let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst);
        let result =
            match tokio::time::timeout(self.inner.probe_timeout, self.inner.probe.probe()).await {
                Ok(result) => result,
                Err(_) => Err(OfflineError::Timeout(self.inner.probe_timeout)),
            };

        match result {
            Ok(()) => self.record_success(ticket),
            Err(e) => {
                tracing::debug!(error = %e, "Health probe failed");
                self.record_failure();
            }
        }
        self.is_available()
    }

    /// Downgrade immediately after a failed remote call.
    pub fn mark_unavailable(&self, reason: &OfflineError) {
        let mut tracked = self.inner.state.write();
        let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst);
        tracked.downgraded_at = tracked.downgraded_at.max(ticket);
        tracing::info!(error = %reason, "Remote backend marked unavailable");
        self.apply_failure(&mut tracked.state);
    }

    fn record_success(&self, ticket: u64) {
        let mut tracked = self.inner.state.write();
        if ticket < tracked.downgraded_at {
            // Started before a downgrade; its view of the backend is stale.
            self.inner.metrics.health_probe("stale");
            return;
        }
        self.inner.metrics.health_probe("success");

        let state = &mut tracked.state;
        state.last_checked_at = Some(Utc::now());
        state.consecutive_failures = 0;
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        if !state.available && state.consecutive_successes >= self.inner.recovery_threshold {
            state.available = true;
            tracing::info!(
                successes = state.consecutive_successes,
                "Remote backend available"
            );
        }
        self.publish(state.available);
    }

    fn record_failure(&self) {
        let mut tracked = self.inner.state.write();
        self.apply_failure(&mut tracked.state);
    }

    fn apply_failure(&self, state: &mut HealthState) {
        self.inner.metrics.health_probe("failure");
        if state.available {
            tracing::warn!("Remote backend unavailable");
        }
        state.available = false;
        state.last_checked_at = Some(Utc::now());
        state.consecutive_successes = 0;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        self.publish(false);
    }

    fn publish(&self, available: bool) {
        self.inner.tx.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        });
    }

    /// Start the probe loop: one probe now, then one per `interval`.
    /// Calling it again while running is a no-op.
    pub fn start(&self, interval: Duration) {
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        let cancel = self.inner.cancel.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.probe().await;
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        }));
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn dispose(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Health monitor task failed: {e}");
            }
        }
    }
}
