//! Delivery of queued sync tasks and the loop that decides when to flush.

use super::queue::{OfflineSyncQueue, SyncTask};
use crate::detect::RemoteBackend;
use crate::error::OfflineResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sends one task to wherever its kind belongs.
#[async_trait]
pub trait SyncDeliverer: Send + Sync {
    async fn deliver(&self, task: &SyncTask) -> OfflineResult<()>;
}

/// Body actually sent for a task: its payload with `task_id` added, so the
/// receiver can spot redeliveries.
pub fn wire_payload(task: &SyncTask) -> serde_json::Value {
    match &task.payload {
        serde_json::Value::Object(map) => {
            let mut map = map.clone();
            map.entry("task_id")
                .or_insert_with(|| serde_json::Value::String(task.id.clone()));
            serde_json::Value::Object(map)
        }
        other => serde_json::json!({ "task_id": task.id, "payload": other }),
    }
}

#[async_trait]
impl SyncDeliverer for RemoteBackend {
    async fn deliver(&self, task: &SyncTask) -> OfflineResult<()> {
        self.post_json(task.kind.endpoint(), &wire_payload(task)).await
    }
}

/// Flush on every `unavailable -> available` edge (forced, ignoring backoff)
/// and on each `interval` tick while the backend is available.
pub fn spawn_flush_loop(
    queue: Arc<OfflineSyncQueue>,
    deliverer: Arc<dyn SyncDeliverer>,
    mut availability: watch::Receiver<bool>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the startup probe has not run yet.
        ticker.tick().await;

        loop {
            let force = tokio::select! {
                () = cancel.cancelled() => break,
                changed = availability.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*availability.borrow_and_update() {
                        continue;
                    }
                    tracing::info!("Connectivity restored, flushing sync queue");
                    true
                }
                _ = ticker.tick() => {
                    if !*availability.borrow() {
                        continue;
                    }
                    false
                }
            };

            if let Err(e) = queue.flush(deliverer.as_ref(), force).await {
                tracing::warn!(error = %e, "Sync flush failed");
            }
        }
        tracing::debug!("Sync flush loop stopped");
    })
}
