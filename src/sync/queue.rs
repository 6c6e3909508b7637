//! Persistent FIFO of side-effect operations produced while offline.
//!
//! Delivery is at-least-once: a task is removed only after its delivery
//! succeeded, so a crash (or a failed delete) between the two means the task
//! is delivered again on the next flush. Receiving endpoints tolerate
//! duplicates; `task_id` travels with every payload.

use super::deliver::SyncDeliverer;
use crate::config::SyncConfig;
use crate::control::{AgentEvent, EventBus, Notice};
use crate::error::{OfflineError, OfflineResult};
use crate::observability::Metrics;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

// ── Task types ──────────────────────────────────────────────────

/// What a task reports, and where it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Feedback,
    Telemetry,
    Metrics,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feedback => "feedback",
            Self::Telemetry => "telemetry",
            Self::Metrics => "metrics",
        }
    }

    /// Backend endpoint the task is POSTed to.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Feedback => "/feedback",
            Self::Telemetry => "/telemetry",
            Self::Metrics => "/metrics",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "feedback" => Self::Feedback,
            "metrics" => Self::Metrics,
            _ => Self::Telemetry,
        }
    }
}

/// A pending side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTask {
    /// Stable id, carried in the delivered payload.
    pub id: String,
    /// Enqueue order; flush processes ascending.
    pub seq: i64,
    pub kind: SyncKind,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Earliest time a non-forced flush retries this task.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Record of a task dropped after exceeding its retry cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropRecord {
    pub task_id: String,
    pub kind: SyncKind,
    pub payload: serde_json::Value,
    pub attempts: u32,
    /// Error of the final attempt.
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub dropped_at: DateTime<Utc>,
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Tasks left alone because their backoff had not elapsed.
    pub deferred: usize,
    /// Tasks still queued after the pass.
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub dropped: usize,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

// ── SQLite queue ────────────────────────────────────────────────

pub struct OfflineSyncQueue {
    conn: Mutex<Connection>,
    policy: SyncConfig,
    events: EventBus,
    metrics: Arc<Metrics>,
    /// One flush at a time; a second caller waits and then sees the result.
    flushing: tokio::sync::Mutex<()>,
}

impl OfflineSyncQueue {
    pub fn open(
        path: &Path,
        policy: SyncConfig,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create sync dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open sync DB: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        Self::from_connection(conn, policy, events, metrics)
    }

    pub fn open_in_memory(policy: SyncConfig, events: EventBus, metrics: Arc<Metrics>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory sync DB")?;
        Self::from_connection(conn, policy, events, metrics)
    }

    fn from_connection(
        conn: Connection,
        policy: SyncConfig,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_tasks (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              TEXT NOT NULL UNIQUE,
                kind            TEXT NOT NULL,
                payload         TEXT NOT NULL,
                enqueued_at     TEXT NOT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT NOT NULL,
                last_error      TEXT
            );
            CREATE TABLE IF NOT EXISTS sync_drops (
                task_id     TEXT PRIMARY KEY,
                kind        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                attempts    INTEGER NOT NULL,
                reason      TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                dropped_at  TEXT NOT NULL
            );",
        )
        .context("Failed to initialise sync queue schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
            events,
            metrics,
            flushing: tokio::sync::Mutex::new(()),
        })
    }

    /// Persist a new task. Returns once it is on disk.
    pub fn enqueue(&self, kind: SyncKind, payload: serde_json::Value) -> OfflineResult<SyncTask> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_tasks (id, kind, payload, enqueued_at, attempts, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?4)",
            params![id, kind.as_str(), payload.to_string(), now.to_rfc3339()],
        )?;
        let seq = conn.last_insert_rowid();
        drop(conn);

        self.metrics.sync_task("enqueued");
        tracing::debug!(task_id = %id, kind = kind.as_str(), seq, "Sync task enqueued");
        Ok(SyncTask {
            id,
            seq,
            kind,
            payload,
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
        })
    }

    /// Every queued task in enqueue order.
    pub fn pending(&self) -> OfflineResult<Vec<SyncTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, id, kind, payload, enqueued_at, attempts, next_attempt_at, last_error
             FROM sync_tasks ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SyncTask {
                seq: row.get(0)?,
                id: row.get(1)?,
                kind: SyncKind::from_str_lossy(&row.get::<_, String>(2)?),
                payload: parse_payload(&row.get::<_, String>(3)?),
                enqueued_at: parse_timestamp(&row.get::<_, String>(4)?),
                attempts: row.get(5)?,
                next_attempt_at: parse_timestamp(&row.get::<_, String>(6)?),
                last_error: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn len(&self) -> OfflineResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM sync_tasks", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn is_empty(&self) -> OfflineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop records, oldest first.
    pub fn drop_records(&self) -> OfflineResult<Vec<DropRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, payload, attempts, reason, enqueued_at, dropped_at
             FROM sync_drops ORDER BY dropped_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DropRecord {
                task_id: row.get(0)?,
                kind: SyncKind::from_str_lossy(&row.get::<_, String>(1)?),
                payload: parse_payload(&row.get::<_, String>(2)?),
                attempts: row.get(3)?,
                reason: row.get(4)?,
                enqueued_at: parse_timestamp(&row.get::<_, String>(5)?),
                dropped_at: parse_timestamp(&row.get::<_, String>(6)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn status(&self) -> OfflineResult<QueueStatus> {
        let pending = self.pending()?;
        let conn = self.conn.lock();
        let dropped: i64 = conn.query_row("SELECT COUNT(*) FROM sync_drops", [], |row| row.get(0))?;
        Ok(QueueStatus {
            pending: pending.len(),
            dropped: usize::try_from(dropped).unwrap_or(0),
            oldest_enqueued_at: pending.first().map(|t| t.enqueued_at),
        })
    }

    /// Attempt delivery of every due task in FIFO order. `force` ignores
    /// backoff. Failed tasks keep their position; later tasks are still tried.
    pub async fn flush(&self, deliverer: &dyn SyncDeliverer, force: bool) -> OfflineResult<FlushReport> {
        let _flushing = self.flushing.lock().await;
        let mut report = FlushReport::default();

        for task in self.pending()? {
            if !force && task.next_attempt_at > Utc::now() {
                report.deferred += 1;
                continue;
            }

            match deliverer.deliver(&task).await {
                Ok(()) => {
                    report.delivered += 1;
                    self.metrics.sync_task("delivered");
                    if let Err(e) = self.remove(&task.id) {
                        // Delivered but still queued: it will be delivered again.
                        tracing::warn!(task_id = %task.id, error = %e, "Failed to remove delivered sync task");
                    }
                }
                Err(e) => {
                    let attempts = task.attempts.saturating_add(1);
                    if attempts >= self.policy.max_attempts {
                        self.drop_task(&task, attempts, &e)?;
                        report.dropped += 1;
                    } else {
                        self.schedule_retry(&task, attempts, &e)?;
                        report.retried += 1;
                    }
                }
            }
        }

        report.remaining = self.len()?;
        tracing::info!(
            delivered = report.delivered,
            retried = report.retried,
            dropped = report.dropped,
            deferred = report.deferred,
            remaining = report.remaining,
            "Sync flush complete"
        );
        self.events.emit(AgentEvent::SyncComplete {
            delivered: report.delivered,
            retried: report.retried,
            dropped: report.dropped,
            remaining: report.remaining,
        });
        Ok(report)
    }

    fn remove(&self, task_id: &str) -> OfflineResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sync_tasks WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    fn schedule_retry(&self, task: &SyncTask, attempts: u32, error: &OfflineError) -> OfflineResult<()> {
        let backoff = self.policy.backoff_for(attempts);
        let next = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sync_tasks SET attempts = ?1, next_attempt_at = ?2, last_error = ?3 WHERE id = ?4",
            params![attempts, next.to_rfc3339(), error.to_string(), task.id],
        )?;
        drop(conn);

        self.metrics.sync_task("retried");
        tracing::debug!(
            task_id = %task.id,
            attempts,
            backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Sync task requeued"
        );
        Ok(())
    }

    fn drop_task(&self, task: &SyncTask, attempts: u32, error: &OfflineError) -> OfflineResult<()> {
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO sync_drops
                    (task_id, kind, payload, attempts, reason, enqueued_at, dropped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id,
                    task.kind.as_str(),
                    task.payload.to_string(),
                    attempts,
                    error.to_string(),
                    task.enqueued_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            tx.execute("DELETE FROM sync_tasks WHERE id = ?1", params![task.id])?;
            tx.commit()?;
        }

        self.metrics.sync_task("dropped");
        let dropped = OfflineError::SyncDropped {
            task_id: task.id.clone(),
            kind: task.kind.as_str().to_string(),
            attempts,
        };
        tracing::warn!(error = %dropped, last_error = %error, "Sync task dropped");
        self.events.emit(AgentEvent::Notice(Notice::SyncDropped {
            task_id: task.id.clone(),
            kind: task.kind.as_str().to_string(),
            attempts,
        }));
        Ok(())
    }
}

fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Records delivered task ids; fails everything while `down`.
    #[derive(Default)]
    struct Recorder {
        down: AtomicBool,
        delivered: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncDeliverer for Recorder {
        async fn deliver(&self, task: &SyncTask) -> OfflineResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(OfflineError::NetworkUnavailable("down".into()));
            }
            self.delivered.lock().push(task.id.clone());
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> SyncConfig {
        SyncConfig {
            max_attempts,
            base_backoff_ms: 60_000,
            ..SyncConfig::default()
        }
    }

    fn queue(max_attempts: u32) -> (OfflineSyncQueue, EventBus) {
        let events = EventBus::new();
        let q = OfflineSyncQueue::open_in_memory(
            policy(max_attempts),
            events.clone(),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap();
        (q, events)
    }

    #[tokio::test]
    async fn flush_delivers_in_enqueue_order() {
        let (q, _) = queue(5);
        let ids: Vec<String> = (0..5)
            .map(|i| q.enqueue(SyncKind::Telemetry, json!({ "n": i })).unwrap().id)
            .collect();

        let recorder = Recorder::default();
        let report = q.flush(&recorder, false).await.unwrap();
        assert_eq!(report.delivered, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(*recorder.delivered.lock(), ids);
        assert!(q.is_empty().unwrap());
    }

    #[tokio::test]
    async fn failed_tasks_back_off_and_keep_position() {
        let (q, _) = queue(5);
        let first = q.enqueue(SyncKind::Feedback, json!({"a": 1})).unwrap();
        let recorder = Recorder::default();
        recorder.down.store(true, Ordering::SeqCst);

        let report = q.flush(&recorder, false).await.unwrap();
        assert_eq!(report.retried, 1);
        let pending = q.pending().unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].next_attempt_at > Utc::now());
        assert!(pending[0].last_error.is_some());

        // Not due yet: a normal flush leaves it alone.
        recorder.down.store(false, Ordering::SeqCst);
        let second = q.enqueue(SyncKind::Feedback, json!({"a": 2})).unwrap();
        let report = q.flush(&recorder, false).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 1);

        let report = q.flush(&recorder, true).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(*recorder.delivered.lock(), vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn retry_cap_drops_with_record_and_notice() {
        let (q, events) = queue(2);
        let mut rx = events.subscribe();
        let task = q.enqueue(SyncKind::Metrics, json!({"latency": 12})).unwrap();
        let recorder = Recorder::default();
        recorder.down.store(true, Ordering::SeqCst);

        q.flush(&recorder, true).await.unwrap();
        let report = q.flush(&recorder, true).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(q.is_empty().unwrap());

        let drops = q.drop_records().unwrap();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].task_id, task.id);
        assert_eq!(drops[0].attempts, 2);
        assert_eq!(drops[0].payload, json!({"latency": 12}));
        assert_eq!(q.status().unwrap().dropped, 1);

        let mut saw_notice = false;
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::Notice(Notice::SyncDropped { task_id, attempts, .. }) = event {
                assert_eq!(task_id, task.id);
                assert_eq!(attempts, 2);
                saw_notice = true;
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test]
    async fn flush_emits_sync_complete() {
        let (q, events) = queue(5);
        let mut rx = events.subscribe();
        q.enqueue(SyncKind::Telemetry, json!({})).unwrap();
        q.flush(&Recorder::default(), false).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            AgentEvent::SyncComplete {
                delivered: 1,
                retried: 0,
                dropped: 0,
                remaining: 0
            }
        );
    }

    #[tokio::test]
    async fn tasks_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sync.db");
        let metrics = Arc::new(Metrics::new().unwrap());
        let id = {
            let q = OfflineSyncQueue::open(&path, policy(5), EventBus::new(), metrics.clone()).unwrap();
            q.enqueue(SyncKind::Feedback, json!({"detection_id": "d1"})).unwrap().id
        };
        let q = OfflineSyncQueue::open(&path, policy(5), EventBus::new(), metrics).unwrap();
        let pending = q.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].kind, SyncKind::Feedback);
    }

    #[test]
    fn kinds_map_to_endpoints() {
        assert_eq!(SyncKind::Feedback.endpoint(), "/feedback");
        assert_eq!(SyncKind::Metrics.endpoint(), "/metrics");
        assert_eq!(SyncKind::from_str_lossy("telemetry"), SyncKind::Telemetry);
    }
}
