//! Persistent cache storage shared by every partition.
//!
//! One SQLite table holds all entries, keyed by `(generation, partition, key)`,
//! so "at most one live entry per key per partition" is enforced by the
//! primary key. Only [`super::CacheOrchestrator`] and the lifecycle controller
//! (through the orchestrator) touch this type.

use super::identity::{payload_digest, CachePartition, PartitionId, ResourceIdentity, VersionTag};
use crate::error::OfflineResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// A cached response body plus its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: ResourceIdentity,
    pub partition: PartitionId,
    pub generation: VersionTag,
    pub url: String,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    /// SHA-256 of `payload`, hex encoded.
    pub digest: String,
    pub stored_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheEntry {
    pub fn new(
        partition: &CachePartition,
        key: ResourceIdentity,
        url: impl Into<String>,
        content_type: Option<String>,
        payload: Vec<u8>,
    ) -> Self {
        let digest = payload_digest(&payload);
        let size_bytes = payload.len() as u64;
        Self {
            key,
            partition: partition.id,
            generation: partition.generation.clone(),
            url: url.into(),
            content_type,
            payload,
            digest,
            stored_at: Utc::now(),
            size_bytes,
        }
    }

    /// Whether the payload still matches the digest recorded at write time.
    pub fn is_intact(&self) -> bool {
        payload_digest(&self.payload) == self.digest
    }
}

/// Entry metadata without the payload, used for eviction predicates and listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMeta {
    pub key: ResourceIdentity,
    pub url: String,
    pub content_type: Option<String>,
    pub digest: String,
    pub stored_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// What a `put` did to the slot for that key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// An entry with a different digest was overwritten.
    Replaced,
    /// The same bytes were already stored; only the timestamp moved.
    Unchanged,
}

/// Persisted lifecycle state of a generation. A generation without a record
/// was never completely installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    /// Every manifest file was stored; not yet serving.
    Installed,
    /// The generation resolves are served from.
    Active,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Active => "active",
        }
    }

    fn from_str_lossy(raw: &str) -> Option<Self> {
        match raw {
            "installed" => Some(Self::Installed),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

/// Entry count and byte total for one partition of one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub entries: u64,
    pub bytes: u64,
}

pub struct CacheStorage {
    conn: Mutex<Connection>,
}

impl CacheStorage {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache DB: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;",
        )?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Volatile storage for degraded mode when the database cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory cache DB")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                generation   TEXT NOT NULL,
                partition    TEXT NOT NULL,
                key          TEXT NOT NULL,
                url          TEXT NOT NULL,
                content_type TEXT,
                payload      BLOB NOT NULL,
                digest       TEXT NOT NULL,
                size_bytes   INTEGER NOT NULL,
                stored_at    TEXT NOT NULL,
                PRIMARY KEY (generation, partition, key)
            );
            CREATE INDEX IF NOT EXISTS idx_cache_generation ON cache_entries(generation);
            CREATE TABLE IF NOT EXISTS cache_generations (
                version    TEXT PRIMARY KEY,
                state      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn get(
        &self,
        partition: &CachePartition,
        key: &ResourceIdentity,
    ) -> OfflineResult<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT url, content_type, payload, digest, size_bytes, stored_at
                 FROM cache_entries WHERE generation = ?1 AND partition = ?2 AND key = ?3",
                params![partition.generation.as_str(), partition.id.as_str(), key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(url, content_type, payload, digest, size_bytes, stored_at)| CacheEntry {
                key: key.clone(),
                partition: partition.id,
                generation: partition.generation.clone(),
                url,
                content_type,
                payload,
                digest,
                stored_at: parse_timestamp(&stored_at),
                size_bytes: u64::try_from(size_bytes).unwrap_or(0),
            },
        ))
    }

    /// Insert or replace the entry for its key. Reports whether the stored
    /// bytes changed.
    pub fn put(&self, entry: &CacheEntry) -> OfflineResult<PutOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT digest FROM cache_entries
                 WHERE generation = ?1 AND partition = ?2 AND key = ?3",
                params![
                    entry.generation.as_str(),
                    entry.partition.as_str(),
                    entry.key.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "INSERT OR REPLACE INTO cache_entries
                (generation, partition, key, url, content_type, payload, digest, size_bytes, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.generation.as_str(),
                entry.partition.as_str(),
                entry.key.as_str(),
                entry.url,
                entry.content_type,
                entry.payload,
                entry.digest,
                i64::try_from(entry.size_bytes).unwrap_or(i64::MAX),
                entry.stored_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        Ok(match previous {
            None => PutOutcome::Inserted,
            Some(digest) if digest == entry.digest => PutOutcome::Unchanged,
            Some(_) => PutOutcome::Replaced,
        })
    }

    pub fn delete(&self, partition: &CachePartition, key: &ResourceIdentity) -> OfflineResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE generation = ?1 AND partition = ?2 AND key = ?3",
            params![partition.generation.as_str(), partition.id.as_str(), key.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Metadata of every entry in a partition, oldest first.
    pub fn list(&self, partition: &CachePartition) -> OfflineResult<Vec<EntryMeta>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, url, content_type, digest, size_bytes, stored_at
             FROM cache_entries WHERE generation = ?1 AND partition = ?2
             ORDER BY stored_at ASC",
        )?;
        let rows = stmt.query_map(
            params![partition.generation.as_str(), partition.id.as_str()],
            |row| {
                Ok(EntryMeta {
                    key: ResourceIdentity::from_hex(row.get::<_, String>(0)?),
                    url: row.get(1)?,
                    content_type: row.get(2)?,
                    digest: row.get(3)?,
                    size_bytes: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
                    stored_at: parse_timestamp(&row.get::<_, String>(5)?),
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Remove every entry in `partition` matching `predicate`.
    pub fn evict_where<F>(&self, partition: &CachePartition, predicate: F) -> OfflineResult<usize>
    where
        F: Fn(&EntryMeta) -> bool,
    {
        let doomed: Vec<ResourceIdentity> = self
            .list(partition)?
            .into_iter()
            .filter(|meta| predicate(meta))
            .map(|meta| meta.key)
            .collect();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for key in &doomed {
            removed += tx.execute(
                "DELETE FROM cache_entries WHERE generation = ?1 AND partition = ?2 AND key = ?3",
                params![partition.generation.as_str(), partition.id.as_str(), key.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn clear_partition(&self, partition: &CachePartition) -> OfflineResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE generation = ?1 AND partition = ?2",
            params![partition.generation.as_str(), partition.id.as_str()],
        )?;
        Ok(removed)
    }

    /// Every generation with at least one entry or a lifecycle record.
    pub fn generations(&self) -> OfflineResult<Vec<VersionTag>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT generation FROM cache_entries
             UNION
             SELECT version FROM cache_generations
             ORDER BY 1",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(VersionTag::new(row?));
        }
        Ok(out)
    }

    /// Delete a generation's entries and its lifecycle record.
    pub fn delete_generation(&self, generation: &VersionTag) -> OfflineResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM cache_entries WHERE generation = ?1",
            params![generation.as_str()],
        )?;
        tx.execute(
            "DELETE FROM cache_generations WHERE version = ?1",
            params![generation.as_str()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Record `generation` as completely installed.
    pub fn mark_installed(&self, generation: &VersionTag) -> OfflineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO cache_generations (version, state, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                generation.as_str(),
                GenerationStatus::Installed.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Record `generation` as the single active one.
    pub fn mark_active(&self, generation: &VersionTag) -> OfflineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE cache_generations SET state = ?1 WHERE state = ?2",
            params![
                GenerationStatus::Installed.as_str(),
                GenerationStatus::Active.as_str()
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO cache_generations (version, state, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                generation.as_str(),
                GenerationStatus::Active.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn generation_status(&self, generation: &VersionTag) -> OfflineResult<Option<GenerationStatus>> {
        let conn = self.conn.lock();
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM cache_generations WHERE version = ?1",
                params![generation.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.as_deref().and_then(GenerationStatus::from_str_lossy))
    }

    /// The generation last recorded as active, if any.
    pub fn active_generation(&self) -> OfflineResult<Option<VersionTag>> {
        let conn = self.conn.lock();
        let version: Option<String> = conn
            .query_row(
                "SELECT version FROM cache_generations WHERE state = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                params![GenerationStatus::Active.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(VersionTag::new))
    }

    pub fn stats(&self, partition: &CachePartition) -> OfflineResult<PartitionStats> {
        let conn = self.conn.lock();
        let (entries, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0)
             FROM cache_entries WHERE generation = ?1 AND partition = ?2",
            params![partition.generation.as_str(), partition.id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PartitionStats {
            entries: u64::try_from(entries).unwrap_or(0),
            bytes: u64::try_from(bytes).unwrap_or(0),
        })
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
