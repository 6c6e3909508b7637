use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ── Top-level config ────────────────────────────────────────────

/// Root configuration for the offline layer and CLI.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Cache generation tag. Changing it is the only way to invalidate
    /// every partition wholesale.
    #[serde(default = "default_version")]
    pub version: String,
    /// Directory holding `cache.db` and `sync.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            backend: BackendConfig::default(),
            cache: CacheConfig::default(),
            detection: DetectionConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_version() -> String {
    format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "ecoscan", "ecoscan")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".ecoscan"))
}

// ── Remote backend ──────────────────────────────────────────────

/// Remote inference backend and health probing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackendConfig {
    /// Base URL of the inference service (`/detect`, `/health`, `/feedback`).
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    /// Deadline for `/detect` and sync delivery calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Deadline for a single `/health` probe.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Interval between scheduled probes.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Consecutive successful probes required before a failed backend is
    /// considered available again.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            request_timeout_secs: default_request_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_interval_secs: default_probe_interval_secs(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".into()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_recovery_threshold() -> u32 {
    1
}

// ── Cache ───────────────────────────────────────────────────────

/// Cache orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheConfig {
    /// Deadline for a network fetch issued by the orchestrator.
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    /// Resources populated into every new generation on install.
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,
    /// Path served from the static partition to offline navigations.
    #[serde(default = "default_offline_fallback_path")]
    pub offline_fallback_path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            network_timeout_secs: default_network_timeout_secs(),
            precache: default_precache(),
            offline_fallback_path: default_offline_fallback_path(),
        }
    }
}

impl CacheConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }
}

fn default_network_timeout_secs() -> u64 {
    8
}

fn default_precache() -> Vec<String> {
    vec![
        "http://127.0.0.1:5173/".into(),
        "http://127.0.0.1:5173/offline.html".into(),
        "http://127.0.0.1:5173/manifest.json".into(),
    ]
}

fn default_offline_fallback_path() -> String {
    "/offline.html".into()
}

// ── Detection ───────────────────────────────────────────────────

/// Detection request defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DetectionConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Longest image side sent to the remote backend; larger images are
    /// downscaled before upload.
    #[serde(default = "default_max_image_side")]
    pub max_image_side: u32,
    /// Weights for the local engine, fetched through the model partition.
    #[serde(default)]
    pub model_url: Option<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            model_version: default_model_version(),
            max_image_side: default_max_image_side(),
            model_url: None,
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_model_version() -> String {
    "latest".into()
}

fn default_max_image_side() -> u32 {
    640
}

// ── Sync queue ──────────────────────────────────────────────────

/// Offline sync queue retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncConfig {
    /// Attempts after which a task is dropped with a drop record.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Periodic flush interval (in addition to connectivity-restored flushes).
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl SyncConfig {
    /// Backoff before the next attempt of a task that has failed `attempts` times.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(20);
        let ms = self.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms).min(Duration::from_secs(self.max_backoff_secs))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_flush_interval_secs() -> u64 {
    60
}

// ── Logging ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
