//! Configuration loading.
//!
//! Config lives in a TOML file; every field has a default so a missing file
//! or a partial file both yield a usable config. A small set of environment
//! variables override the file for deployment convenience.

pub mod schema;

pub use schema::{BackendConfig, CacheConfig, Config, DetectionConfig, LoggingConfig, SyncConfig};

use anyhow::{Context, Result};
use std::path::Path;

impl Config {
    /// Load config from `path`, falling back to defaults when the file does
    /// not exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `ECOSCAN_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ECOSCAN_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend.base_url = url.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("ECOSCAN_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir.trim().into();
            }
        }
        if let Ok(version) = std::env::var("ECOSCAN_VERSION") {
            if !version.trim().is_empty() {
                self.version = version.trim().to_string();
            }
        }
    }

    /// Reject values that would make the layer misbehave rather than degrade.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            anyhow::bail!("version cannot be empty: it names the cache generation");
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            anyhow::bail!(
                "detection.confidence_threshold must be within 0.0..=1.0 (got {})",
                self.detection.confidence_threshold
            );
        }
        if self.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be at least 1");
        }
        if self.backend.recovery_threshold == 0 {
            anyhow::bail!("backend.recovery_threshold must be at least 1");
        }
        reqwest::Url::parse(&self.backend.base_url)
            .with_context(|| format!("Invalid backend.base_url: {}", self.backend.base_url))?;
        Ok(())
    }

    /// JSON schema of the config file, for editor tooling.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize config schema")
    }

    pub fn cache_db_path(&self) -> std::path::PathBuf {
        self.data_dir.join("cache.db")
    }

    pub fn sync_db_path(&self) -> std::path::PathBuf {
        self.data_dir.join("sync.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.backend.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.backend.recovery_threshold, 1);
        assert_eq!(config.detection.model_version, "latest");
        assert!((config.detection.confidence_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.sync.max_attempts, 5);
        assert!(config.version.starts_with('v'));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml_str = r#"
version = "v9"

[backend]
base_url = "http://10.0.0.2:8000"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.version, "v9");
        assert_eq!(config.backend.base_url, "http://10.0.0.2:8000");
        assert_eq!(config.backend.probe_timeout_secs, 5);
        assert_eq!(config.cache.offline_fallback_path, "/offline.html");
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.flush_interval_secs, 60);
    }

    #[test]
    fn load_rejects_bad_threshold() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[detection]\nconfidence_threshold = 1.5\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn load_rejects_unparseable_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "version = [").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let sync = SyncConfig {
            base_backoff_ms: 100,
            max_backoff_secs: 1,
            ..SyncConfig::default()
        };
        assert_eq!(sync.backoff_for(1), Duration::from_millis(100));
        assert_eq!(sync.backoff_for(2), Duration::from_millis(200));
        assert_eq!(sync.backoff_for(3), Duration::from_millis(400));
        assert_eq!(sync.backoff_for(10), Duration::from_secs(1));
    }

    #[test]
    fn schema_mentions_sections() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("backend"));
        assert!(schema.contains("recovery_threshold"));
    }

    #[test]
    fn db_paths_live_under_data_dir() {
        let config = Config {
            data_dir: "/tmp/eco".into(),
            ..Config::default()
        };
        assert_eq!(config.cache_db_path(), std::path::PathBuf::from("/tmp/eco/cache.db"));
        assert_eq!(config.sync_db_path(), std::path::PathBuf::from("/tmp/eco/sync.db"));
    }
}
