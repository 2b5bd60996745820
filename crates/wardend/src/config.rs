//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use warden_api::ApiPolicy;
use warden_failover::FailoverPolicy;
use warden_health::HealthConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Durable SQLite database at the given path.
    Sqlite { path: PathBuf },
    /// Ephemeral in-memory store. State is lost on restart.
    Memory,
}

/// Configuration for the wardend registry daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    /// HTTP bind address for the discovery API.
    #[serde(default = "default_bind")]
    pub bind_addr: String,

    /// Registry store backend.
    #[serde(default = "default_store")]
    pub store: StoreBackend,

    /// Tick period of the health checker, seconds.
    #[serde(default = "default_interval")]
    pub health_check_interval_secs: u64,

    /// Per-probe timeout, seconds.
    #[serde(default = "default_timeout")]
    pub health_check_timeout_secs: u64,

    /// Consecutive unhealthy probes before `status=unhealthy`.
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,

    /// Consecutive healthy probes required for failback.
    #[serde(default = "default_threshold")]
    pub stability_count: u32,

    /// Cooldown since the last failover before failback, seconds.
    #[serde(default = "default_five_minutes")]
    pub failback_delay_secs: u64,

    /// Minimum registration age of a rotation replacement, seconds.
    #[serde(default = "default_five_minutes")]
    pub min_rotation_age_secs: u64,

    /// Minimum accepted admin-token length.
    #[serde(default = "default_token_length")]
    pub admin_token_min_length: usize,

    /// Upper bound on concurrently in-flight probes per round.
    #[serde(default = "default_probe_concurrency")]
    pub max_concurrent_probes: usize,
}

fn default_bind() -> String {
    "0.0.0.0:8085".to_string()
}

fn default_store() -> StoreBackend {
    StoreBackend::Sqlite {
        path: PathBuf::from("/var/lib/wardend/registry.db"),
    }
}

fn default_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    10
}

fn default_threshold() -> u32 {
    3
}

fn default_five_minutes() -> u64 {
    300
}

fn default_token_length() -> usize {
    32
}

fn default_probe_concurrency() -> usize {
    16
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind(),
            store: default_store(),
            health_check_interval_secs: default_interval(),
            health_check_timeout_secs: default_timeout(),
            failure_threshold: default_threshold(),
            stability_count: default_threshold(),
            failback_delay_secs: default_five_minutes(),
            min_rotation_age_secs: default_five_minutes(),
            admin_token_min_length: default_token_length(),
            max_concurrent_probes: default_probe_concurrency(),
        }
    }
}

impl WardenConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("read {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&data)
            .map_err(|e| ConfigError::Invalid(format!("parse {}: {e}", path.display())))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Environment overrides for the common knobs.
    pub fn apply_env(&mut self) {
        if let Ok(bind) = std::env::var("WARDEN_BIND") {
            self.bind_addr = bind;
        }
        if let Ok(path) = std::env::var("WARDEN_DB_PATH") {
            self.store = StoreBackend::Sqlite {
                path: PathBuf::from(path),
            };
        }
        env_u64("WARDEN_HEALTH_CHECK_INTERVAL", &mut self.health_check_interval_secs);
        env_u64("WARDEN_HEALTH_CHECK_TIMEOUT", &mut self.health_check_timeout_secs);
        env_u32("WARDEN_FAILURE_THRESHOLD", &mut self.failure_threshold);
        env_u32("WARDEN_STABILITY_COUNT", &mut self.stability_count);
        env_u64("WARDEN_FAILBACK_DELAY", &mut self.failback_delay_secs);
        env_u64("WARDEN_MIN_ROTATION_AGE", &mut self.min_rotation_age_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_check_interval_secs must be positive".to_string(),
            ));
        }
        if self.failure_threshold == 0 || self.stability_count == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold and stability_count must be positive".to_string(),
            ));
        }
        if self.max_concurrent_probes == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_probes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.health_check_interval_secs),
            probe_timeout: Duration::from_secs(self.health_check_timeout_secs),
            failure_threshold: self.failure_threshold,
            max_concurrent_probes: self.max_concurrent_probes,
            checked_by: "wardend".to_string(),
        }
    }

    pub fn failover_policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            stability_count: self.stability_count,
            failback_delay: Duration::from_secs(self.failback_delay_secs),
        }
    }

    pub fn api_policy(&self) -> ApiPolicy {
        ApiPolicy {
            admin_token_min_length: self.admin_token_min_length,
            min_rotation_age: Duration::from_secs(self.min_rotation_age_secs),
        }
    }
}

fn env_u64(key: &str, target: &mut u64) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

fn env_u32(key: &str, target: &mut u32) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WardenConfig::default();
        assert_eq!(config.health_check_interval_secs, 60);
        assert_eq!(config.health_check_timeout_secs, 10);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.stability_count, 3);
        assert_eq!(config.failback_delay_secs, 300);
        assert_eq!(config.min_rotation_age_secs, 300);
        assert_eq!(config.admin_token_min_length, 32);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut config = WardenConfig::default();
        config.bind_addr = "127.0.0.1:9000".to_string();
        config.store = StoreBackend::Memory;
        config.save(&path).expect("save");

        let loaded = WardenConfig::load(&path).expect("load");
        assert_eq!(loaded.bind_addr, "127.0.0.1:9000");
        assert!(matches!(loaded.store, StoreBackend::Memory));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"bind_addr": "127.0.0.1:7000"}"#).expect("write");

        let loaded = WardenConfig::load(&path).expect("load");
        assert_eq!(loaded.bind_addr, "127.0.0.1:7000");
        assert_eq!(loaded.failure_threshold, 3);
    }

    #[test]
    fn zero_interval_rejected() {
        let config = WardenConfig {
            health_check_interval_secs: 0,
            ..WardenConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
