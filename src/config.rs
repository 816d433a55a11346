//! Engine configuration (persisted to config.json).
//!
//! On Linux this resolves to `~/.config/trail/config.json`; on macOS to
//! `~/Library/Application Support/trail/config.json`. A missing or invalid
//! file yields defaults.

use crate::error::ConfigError;
use crate::store::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do with a batch that exhausted its delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Drop the batch and record a local diagnostic
    #[default]
    Drop,
    /// Put the batch back at the front of the queue with a fresh attempt budget
    Requeue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Inactivity after which a session ends
    pub session_timeout_ms: u64,
    /// Inactivity after which a session is idle
    pub idle_threshold_ms: u64,
    pub max_batch_size: usize,
    /// Maximum age of the oldest buffered event before a flush
    pub flush_interval_ms: u64,
    /// Events endpoint; empty disables network delivery
    pub endpoint: String,
    pub enabled_signal_sources: Vec<String>,
    pub activity_poll_ms: u64,
    pub session_check_ms: u64,
    pub max_delivery_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub failure_policy: FailurePolicy,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Overrides the platform data directory for persisted state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30 * 60 * 1000,
            idle_threshold_ms: 30_000,
            max_batch_size: 20,
            flush_interval_ms: 10_000,
            endpoint: String::new(),
            enabled_signal_sources: vec!["heartbeat".to_string()],
            activity_poll_ms: 1_000,
            session_check_ms: 15_000,
            max_delivery_attempts: 3,
            retry_backoff_ms: 2_000,
            max_retry_backoff_ms: 60_000,
            failure_policy: FailurePolicy::Drop,
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: 15_000,
            storage_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("maxBatchSize must be at least 1".into()));
        }
        if self.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "maxDeliveryAttempts must be at least 1".into(),
            ));
        }
        let intervals = [
            ("sessionTimeoutMs", self.session_timeout_ms),
            ("idleThresholdMs", self.idle_threshold_ms),
            ("flushIntervalMs", self.flush_interval_ms),
            ("activityPollMs", self.activity_poll_ms),
            ("sessionCheckMs", self.session_check_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        if self.idle_threshold_ms >= self.session_timeout_ms {
            return Err(ConfigError::Invalid(
                "idleThresholdMs must be shorter than sessionTimeoutMs".into(),
            ));
        }
        Ok(())
    }

    /// Period of the flush timer: fine enough to honor `flushIntervalMs`.
    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.clamp(1, 1_000))
    }

    pub fn activity_poll(&self) -> Duration {
        Duration::from_millis(self.activity_poll_ms)
    }

    pub fn session_check(&self) -> Duration {
        Duration::from_millis(self.session_check_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

/// Trail config directory (e.g. `~/.config/trail/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("trail"))
}

/// Default location of config.json.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default location, returning defaults if missing or invalid.
pub fn load_config() -> EngineConfig {
    let Some(path) = default_config_path() else {
        return EngineConfig::default();
    };
    load_config_from(&path)
}

/// Load config from `path`, returning defaults if missing or invalid.
pub fn load_config_from(path: &Path) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => EngineConfig::default(),
    }
}

/// Save config to `path`.
pub fn save_config_to(config: &EngineConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    atomic_write(path, json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.session_timeout_ms, 1_800_000);
        assert_eq!(config.idle_threshold_ms, 30_000);
        assert_eq!(config.max_batch_size, 20);
        assert_eq!(config.failure_policy, FailurePolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = EngineConfig {
            endpoint: "https://collect.example/events".into(),
            max_batch_size: 3,
            failure_policy: FailurePolicy::Requeue,
            ..EngineConfig::default()
        };
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let config = load_config_from(Path::new("/tmp/trail_nonexistent/config.json"));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn load_invalid_json_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not valid json!!!").unwrap();
        assert_eq!(load_config_from(&path), EngineConfig::default());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"maxBatchSize":5,"enabledSignalSources":["environment"],"unknown":1}"#,
        )
        .unwrap();

        let config = load_config_from(&path);
        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.enabled_signal_sources, vec!["environment"]);
        assert_eq!(config.flush_interval_ms, 10_000);
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let config = EngineConfig {
            max_batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_idle_longer_than_timeout() {
        let config = EngineConfig {
            idle_threshold_ms: 60_000,
            session_timeout_ms: 60_000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let config = EngineConfig {
            activity_poll_ms: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("activityPollMs"));
    }

    #[test]
    fn flush_tick_is_capped() {
        let config = EngineConfig {
            flush_interval_ms: 200,
            ..EngineConfig::default()
        };
        assert_eq!(config.flush_tick(), Duration::from_millis(200));
        assert_eq!(EngineConfig::default().flush_tick(), Duration::from_secs(1));
    }
}
