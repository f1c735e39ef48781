//! Guard configuration
//!
//! Loaded from `tether.toml`. Every section defaults, so an empty file is
//! a valid configuration:
//!
//! ```toml
//! [paths]
//! live_document = "/srv/host/config.json"
//! snapshot_dir = "/srv/host/.tether/snapshots"
//!
//! [health]
//! apply_timeout_secs = 45
//!
//! [host]
//! health_url = "http://127.0.0.1:8080/health"
//! reload_command = "systemctl reload host"
//!
//! [[host.integrations]]
//! name = "telegram"
//! url = "http://127.0.0.1:8081/health"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_validate::ValidationPolicy;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config '{}': {source}", path.display())]
    Io {
        /// Config path
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for [`GuardConfig`]
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete guard configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// File locations
    pub paths: PathsConfig,
    /// Health-check windows
    pub health: HealthConfig,
    /// Ambient watchdog thresholds
    pub watchdog: WatchdogConfig,
    /// Host control commands and health checks
    pub host: HostConfig,
    /// Operator escalation channel
    pub notify: NotifyConfig,
    /// Validator policy and upgrade settings
    pub validation: ValidationConfig,
    /// Cross-process mutation lock
    pub lock: LockConfig,
}

impl GuardConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Parse` for malformed TOML
    /// - `ConfigError::Invalid` for inconsistent values
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if it exists, else defaults
    ///
    /// # Errors
    /// As [`GuardConfig::load`], except that a missing file is not an error
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// - `ConfigError::Parse` for malformed TOML
    /// - `ConfigError::Invalid` for inconsistent values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent timeouts and thresholds
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.health;
        if h.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("health.poll_interval_ms must be > 0".into()));
        }
        if h.apply_timeout_secs == 0 {
            return Err(ConfigError::Invalid("health.apply_timeout_secs must be > 0".into()));
        }
        if h.rollback_timeout_secs == 0 || h.rollback_timeout_secs > h.apply_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "health.rollback_timeout_secs ({}) must be in 1..={} (apply timeout)",
                h.rollback_timeout_secs, h.apply_timeout_secs
            )));
        }

        let w = &self.watchdog;
        if w.interval_secs == 0 {
            return Err(ConfigError::Invalid("watchdog.interval_secs must be > 0".into()));
        }
        if w.restart_threshold == 0 {
            return Err(ConfigError::Invalid("watchdog.restart_threshold must be > 0".into()));
        }
        if w.rollback_threshold <= w.restart_threshold {
            return Err(ConfigError::Invalid(format!(
                "watchdog.rollback_threshold ({}) must exceed restart_threshold ({})",
                w.rollback_threshold, w.restart_threshold
            )));
        }

        if self.validation.upgrade.descriptor_name.is_empty()
            || self.validation.upgrade.descriptor_name.contains('/')
        {
            return Err(ConfigError::Invalid(
                "validation.upgrade.descriptor_name must be a plain file name".into(),
            ));
        }

        for integration in &self.host.integrations {
            if integration.name.is_empty() || integration.url.is_empty() {
                return Err(ConfigError::Invalid(
                    "host.integrations entries need a name and a url".into(),
                ));
            }
        }
        Ok(())
    }
}

/// `[paths]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// The live configuration document
    pub live_document: PathBuf,
    /// Snapshot store directory
    pub snapshot_dir: PathBuf,
    /// Tracked plugin tree
    pub plugin_dir: PathBuf,
    /// Hash-chained audit journal
    pub audit_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            live_document: PathBuf::from("config.json"),
            snapshot_dir: PathBuf::from(".tether/snapshots"),
            plugin_dir: PathBuf::from("plugins"),
            audit_log: PathBuf::from(".tether/audit.jsonl"),
        }
    }
}

/// `[health]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Delay between health polls
    pub poll_interval_ms: u64,
    /// Window after an apply or upgrade
    pub apply_timeout_secs: u64,
    /// Window after a rollback; never longer than the apply window
    pub rollback_timeout_secs: u64,
}

impl HealthConfig {
    /// Poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Apply window
    #[must_use]
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    /// Rollback window
    #[must_use]
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            apply_timeout_secs: 30,
            rollback_timeout_secs: 15,
        }
    }
}

/// `[watchdog]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Tick period for `watchdog run`
    pub interval_secs: u64,
    /// Consecutive failed ticks before a restart
    pub restart_threshold: u32,
    /// Consecutive failed ticks before rollback-and-restart
    pub rollback_threshold: u32,
    /// Persisted counter for cron-style `watchdog tick`
    pub state_file: PathBuf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            restart_threshold: 3,
            rollback_threshold: 6,
            state_file: PathBuf::from(".tether/watchdog.json"),
        }
    }
}

/// `[host]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// HTTP liveness endpoint
    pub health_url: String,
    /// Per-request timeout for health checks
    pub health_timeout_ms: u64,
    /// Shell command that makes the host re-read its configuration
    pub reload_command: Option<String>,
    /// Shell command that restarts the host process
    pub restart_command: Option<String>,
    /// Shell command exiting 0 while the host process is alive
    pub process_check_command: Option<String>,
    /// Downstream endpoints checked by the watchdog
    pub integrations: Vec<IntegrationConfig>,
}

impl HostConfig {
    /// Probe timeout
    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            health_url: "http://127.0.0.1:18789/health".to_string(),
            health_timeout_ms: 2_000,
            reload_command: None,
            restart_command: None,
            process_check_command: None,
            integrations: Vec::new(),
        }
    }
}

/// `[[host.integrations]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Display name
    pub name: String,
    /// Health URL
    pub url: String,
}

/// `[notify]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving escalations as JSON; log-only when unset
    pub webhook_url: Option<String>,
}

/// `[validation]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Validator policy
    #[serde(flatten)]
    pub policy: ValidationPolicy,
    /// `[validation.upgrade]`
    pub upgrade: UpgradeConfig,
}

/// `[validation.upgrade]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Plugin descriptor file name inside each plugin directory
    pub descriptor_name: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            descriptor_name: "plugin.json".to_string(),
        }
    }
}

/// `[lock]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which a lock is assumed abandoned
    pub stale_after_secs: u64,
}

impl LockConfig {
    /// Stale horizon
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_is_default() {
        let config = GuardConfig::from_toml_str("").unwrap();
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.health.apply_timeout(), Duration::from_secs(30));
        assert_eq!(config.watchdog.restart_threshold, 3);
        assert_eq!(config.watchdog.rollback_threshold, 6);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = GuardConfig::from_toml_str(
            r#"
            [paths]
            live_document = "/srv/host/config.json"

            [health]
            apply_timeout_secs = 60

            [host]
            health_url = "http://localhost:9000/healthz"
            reload_command = "kill -HUP 1"

            [[host.integrations]]
            name = "chat"
            url = "http://localhost:9001/health"

            [validation]
            block_on_regression = true
            critical_fields = ["gateway.auth.token"]

            [validation.upgrade]
            descriptor_name = "manifest.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.live_document, PathBuf::from("/srv/host/config.json"));
        assert_eq!(config.paths.plugin_dir, PathBuf::from("plugins"));
        assert_eq!(config.health.apply_timeout_secs, 60);
        assert_eq!(config.health.rollback_timeout_secs, 15);
        assert_eq!(config.host.integrations.len(), 1);
        assert!(config.validation.policy.block_on_regression);
        assert_eq!(config.validation.policy.critical_fields.len(), 1);
        assert_eq!(config.validation.policy.identifier_fields.len(), 7);
        assert_eq!(config.validation.upgrade.descriptor_name, "manifest.json");
    }

    #[test]
    fn rollback_window_longer_than_apply_is_rejected() {
        let err = GuardConfig::from_toml_str(
            "[health]\napply_timeout_secs = 10\nrollback_timeout_secs = 20\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rollback_threshold_must_exceed_restart() {
        let err = GuardConfig::from_toml_str(
            "[watchdog]\nrestart_threshold = 4\nrollback_threshold = 4\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("rollback_threshold"));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            GuardConfig::from_toml_str("[health\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
