//! Host capabilities
//!
//! The orchestrators and the watchdog never touch the host process
//! directly; they go through these traits so the state machines can run
//! against a scripted mock. [`CommandHost`] is the production
//! implementation: shell commands for reload/restart/liveness and HTTP
//! polls for health.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::{HostConfig, IntegrationConfig};
use crate::error::HostError;

/// Upper bound on reload/restart/check commands
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// One health sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Host reported healthy
    pub healthy: bool,
    /// Probe round-trip
    pub latency_ms: u64,
    /// Sample time
    pub checked_at: DateTime<Utc>,
    /// Failure reason, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthStatus {
    /// Healthy sample
    #[must_use]
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency_ms: duration_ms(latency),
            checked_at: Utc::now(),
            detail: None,
        }
    }

    /// Unhealthy sample
    #[must_use]
    pub fn unhealthy(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: duration_ms(latency),
            checked_at: Utc::now(),
            detail: Some(detail.into()),
        }
    }
}

/// Health of a downstream integration endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStatus {
    /// Integration name
    pub name: String,
    /// Probe result
    pub status: HealthStatus,
}

/// Reload and health capability used by the orchestrators
#[async_trait]
pub trait HostController: Send + Sync {
    /// Ask the host to re-read its configuration
    ///
    /// Idempotent; safe to send while healthy.
    async fn reload(&self) -> Result<(), HostError>;

    /// Probe the liveness endpoint once
    async fn health_check(&self) -> HealthStatus;

    /// Whether [`reload`](Self::reload) can do anything at all
    ///
    /// Orchestrators refuse an auto-restart mutation up front when this is
    /// false instead of writing and then failing both health windows.
    fn can_reload(&self) -> bool {
        true
    }
}

/// Process-level capability used by the watchdog
#[async_trait]
pub trait ProcessSupervisor: HostController {
    /// True while the host process exists
    async fn process_alive(&self) -> bool;

    /// Restart the host process
    async fn restart(&self) -> Result<(), HostError>;

    /// Probe every declared downstream integration
    async fn integration_health(&self) -> Vec<IntegrationStatus>;
}

/// Shell-command and HTTP backed host
#[derive(Debug, Clone)]
pub struct CommandHost {
    config: HostConfig,
    client: reqwest::Client,
}

impl CommandHost {
    /// Create from `[host]` settings
    ///
    /// # Errors
    /// Returns `HostError::Http` if the HTTP client cannot be built
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .timeout(config.health_timeout())
            .build()?;
        Ok(Self { config, client })
    }

    async fn fetch_health(&self, url: &str) -> HealthStatus {
        let start = Instant::now();
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => HealthStatus::healthy(start.elapsed()),
            Ok(response) => {
                HealthStatus::unhealthy(start.elapsed(), format!("status {}", response.status()))
            }
            Err(e) => HealthStatus::unhealthy(start.elapsed(), e.to_string()),
        }
    }

    async fn run(&self, what: &'static str, command: Option<&str>) -> Result<(), HostError> {
        let command = command.ok_or(HostError::NotConfigured(what))?;
        tracing::debug!(command, "running host {what} command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| HostError::Timeout {
                command: command.to_string(),
                timeout_secs: COMMAND_TIMEOUT.as_secs(),
            })?
            .map_err(|source| HostError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(HostError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl HostController for CommandHost {
    async fn reload(&self) -> Result<(), HostError> {
        self.run("reload", self.config.reload_command.as_deref()).await
    }

    async fn health_check(&self) -> HealthStatus {
        self.fetch_health(&self.config.health_url).await
    }

    fn can_reload(&self) -> bool {
        self.config.reload_command.is_some()
    }
}

#[async_trait]
impl ProcessSupervisor for CommandHost {
    async fn process_alive(&self) -> bool {
        match self.config.process_check_command.as_deref() {
            // Without a check command the HTTP health check is the only signal
            None => true,
            Some(cmd) => self.run("process check", Some(cmd)).await.is_ok(),
        }
    }

    async fn restart(&self) -> Result<(), HostError> {
        self.run("restart", self.config.restart_command.as_deref()).await
    }

    async fn integration_health(&self) -> Vec<IntegrationStatus> {
        let mut out = Vec::with_capacity(self.config.integrations.len());
        for IntegrationConfig { name, url } in &self.config.integrations {
            out.push(IntegrationStatus {
                name: name.clone(),
                status: self.fetch_health(url).await,
            });
        }
        out
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
