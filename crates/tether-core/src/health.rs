//! Bounded health windows
//!
//! Poll at a fixed interval until the host reports healthy or the window
//! closes. The first poll waits one interval so a host that reloads
//! asynchronously is not sampled in its pre-reload state. The window is
//! never cut short by a slow health check: it ends on the first poll that starts
//! after the deadline.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::host::{HealthStatus, HostController};

/// Which window was run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthWindowKind {
    /// After writing a change
    Apply,
    /// After restoring a snapshot
    Rollback,
}

/// Outcome of one window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthWindowReport {
    /// Window kind
    pub kind: HealthWindowKind,
    /// Configured length
    pub timeout_ms: u64,
    /// Polls performed
    pub polls: u32,
    /// Host confirmed healthy within the window
    pub confirmed: bool,
    /// Last sample
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<HealthStatus>,
    /// Reload signal error that preceded the window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reload_error: Option<String>,
}

impl HealthWindowReport {
    /// Window skipped because the reload signal failed
    #[must_use]
    pub fn reload_failed(kind: HealthWindowKind, timeout: Duration, error: impl ToString) -> Self {
        Self {
            kind,
            timeout_ms: millis(timeout),
            polls: 0,
            confirmed: false,
            last: None,
            reload_error: Some(error.to_string()),
        }
    }
}

/// Poll `host` until healthy or `timeout` elapses
pub async fn poll_until_healthy(
    host: &dyn HostController,
    kind: HealthWindowKind,
    interval: Duration,
    timeout: Duration,
) -> HealthWindowReport {
    let deadline = Instant::now() + timeout;
    let mut polls = 0;
    tokio::time::sleep(interval.min(timeout)).await;
    loop {
        let status = host.health_check().await;
        polls += 1;
        tracing::debug!(
            window = ?kind,
            poll = polls,
            healthy = status.healthy,
            latency_ms = status.latency_ms,
            "health poll"
        );
        if status.healthy {
            return HealthWindowReport {
                kind,
                timeout_ms: millis(timeout),
                polls,
                confirmed: true,
                last: Some(status),
                reload_error: None,
            };
        }

        let now = Instant::now();
        if now >= deadline {
            return HealthWindowReport {
                kind,
                timeout_ms: millis(timeout),
                polls,
                confirmed: false,
                last: Some(status),
                reload_error: None,
            };
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Healthy from the given poll on (1-based); never if `None`
    struct Flaky {
        healthy_from: Option<u32>,
        polls: Mutex<u32>,
    }

    #[async_trait]
    impl HostController for Flaky {
        async fn reload(&self) -> Result<(), HostError> {
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            let mut polls = self.polls.lock();
            *polls += 1;
            match self.healthy_from {
                Some(n) if *polls >= n => HealthStatus::healthy(Duration::ZERO),
                _ => HealthStatus::unhealthy(Duration::ZERO, "down"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_on_first_healthy_poll() {
        let host = Flaky {
            healthy_from: Some(3),
            polls: Mutex::new(0),
        };
        let report = poll_until_healthy(
            &host,
            HealthWindowKind::Apply,
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
        .await;
        assert!(report.confirmed);
        assert_eq!(report.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_waits_one_interval() {
        let host = Flaky {
            healthy_from: Some(1),
            polls: Mutex::new(0),
        };
        let started = Instant::now();
        let report = poll_until_healthy(
            &host,
            HealthWindowKind::Apply,
            Duration::from_secs(2),
            Duration::from_secs(30),
        )
        .await;
        assert!(report.confirmed);
        assert_eq!(report.polls, 1);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let host = Flaky {
            healthy_from: None,
            polls: Mutex::new(0),
        };
        let report = poll_until_healthy(
            &host,
            HealthWindowKind::Rollback,
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        assert!(!report.confirmed);
        // t = 1, 2, 3, 4, 5
        assert_eq!(report.polls, 5);
        assert_eq!(report.kind, HealthWindowKind::Rollback);
    }
}
