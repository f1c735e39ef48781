//! Operator escalation channel
//!
//! One-way: alerts are sent, never acknowledged. Used only when automatic
//! recovery has failed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NotifyError;

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Attention soon
    Warning,
    /// Host is down and automatic recovery is exhausted
    Critical,
}

/// Escalation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Severity
    pub level: AlertLevel,
    /// Raising component (`apply`, `upgrade`, `rollback`, `watchdog`)
    pub source: String,
    /// One-line summary
    pub summary: String,
    /// Details for the operator
    pub detail: String,
    /// Related mutation attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    /// Raise time
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Critical alert
    #[must_use]
    pub fn critical(
        source: impl Into<String>,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            level: AlertLevel::Critical,
            source: source.into(),
            summary: summary.into(),
            detail: detail.into(),
            attempt_id: None,
            raised_at: Utc::now(),
        }
    }

    /// Attach the attempt id
    #[inline]
    #[must_use]
    pub fn for_attempt(mut self, id: impl ToString) -> Self {
        self.attempt_id = Some(id.to_string());
        self
    }
}

/// Notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.level {
            AlertLevel::Critical => tracing::error!(
                source = %alert.source,
                attempt_id = alert.attempt_id.as_deref().unwrap_or("-"),
                detail = %alert.detail,
                "OPERATOR ALERT: {}", alert.summary
            ),
            AlertLevel::Warning => tracing::warn!(
                source = %alert.source,
                attempt_id = alert.attempt_id.as_deref().unwrap_or("-"),
                detail = %alert.detail,
                "operator alert: {}", alert.summary
            ),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook, and logs them too
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Notifier posting to `url`
    ///
    /// # Errors
    /// Returns `NotifyError::Http` if the client cannot be built
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        LogNotifier.notify(alert).await?;
        let response = self.client.post(&self.url).json(alert).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
