//! Ambient watchdog
//!
//! Runs on its own clock with no knowledge of in-flight mutations. Each
//! tick samples process liveness, the health endpoint and any declared
//! integrations, then feeds one healthy/unhealthy bit into
//! [`EscalationPolicy::step`]:
//!
//! ```text
//! failures == restart_threshold          → Restart
//! failures >= rollback_threshold         → RollbackAndRestart   (first time)
//! rollback threshold reached again       → Escalate, then silent until healthy
//! healthy tick                           → counters reset
//! ```
//!
//! Integration failures are reported but never counted. The counters can
//! be persisted to a state file so one-shot `tick` invocations from cron
//! keep their history.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_store::{atomic_write, LiveDocument, MutationLock, SnapshotStore, StoreError};
use tokio::time::MissedTickBehavior;

use crate::audit::AuditLog;
use crate::config::WatchdogConfig;
use crate::error::Result;
use crate::host::{HealthStatus, IntegrationStatus, ProcessSupervisor};
use crate::notify::{Alert, LogNotifier, Notifier};

const HOLDER: &str = "watchdog";

/// What a tick decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogAction {
    /// Nothing
    None,
    /// Restart the host process
    Restart,
    /// Restore the latest snapshot, then restart
    RollbackAndRestart,
    /// Tell the operator and stop acting
    Escalate,
}

impl WatchdogAction {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Restart => "restart",
            Self::RollbackAndRestart => "rollback_and_restart",
            Self::Escalate => "escalate",
        }
    }
}

/// Counters carried between ticks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogState {
    /// Unhealthy ticks since the last healthy one (reset by a rollback)
    pub consecutive_failures: u32,
    /// Rollbacks issued since the last healthy tick
    pub rollbacks_since_healthy: u32,
    /// Operator escalated; no further action until healthy
    pub escalated: bool,
    /// Time of the last completed tick
    pub last_tick: Option<DateTime<Utc>>,
    /// Last action other than `None`
    pub last_action: Option<WatchdogAction>,
}

impl WatchdogState {
    /// Load from `path`
    ///
    /// A missing or unreadable file starts from zero counters.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed watchdog state");
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read watchdog state");
                Self::default()
            }
        }
    }

    /// Persist atomically to `path`
    ///
    /// # Errors
    /// Returns `StoreError` if the file cannot be written
    pub fn save(&self, path: &Path) -> std::result::Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Malformed {
            what: "watchdog state",
            path: path.to_path_buf(),
            source,
        })?;
        atomic_write(path, &json)
    }
}

/// Failure-count thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Consecutive failures before a restart
    pub restart_threshold: u32,
    /// Consecutive failures before a rollback and restart
    pub rollback_threshold: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            restart_threshold: 3,
            rollback_threshold: 6,
        }
    }
}

impl From<&WatchdogConfig> for EscalationPolicy {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            restart_threshold: config.restart_threshold,
            rollback_threshold: config.rollback_threshold,
        }
    }
}

impl EscalationPolicy {
    /// Advance `state` by one tick
    #[must_use]
    pub fn step(&self, state: &mut WatchdogState, healthy: bool) -> WatchdogAction {
        if healthy {
            state.consecutive_failures = 0;
            state.rollbacks_since_healthy = 0;
            state.escalated = false;
            return WatchdogAction::None;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.escalated {
            return WatchdogAction::None;
        }

        if state.consecutive_failures >= self.rollback_threshold {
            if state.rollbacks_since_healthy > 0 {
                state.escalated = true;
                return WatchdogAction::Escalate;
            }
            state.rollbacks_since_healthy += 1;
            state.consecutive_failures = 0;
            return WatchdogAction::RollbackAndRestart;
        }
        if state.consecutive_failures == self.restart_threshold {
            return WatchdogAction::Restart;
        }
        WatchdogAction::None
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Tick time
    pub at: DateTime<Utc>,
    /// Process liveness
    pub process_alive: bool,
    /// Health endpoint sample
    pub health: HealthStatus,
    /// Integration samples (never counted)
    pub integrations: Vec<IntegrationStatus>,
    /// Failure count after the tick
    pub consecutive_failures: u32,
    /// Decision
    pub action: WatchdogAction,
    /// Rollback postponed because a mutation holds the lock
    pub deferred: bool,
    /// Faults met while carrying out the action
    pub errors: Vec<String>,
}

impl TickReport {
    /// Host counted as healthy on this tick
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.process_alive && self.health.healthy
    }
}

/// Periodic liveness monitor with restart and rollback escalation
pub struct Watchdog {
    supervisor: Arc<dyn ProcessSupervisor>,
    store: SnapshotStore,
    live: LiveDocument,
    notifier: Arc<dyn Notifier>,
    audit: Option<Arc<AuditLog>>,
    policy: EscalationPolicy,
    interval: Duration,
    lock_stale_after: Duration,
    state_file: Option<PathBuf>,
    state: WatchdogState,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("policy", &self.policy)
            .field("interval", &self.interval)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    /// Watchdog with `[watchdog]` thresholds and in-memory counters
    #[must_use]
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        store: SnapshotStore,
        live: LiveDocument,
        config: &WatchdogConfig,
    ) -> Self {
        Self {
            supervisor,
            store,
            live,
            notifier: Arc::new(LogNotifier),
            audit: None,
            policy: EscalationPolicy::from(config),
            interval: Duration::from_secs(config.interval_secs),
            lock_stale_after: Duration::from_secs(600),
            state_file: None,
            state: WatchdogState::default(),
        }
    }

    /// With an escalation channel
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// With an audit journal
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Load counters from, and save them to, `path`
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.state = WatchdogState::load(&path);
        self.state_file = Some(path);
        self
    }

    /// With a lock stale horizon
    #[must_use]
    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    /// Current counters
    #[inline]
    #[must_use]
    pub fn state(&self) -> &WatchdogState {
        &self.state
    }

    /// Sample the host once and act on the result
    ///
    /// # Errors
    /// Returns `GuardError::Store` if the lock or state file cannot be read
    /// or written. Restart, restore and notification failures are reported
    /// in the tick instead.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let at = Utc::now();
        let process_alive = self.supervisor.process_alive().await;
        let health = if process_alive {
            self.supervisor.health_check().await
        } else {
            HealthStatus::unhealthy(Duration::ZERO, "process not running")
        };
        let integrations = self.supervisor.integration_health().await;
        for integration in integrations.iter().filter(|i| !i.status.healthy) {
            tracing::warn!(
                integration = %integration.name,
                detail = integration.status.detail.as_deref().unwrap_or(""),
                "integration unhealthy"
            );
        }

        let healthy = process_alive && health.healthy;
        let mut next = self.state.clone();
        let action = self.policy.step(&mut next, healthy);
        let mut report = TickReport {
            at,
            process_alive,
            health,
            integrations,
            consecutive_failures: next.consecutive_failures,
            action,
            deferred: false,
            errors: Vec::new(),
        };

        if healthy {
            tracing::debug!(latency_ms = report.health.latency_ms, "watchdog tick healthy");
        } else {
            tracing::warn!(
                consecutive_failures = next.consecutive_failures,
                process_alive,
                action = action.as_str(),
                "watchdog tick unhealthy"
            );
        }

        match action {
            WatchdogAction::None => {}
            WatchdogAction::Restart => self.restart(&mut report).await,
            WatchdogAction::RollbackAndRestart => {
                if !self.roll_back(&mut report)? {
                    report.deferred = true;
                    report.consecutive_failures = self.state.consecutive_failures;
                    return Ok(report);
                }
                self.restart(&mut report).await;
            }
            WatchdogAction::Escalate => self.escalate(&mut report).await,
        }

        next.last_tick = Some(at);
        if action != WatchdogAction::None {
            next.last_action = Some(action);
            if let Some(audit) = &self.audit {
                if let Err(e) = audit.append("watchdog", &report) {
                    tracing::error!(error = %e, "failed to append audit record");
                }
            }
        }
        self.state = next;
        if let Some(path) = &self.state_file {
            self.state.save(path)?;
        }
        Ok(report)
    }

    /// Tick every interval until `shutdown` resolves
    ///
    /// # Errors
    /// Never returns an error; tick failures are logged and the loop goes on
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(interval_secs = self.interval.as_secs(), "watchdog started");

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("watchdog stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "watchdog tick failed");
                    }
                }
            }
        }
    }

    async fn restart(&self, report: &mut TickReport) {
        tracing::warn!(consecutive_failures = report.consecutive_failures, "restarting host");
        if let Err(e) = self.supervisor.restart().await {
            tracing::error!(error = %e, "host restart failed");
            report.errors.push(format!("restart failed: {e}"));
        }
    }

    /// Restore the latest snapshot; false when a mutation holds the lock
    fn roll_back(&self, report: &mut TickReport) -> Result<bool> {
        if let Some(holder) = MutationLock::holder(self.store.dir(), self.lock_stale_after)? {
            tracing::warn!(holder = %holder.holder, pid = holder.pid, "mutation in progress, deferring rollback");
            return Ok(false);
        }
        let _lock = match MutationLock::acquire(self.store.dir(), HOLDER, self.lock_stale_after) {
            Ok(lock) => lock,
            Err(StoreError::Locked { holder, .. }) => {
                tracing::warn!(holder = %holder, "mutation started, deferring rollback");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        match self.store.restore_latest(&self.live) {
            Ok(info) => {
                tracing::warn!(snapshot = %info.id, "watchdog restored latest snapshot");
            }
            Err(e) => {
                tracing::error!(error = %e, "watchdog rollback failed");
                report.errors.push(format!("restore failed: {e}"));
            }
        }
        Ok(true)
    }

    async fn escalate(&self, report: &mut TickReport) {
        tracing::error!("host still failing after watchdog rollback, escalating");
        let alert = Alert::critical(
            HOLDER,
            "host unhealthy after restart and rollback",
            format!(
                "process_alive={} health={}",
                report.process_alive,
                report.health.detail.as_deref().unwrap_or("unhealthy")
            ),
        );
        if let Err(e) = self.notifier.notify(&alert).await {
            tracing::error!(error = %e, "operator notification failed");
            report.errors.push(format!("notification failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(policy: &EscalationPolicy, ticks: &[bool]) -> Vec<WatchdogAction> {
        let mut state = WatchdogState::default();
        ticks.iter().map(|&h| policy.step(&mut state, h)).collect()
    }

    #[test]
    fn restart_at_three_rollback_at_six() {
        let actions = run(&EscalationPolicy::default(), &[false; 6]);
        assert_eq!(actions[2], WatchdogAction::Restart);
        assert_eq!(actions[5], WatchdogAction::RollbackAndRestart);
        assert_eq!(
            actions.iter().filter(|a| **a != WatchdogAction::None).count(),
            2
        );
    }

    #[test]
    fn second_rollback_threshold_escalates_once() {
        let actions = run(&EscalationPolicy::default(), &[false; 20]);
        assert_eq!(actions[8], WatchdogAction::Restart);
        assert_eq!(actions[11], WatchdogAction::Escalate);
        assert!(actions[12..].iter().all(|a| *a == WatchdogAction::None));
    }

    #[test]
    fn healthy_tick_resets_everything() {
        let policy = EscalationPolicy::default();
        let mut state = WatchdogState::default();
        for _ in 0..12 {
            let _ = policy.step(&mut state, false);
        }
        assert!(state.escalated);
        assert_eq!(policy.step(&mut state, true), WatchdogAction::None);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.escalated);

        let actions: Vec<_> = (0..3).map(|_| policy.step(&mut state, false)).collect();
        assert_eq!(actions[2], WatchdogAction::Restart);
    }

    #[test]
    fn state_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.json");
        let state = WatchdogState {
            consecutive_failures: 4,
            rollbacks_since_healthy: 1,
            escalated: false,
            last_tick: Some(Utc::now()),
            last_action: Some(WatchdogAction::Restart),
        };
        state.save(&path).unwrap();
        assert_eq!(WatchdogState::load(&path), state);
    }

    #[test]
    fn malformed_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.json");
        std::fs::write(&path, "{ torn").unwrap();
        assert_eq!(WatchdogState::load(&path), WatchdogState::default());
    }

    proptest! {
        #[test]
        fn rollback_never_precedes_restart(ticks in proptest::collection::vec(any::<bool>(), 0..64)) {
            let policy = EscalationPolicy::default();
            let mut state = WatchdogState::default();
            let mut restarted = false;
            for healthy in ticks {
                match policy.step(&mut state, healthy) {
                    WatchdogAction::Restart => restarted = true,
                    WatchdogAction::RollbackAndRestart | WatchdogAction::Escalate => {
                        prop_assert!(restarted);
                    }
                    WatchdogAction::None => {}
                }
                if healthy {
                    restarted = false;
                }
            }
        }
    }
}
