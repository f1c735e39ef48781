//! Shared mutation pipeline
//!
//! Apply and upgrade differ only in what they write and how they restore.
//! Everything after the write lives here:
//! - serialization of attempts (in-process mutex plus cross-process lock)
//! - reload signal and bounded health window
//! - rollback with its shorter window
//! - operator escalation and the audit record

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tether_store::{
    LiveDocument, MutationLock, SnapshotInfo, SnapshotStore, StoreError, TreeSnapshot,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::attempt::{ApplyOptions, Disposition, MutationAttempt};
use crate::audit::AuditLog;
use crate::config::HealthConfig;
use crate::error::{HostError, Result};
use crate::health::{poll_until_healthy, HealthWindowKind, HealthWindowReport};
use crate::host::HostController;
use crate::notify::{Alert, LogNotifier, Notifier};
use crate::state_machine::ApplyState;

const SNAPSHOT_HOLDER: &str = "snapshot";

/// Held for the whole of one attempt
pub(crate) struct PipelinePermit<'a> {
    _serial: MutexGuard<'a, ()>,
    _lock: MutationLock,
}

/// Components shared by the orchestrators
pub struct MutationPipeline {
    store: SnapshotStore,
    host: Arc<dyn HostController>,
    notifier: Arc<dyn Notifier>,
    audit: Option<Arc<AuditLog>>,
    health: HealthConfig,
    lock_stale_after: Duration,
    serial: Mutex<()>,
}

impl std::fmt::Debug for MutationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPipeline")
            .field("store", &self.store)
            .field("health", &self.health)
            .field("audit", &self.audit.as_ref().map(|a| a.path().to_path_buf()))
            .finish_non_exhaustive()
    }
}

impl MutationPipeline {
    /// Pipeline with default windows, log-only escalation and no journal
    #[must_use]
    pub fn new(store: SnapshotStore, host: Arc<dyn HostController>) -> Self {
        Self {
            store,
            host,
            notifier: Arc::new(LogNotifier),
            audit: None,
            health: HealthConfig::default(),
            lock_stale_after: Duration::from_secs(600),
            serial: Mutex::new(()),
        }
    }

    /// With an escalation channel
    #[inline]
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// With an audit journal
    #[inline]
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// With health windows
    #[inline]
    #[must_use]
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// With a lock stale horizon
    #[inline]
    #[must_use]
    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    /// Snapshot store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Health window settings
    #[inline]
    #[must_use]
    pub fn health(&self) -> &HealthConfig {
        &self.health
    }

    /// Refuse an auto-restart mutation when the host cannot be reloaded
    ///
    /// Checked before anything is snapshotted or written; otherwise both
    /// health windows would fail on the missing reload and page the
    /// operator for a healthy host.
    pub(crate) fn ensure_reloadable(&self, options: ApplyOptions) -> Result<()> {
        if options.auto_restart && !self.host.can_reload() {
            return Err(HostError::NotConfigured("reload").into());
        }
        Ok(())
    }

    /// Take the lock and snapshot the live document out of band
    ///
    /// Snapshots move `LATEST`, so they serialize with mutations: one taken
    /// mid-apply would point `LATEST` at an unverified candidate.
    ///
    /// # Errors
    /// `GuardError::Store` if the lock is held or the snapshot fails
    pub async fn snapshot_document(&self, live: &LiveDocument) -> Result<SnapshotInfo> {
        let _permit = self.begin(SNAPSHOT_HOLDER).await?;
        Ok(self.store.capture(live)?)
    }

    /// Take the lock and snapshot the tree under `root`
    ///
    /// # Errors
    /// `GuardError::Store` if the lock is held or the snapshot fails
    pub async fn snapshot_tree(&self, root: &Path) -> Result<TreeSnapshot> {
        let _permit = self.begin(SNAPSHOT_HOLDER).await?;
        Ok(self.store.create_tree(root)?)
    }

    /// Wait for in-process attempts, then take the cross-process lock
    pub(crate) async fn begin(&self, holder: &str) -> Result<PipelinePermit<'_>> {
        let serial = self.serial.lock().await;
        let lock = MutationLock::acquire(self.store.dir(), holder, self.lock_stale_after)?;
        Ok(PipelinePermit {
            _serial: serial,
            _lock: lock,
        })
    }

    /// Reload, wait for health, and commit or roll back
    ///
    /// Entered from `Writing` or `Verifying` with the change on disk.
    pub(crate) async fn settle<F>(&self, attempt: &mut MutationAttempt, restore: F) -> Result<()>
    where
        F: Fn() -> std::result::Result<(), StoreError> + Sync,
    {
        attempt.transition(ApplyState::AwaitingHealth)?;
        let window = self
            .signal_and_wait(HealthWindowKind::Apply, self.health.apply_timeout())
            .await;
        let confirmed = window.confirmed;
        attempt.health_windows.push(window);

        if confirmed {
            attempt.health_verified = true;
            attempt.transition(ApplyState::Committed)?;
            attempt.transition(ApplyState::Idle)?;
            attempt.finish(Disposition::Committed);
            return Ok(());
        }

        tracing::warn!(
            attempt_id = %attempt.id,
            timeout_secs = self.health.apply_timeout_secs,
            "host did not confirm health, rolling back"
        );
        self.roll_back(attempt, restore, true).await
    }

    /// Commit without touching the host
    pub(crate) fn commit_unverified(&self, attempt: &mut MutationAttempt) -> Result<()> {
        attempt.health_verified = false;
        attempt.transition(ApplyState::Committed)?;
        attempt.transition(ApplyState::Idle)?;
        attempt.finish(Disposition::Committed);
        Ok(())
    }

    /// Restore, reload and run the shorter rollback window
    ///
    /// Ends in `Idle` (rolled back) or `FatalUnrecoverable` (operator
    /// notified). With `reload` false the host is left alone and the
    /// restore alone decides the outcome.
    pub(crate) async fn roll_back<F>(
        &self,
        attempt: &mut MutationAttempt,
        restore: F,
        reload: bool,
    ) -> Result<()>
    where
        F: Fn() -> std::result::Result<(), StoreError> + Sync,
    {
        attempt.transition(ApplyState::RollingBack)?;

        if let Err(e) = restore() {
            tracing::error!(attempt_id = %attempt.id, error = %e, "snapshot restore failed");
            attempt.note(format!("restore failed: {e}"));
            return self
                .fail_fatally(attempt, format!("snapshot restore failed: {e}"))
                .await;
        }

        if !reload {
            attempt.transition(ApplyState::Idle)?;
            attempt.finish(Disposition::RolledBack);
            return Ok(());
        }

        let window = self
            .signal_and_wait(HealthWindowKind::Rollback, self.health.rollback_timeout())
            .await;
        let confirmed = window.confirmed;
        attempt.health_windows.push(window);

        if confirmed {
            attempt.health_verified = true;
            attempt.transition(ApplyState::Idle)?;
            attempt.finish(Disposition::RolledBack);
            tracing::warn!(attempt_id = %attempt.id, "change rejected, system restored");
            Ok(())
        } else {
            self.fail_fatally(
                attempt,
                "host still unhealthy after restoring the last snapshot".to_string(),
            )
            .await
        }
    }

    async fn fail_fatally(&self, attempt: &mut MutationAttempt, reason: String) -> Result<()> {
        attempt.transition(ApplyState::FatalUnrecoverable)?;
        attempt.escalation = Some(reason.clone());
        attempt.finish(Disposition::FatalRollbackFailure);
        tracing::error!(attempt_id = %attempt.id, reason = %reason, "automatic recovery failed");

        let alert = Alert::critical(
            attempt.kind.as_str(),
            format!("{} failed and automatic rollback did not recover the host", attempt.kind.as_str()),
            reason,
        )
        .for_attempt(attempt.id);
        if let Err(e) = self.notifier.notify(&alert).await {
            tracing::error!(attempt_id = %attempt.id, error = %e, "operator notification failed");
            attempt.note(format!("notification failed: {e}"));
        }
        Ok(())
    }

    async fn signal_and_wait(&self, kind: HealthWindowKind, timeout: Duration) -> HealthWindowReport {
        if let Err(e) = self.host.reload().await {
            tracing::warn!(window = ?kind, error = %e, "reload signal failed");
            return HealthWindowReport::reload_failed(kind, timeout, e);
        }
        poll_until_healthy(self.host.as_ref(), kind, self.health.poll_interval(), timeout).await
    }

    /// Append the finished attempt to the journal
    ///
    /// Journal failures are logged; they never change the outcome.
    pub(crate) fn record(&self, attempt: &MutationAttempt) {
        let Some(audit) = &self.audit else { return };
        if let Err(e) = audit.append(attempt.kind.as_str(), attempt) {
            tracing::error!(attempt_id = %attempt.id, error = %e, "failed to append audit record");
        }
    }
}
