//! Mutation attempt record
//!
//! Transient: one per apply, upgrade or manual rollback. Written to the
//! audit journal when it finishes and never read back to make decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_store::SnapshotId;
use tether_validate::Finding;
use ulid::Ulid;

use crate::error::{GuardError, StateMachineError};
use crate::health::HealthWindowReport;
use crate::state_machine::{validate_transition, ApplyState};

/// What was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Configuration patch
    Apply,
    /// Plugin tree upgrade
    Upgrade,
    /// Operator-requested restore of the latest snapshot
    Rollback,
}

impl MutationKind {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Upgrade => "upgrade",
            Self::Rollback => "rollback",
        }
    }
}

/// Final outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Validation failed; nothing was written
    Rejected,
    /// Change is live
    Committed,
    /// Change was reverted and the host is healthy again
    RolledBack,
    /// Reverting did not restore health; operator notified
    FatalRollbackFailure,
}

impl Disposition {
    /// Process exit code for the CLI
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Committed => 0,
            Self::Rejected => 1,
            Self::RolledBack => 2,
            Self::FatalRollbackFailure => 3,
        }
    }
}

/// Options shared by apply and upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Reload the host and run a health window after writing
    pub auto_restart: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { auto_restart: true }
    }
}

impl ApplyOptions {
    /// Write and commit without touching the host
    #[must_use]
    pub fn without_restart() -> Self {
        Self {
            auto_restart: false,
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Previous state
    pub from: ApplyState,
    /// New state
    pub to: ApplyState,
    /// When
    pub at: DateTime<Utc>,
}

/// Record of one mutation cycle
#[derive(Debug, Clone, Serialize)]
pub struct MutationAttempt {
    /// Attempt id
    pub id: Ulid,
    /// What was attempted
    pub kind: MutationKind,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time, once finished
    pub finished_at: Option<DateTime<Utc>>,
    /// Patch text or staging directory
    pub proposal: String,
    /// Snapshot taken before any write
    pub snapshot: Option<SnapshotId>,
    /// Validation and integrity findings
    pub findings: Vec<Finding>,
    /// Health windows run, in order
    pub health_windows: Vec<HealthWindowReport>,
    /// Every state change
    pub transitions: Vec<StateTransition>,
    /// Current state
    pub state: ApplyState,
    /// False when committed without a health window
    pub health_verified: bool,
    /// Outcome, once finished
    pub disposition: Option<Disposition>,
    /// Non-fatal faults met on the way (reload errors, restore errors)
    pub notes: Vec<String>,
    /// Why automatic recovery failed, for `FatalRollbackFailure`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<String>,
}

impl MutationAttempt {
    /// New attempt in `Idle`
    #[must_use]
    pub fn new(kind: MutationKind, proposal: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            proposal: proposal.into(),
            snapshot: None,
            findings: Vec::new(),
            health_windows: Vec::new(),
            transitions: Vec::new(),
            state: ApplyState::Idle,
            health_verified: false,
            disposition: None,
            notes: Vec::new(),
            escalation: None,
        }
    }

    /// Move to `to`, recording and logging the change
    ///
    /// # Errors
    /// Returns `StateMachineError::IllegalTransition` for transitions outside
    /// the table; the state is left unchanged
    pub fn transition(&mut self, to: ApplyState) -> Result<(), StateMachineError> {
        validate_transition(self.state, to)?;
        tracing::info!(
            attempt_id = %self.id,
            kind = self.kind.as_str(),
            from = %self.state,
            state = %to,
            "state transition"
        );
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }

    /// Record the outcome
    pub fn finish(&mut self, disposition: Disposition) {
        self.disposition = Some(disposition);
        self.finished_at = Some(Utc::now());
        tracing::info!(
            attempt_id = %self.id,
            kind = self.kind.as_str(),
            disposition = ?disposition,
            state = %self.state,
            "mutation attempt finished"
        );
    }

    /// Record a non-fatal fault
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// States visited, starting from `Idle`
    #[must_use]
    pub fn path(&self) -> Vec<ApplyState> {
        std::iter::once(ApplyState::Idle)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    /// Blocking findings
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_error())
    }

    /// Non-blocking findings
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_error())
    }

    /// True once committed
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.disposition == Some(Disposition::Committed)
    }

    /// `GuardError::RequiresOperator` if automatic recovery failed
    #[must_use]
    pub fn operator_error(&self) -> Option<GuardError> {
        (self.disposition == Some(Disposition::FatalRollbackFailure)).then(|| {
            GuardError::RequiresOperator {
                attempt_id: self.id.to_string(),
                reason: self
                    .escalation
                    .clone()
                    .unwrap_or_else(|| "automatic rollback failed".to_string()),
            }
        })
    }

    /// The attempt, or `Err` when a human has to act
    ///
    /// For callers that treat a failed recovery like any other error and
    /// propagate it with `?`.
    ///
    /// # Errors
    /// Returns `GuardError::RequiresOperator` for `FatalRollbackFailure`
    pub fn into_recovered(self) -> Result<Self, GuardError> {
        match self.operator_error() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_recorded() {
        let mut attempt = MutationAttempt::new(MutationKind::Apply, "{}");
        attempt.transition(ApplyState::BackingUp).unwrap();
        attempt.transition(ApplyState::Validating).unwrap();
        attempt.transition(ApplyState::Idle).unwrap();
        attempt.finish(Disposition::Rejected);

        assert_eq!(
            attempt.path(),
            vec![
                ApplyState::Idle,
                ApplyState::BackingUp,
                ApplyState::Validating,
                ApplyState::Idle
            ]
        );
        assert!(attempt.finished_at.is_some());
        assert!(!attempt.is_committed());
    }

    #[test]
    fn illegal_transition_leaves_state() {
        let mut attempt = MutationAttempt::new(MutationKind::Apply, "{}");
        assert!(attempt.transition(ApplyState::Writing).is_err());
        assert_eq!(attempt.state, ApplyState::Idle);
        assert!(attempt.transitions.is_empty());
    }

    #[test]
    fn fatal_attempt_requires_operator() {
        let mut attempt = MutationAttempt::new(MutationKind::Apply, "{}");
        attempt.transition(ApplyState::BackingUp).unwrap();
        attempt.transition(ApplyState::Validating).unwrap();
        attempt.transition(ApplyState::Writing).unwrap();
        attempt.transition(ApplyState::RollingBack).unwrap();
        attempt.transition(ApplyState::FatalUnrecoverable).unwrap();
        attempt.escalation = Some("host still unhealthy".to_string());
        attempt.finish(Disposition::FatalRollbackFailure);

        let err = attempt.clone().into_recovered().unwrap_err();
        assert!(err.requires_operator());
        assert!(err.to_string().contains("host still unhealthy"));
        assert!(err.to_string().contains(&attempt.id.to_string()));
    }

    #[test]
    fn settled_attempts_pass_through() {
        let mut attempt = MutationAttempt::new(MutationKind::Rollback, "latest");
        attempt.transition(ApplyState::RollingBack).unwrap();
        attempt.transition(ApplyState::Idle).unwrap();
        attempt.finish(Disposition::RolledBack);

        assert!(attempt.operator_error().is_none());
        assert_eq!(attempt.into_recovered().unwrap().disposition, Some(Disposition::RolledBack));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Disposition::Committed.exit_code(), 0);
        assert_eq!(Disposition::Rejected.exit_code(), 1);
        assert_eq!(Disposition::RolledBack.exit_code(), 2);
        assert_eq!(Disposition::FatalRollbackFailure.exit_code(), 3);
    }
}
