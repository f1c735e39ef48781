//! Mutation state machine
//!
//! Shared by the apply and upgrade orchestrators. `Verifying` is only
//! entered by upgrades; `Idle → RollingBack` only by a manual rollback.
//!
//! ```text
//! Idle → BackingUp → Validating ─┬→ Idle                       (rejected, no write)
//!                                └→ Writing ─┬→ Verifying ──┐
//!                                            └──────────────┴→ AwaitingHealth ─┬→ Committed → Idle
//!                                                                              └→ RollingBack ─┬→ Idle
//!                                                                                              └→ FatalUnrecoverable
//! ```

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::StateMachineError;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    /// No mutation in flight
    Idle,
    /// Taking the pre-mutation snapshot
    BackingUp,
    /// Simulating and validating the candidate
    Validating,
    /// Writing the candidate to live state
    Writing,
    /// Checking written files against the expected manifest
    Verifying,
    /// Waiting for the host to confirm health
    AwaitingHealth,
    /// Change accepted
    Committed,
    /// Restoring the snapshot
    RollingBack,
    /// Rollback failed; operator notified
    FatalUnrecoverable,
}

impl ApplyState {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::BackingUp => "backing_up",
            Self::Validating => "validating",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::AwaitingHealth => "awaiting_health",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::FatalUnrecoverable => "fatal_unrecoverable",
        }
    }

    /// True for states with no successors
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

impl Display for ApplyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a state transition
///
/// # Errors
/// Returns `StateMachineError::IllegalTransition` if `to` is not reachable
/// from `from` in one step
pub fn validate_transition(from: ApplyState, to: ApplyState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// Successors of a state
#[must_use]
pub fn allowed_transitions(from: ApplyState) -> &'static [ApplyState] {
    use ApplyState::*;
    match from {
        // RollingBack directly for an operator-requested rollback
        Idle => &[BackingUp, RollingBack],
        BackingUp => &[Validating],
        Validating => &[Writing, Idle],
        // Committed directly when the host is not restarted
        Writing => &[Verifying, AwaitingHealth, Committed, RollingBack],
        Verifying => &[AwaitingHealth, Committed, RollingBack],
        AwaitingHealth => &[Committed, RollingBack],
        Committed => &[Idle],
        RollingBack => &[Idle, FatalUnrecoverable],
        FatalUnrecoverable => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplyState::*;

    const ALL: [ApplyState; 9] = [
        Idle,
        BackingUp,
        Validating,
        Writing,
        Verifying,
        AwaitingHealth,
        Committed,
        RollingBack,
        FatalUnrecoverable,
    ];

    #[test]
    fn happy_path_is_legal() {
        let path = [Idle, BackingUp, Validating, Writing, AwaitingHealth, Committed, Idle];
        for pair in path.windows(2) {
            validate_transition(pair[0], pair[1]).unwrap();
        }
    }

    #[test]
    fn rejection_returns_to_idle_without_writing() {
        validate_transition(Validating, Idle).unwrap();
        assert!(validate_transition(BackingUp, Writing).is_err());
    }

    #[test]
    fn no_write_before_backup() {
        assert!(validate_transition(Idle, Writing).is_err());
        assert!(validate_transition(Idle, Validating).is_err());
    }

    #[test]
    fn fatal_is_the_only_terminal_state() {
        let terminal: Vec<_> = ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![FatalUnrecoverable]);
    }

    #[test]
    fn illegal_transition_error_names_states() {
        let err = validate_transition(Committed, RollingBack).unwrap_err();
        assert_eq!(err.to_string(), "illegal transition committed -> rolling_back");
    }
}
