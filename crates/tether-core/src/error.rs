//! Error types for the control plane
//!
//! Validation failures and rollbacks are not errors: they are dispositions
//! on a [`MutationAttempt`](crate::MutationAttempt). The types here cover
//! infrastructure faults:
//! - Host control (reload, restart, health checks)
//! - Operator notification
//! - Audit journal I/O and chain integrity
//! - Illegal state transitions

use std::path::PathBuf;

use tether_document::DocumentError;
use tether_store::StoreError;
use tether_validate::PolicyError;

use crate::config::ConfigError;
use crate::state_machine::ApplyState;

/// Main guard error type
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Configuration is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Snapshot store or live document I/O failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Validator policy does not compile
    #[error("validation policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The live document itself does not parse
    #[error("live document is not a valid document: {0}")]
    LiveDocument(DocumentError),

    /// Host control failed outside a health window
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Audit journal failure
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// State machine misuse
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Automatic recovery failed; a human has to act
    #[error("requires operator intervention: {reason} (attempt {attempt_id})")]
    RequiresOperator {
        /// Attempt that failed to recover
        attempt_id: String,
        /// What went wrong
        reason: String,
    },
}

impl GuardError {
    /// Check if a human has to act
    #[inline]
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(self, Self::RequiresOperator { .. })
    }

    /// Check if the error is lock contention
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Store(StoreError::Locked { .. }))
    }
}

/// Host control errors
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// No command configured for the operation
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    /// Command could not be started
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Command line
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exited unsuccessfully
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        /// Command line
        command: String,
        /// Exit status description
        status: String,
        /// Captured stderr (trimmed)
        stderr: String,
    },

    /// Command did not finish in time
    #[error("'{command}' timed out after {timeout_secs}s")]
    Timeout {
        /// Command line
        command: String,
        /// Limit
        timeout_secs: u64,
    },

    /// HTTP health check failed
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Transport failure
    #[error("notification transport failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a failure status
    #[error("notification endpoint returned status {0}")]
    Rejected(u16),
}

/// Audit journal errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Journal I/O failed
    #[error("audit journal '{}': {source}", path.display())]
    Io {
        /// Journal path
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded or decoded
    #[error("audit record at line {line}: {source}")]
    Malformed {
        /// 1-based line
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Hash chain is broken
    #[error("audit chain broken at line {line}: {reason}")]
    Broken {
        /// 1-based line
        line: usize,
        /// Mismatch description
        reason: String,
    },
}

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the allowed table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Current state
        from: ApplyState,
        /// Requested state
        to: ApplyState,
    },
}

/// Result alias for guard operations
pub type Result<T, E = GuardError> = std::result::Result<T, E>;
