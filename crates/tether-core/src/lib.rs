//! Tether Core - mutation orchestration
//!
//! The stateful half of the control plane:
//! - [`ApplyOrchestrator`]: snapshot, simulate, validate, write, confirm health, commit or revert
//! - [`UpgradeOrchestrator`]: the same cycle over a plugin tree, with checksum verification
//! - [`Watchdog`]: independent liveness monitor with restart and rollback escalation
//! - [`AuditLog`]: hash-chained journal of every finished attempt
//!
//! Host access goes through the [`HostController`] and [`ProcessSupervisor`]
//! capabilities, so every state machine here runs against a mock.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{ApplyOptions, ApplyOrchestrator, CommandHost, GuardConfig, MutationPipeline};
//! use tether_store::{LiveDocument, SnapshotStore};
//! use tether_validate::SemanticValidator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GuardConfig::load_or_default("tether.toml".as_ref())?;
//! let host = Arc::new(CommandHost::new(config.host.clone())?);
//! let store = SnapshotStore::open(&config.paths.snapshot_dir)?;
//! let pipeline = Arc::new(MutationPipeline::new(store, host).with_health(config.health.clone()));
//! let apply = ApplyOrchestrator::new(
//!     pipeline,
//!     LiveDocument::new(&config.paths.live_document),
//!     SemanticValidator::new(config.validation.policy.clone())?,
//! );
//!
//! let attempt = apply.apply(r#"{"models":{"default":"agent-sonnet-4-5"}}"#, ApplyOptions::default()).await?;
//! println!("{:?}", attempt.disposition);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod apply;
pub mod attempt;
pub mod audit;
pub mod config;
pub mod error;
pub mod health;
pub mod host;
pub mod notify;
pub mod pipeline;
pub mod state_machine;
pub mod upgrade;
pub mod watchdog;

pub use apply::ApplyOrchestrator;
pub use attempt::{ApplyOptions, Disposition, MutationAttempt, MutationKind, StateTransition};
pub use audit::{AuditLog, AuditRecord};
pub use config::{
    ConfigError, GuardConfig, HealthConfig, HostConfig, IntegrationConfig, LockConfig,
    NotifyConfig, PathsConfig, UpgradeConfig, ValidationConfig, WatchdogConfig,
};
pub use error::{AuditError, GuardError, HostError, NotifyError, Result, StateMachineError};
pub use health::{poll_until_healthy, HealthWindowKind, HealthWindowReport};
pub use host::{CommandHost, HealthStatus, HostController, IntegrationStatus, ProcessSupervisor};
pub use notify::{Alert, AlertLevel, LogNotifier, Notifier, WebhookNotifier};
pub use pipeline::MutationPipeline;
pub use state_machine::{allowed_transitions, validate_transition, ApplyState};
pub use upgrade::{
    resolve_descriptors, AtomicInstaller, FileInstaller, PluginDescriptor, UpgradeOrchestrator,
};
pub use watchdog::{EscalationPolicy, TickReport, Watchdog, WatchdogAction, WatchdogState};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
