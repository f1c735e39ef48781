//! Apply orchestrator
//!
//! Drives one configuration patch through snapshot, simulation,
//! validation, write and health confirmation. A rejected patch never
//! touches the live document; a committed one is exactly the simulated
//! merge; anything else ends with the pre-apply bytes restored or an
//! operator alert.

use std::sync::Arc;

use tether_document::{diff, simulate, Change, ConfigDocument, Patch};
use tether_store::{LiveDocument, StoreError};
use tether_validate::{Finding, Rule, SemanticValidator, ValidationReport};

use crate::attempt::{ApplyOptions, Disposition, MutationAttempt, MutationKind};
use crate::error::{GuardError, Result};
use crate::pipeline::MutationPipeline;
use crate::state_machine::ApplyState;

/// Lock holder name for apply and manual rollback
const HOLDER: &str = "apply";

/// Validated, health-checked configuration changes
#[derive(Debug)]
pub struct ApplyOrchestrator {
    pipeline: Arc<MutationPipeline>,
    live: LiveDocument,
    validator: SemanticValidator,
}

impl ApplyOrchestrator {
    /// Create an orchestrator for `live`
    #[must_use]
    pub fn new(
        pipeline: Arc<MutationPipeline>,
        live: LiveDocument,
        validator: SemanticValidator,
    ) -> Self {
        Self {
            pipeline,
            live,
            validator,
        }
    }

    /// Live document
    #[inline]
    #[must_use]
    pub fn live(&self) -> &LiveDocument {
        &self.live
    }

    /// Validator in use
    #[inline]
    #[must_use]
    pub fn validator(&self) -> &SemanticValidator {
        &self.validator
    }

    /// Validate a complete document without writing anything
    ///
    /// The regression baseline is what an apply would snapshot right now:
    /// the live document, or the latest snapshot if the live document is
    /// unreadable.
    ///
    /// # Errors
    /// Returns `GuardError::Store` if the snapshot store cannot be read
    pub fn check_document(&self, text: &str) -> Result<ValidationReport> {
        let baseline = self.baseline()?;
        Ok(self.validator.validate_text(text, baseline.as_ref()))
    }

    /// Validate the result of merging `patch_text` into the live document
    ///
    /// # Errors
    /// - `GuardError::Store` if the live document cannot be read
    /// - `GuardError::LiveDocument` if it does not parse
    pub fn check_patch(&self, patch_text: &str) -> Result<ValidationReport> {
        let patch = match Patch::parse(patch_text) {
            Ok(patch) => patch,
            Err(e) => return Ok(syntax_report(&e)),
        };
        let current = self.load_live()?;
        let candidate = simulate(&current, &patch);
        Ok(self.validator.validate(&candidate, Some(&current)))
    }

    /// Apply a patch
    ///
    /// Validation findings and rollbacks are reported through the returned
    /// attempt's disposition; `Err` is reserved for infrastructure faults
    /// (lock contention, unreadable live document, snapshot I/O).
    ///
    /// # Errors
    /// - `GuardError::Store` if the lock is held or the snapshot cannot be
    ///   taken or the write fails before anything is on disk
    /// - `GuardError::LiveDocument` if the live document does not parse
    /// - `GuardError::Host` with `HostError::NotConfigured` if a restart is
    ///   requested and the host has no reload capability
    pub async fn apply(&self, patch_text: &str, options: ApplyOptions) -> Result<MutationAttempt> {
        self.pipeline.ensure_reloadable(options)?;
        let _permit = self.pipeline.begin(HOLDER).await?;
        let mut attempt = MutationAttempt::new(MutationKind::Apply, patch_text);

        attempt.transition(ApplyState::BackingUp)?;
        let snapshot = self.pipeline.store().capture(&self.live)?;
        attempt.snapshot = Some(snapshot.id.clone());

        attempt.transition(ApplyState::Validating)?;
        let patch = match Patch::parse(patch_text) {
            Ok(patch) => patch,
            Err(e) => {
                attempt.findings = syntax_report(&e).findings;
                return self.reject(attempt);
            }
        };
        let current = self.load_live()?;
        let candidate = simulate(&current, &patch);
        let report = self.validator.validate(&candidate, Some(&current));
        for warning in report.warnings() {
            tracing::warn!(attempt_id = %attempt.id, rule = %warning.rule, "{}", warning.message);
        }
        let rejected = report.has_errors();
        attempt.findings = report.findings;
        if rejected {
            return self.reject(attempt);
        }

        attempt.transition(ApplyState::Writing)?;
        if let Err(e) = self.live.write_document(&candidate) {
            tracing::error!(attempt_id = %attempt.id, error = %e, "live write failed");
            attempt.note(format!("write failed: {e}"));
            self.pipeline
                .roll_back(&mut attempt, || self.restore(&snapshot.id), options.auto_restart)
                .await?;
            self.pipeline.record(&attempt);
            return Ok(attempt);
        }

        if options.auto_restart {
            self.pipeline
                .settle(&mut attempt, || self.restore(&snapshot.id))
                .await?;
        } else {
            self.pipeline.commit_unverified(&mut attempt)?;
        }
        self.pipeline.record(&attempt);
        Ok(attempt)
    }

    /// Restore the latest snapshot onto the live document
    ///
    /// Takes no new snapshot, so repeating it is idempotent.
    ///
    /// # Errors
    /// - `GuardError::Store` with `StoreError::NoSnapshots` if there is
    ///   nothing to restore, or if the lock is held
    /// - `GuardError::Host` if a restart is requested and the host has no
    ///   reload capability
    pub async fn rollback(&self, options: ApplyOptions) -> Result<MutationAttempt> {
        self.pipeline.ensure_reloadable(options)?;
        let _permit = self.pipeline.begin(HOLDER).await?;
        let latest = self
            .pipeline
            .store()
            .latest()?
            .ok_or_else(|| StoreError::NoSnapshots(self.pipeline.store().dir().to_path_buf()))?;

        let mut attempt = MutationAttempt::new(MutationKind::Rollback, latest.id.to_string());
        attempt.snapshot = Some(latest.id.clone());
        self.pipeline
            .roll_back(&mut attempt, || self.restore(&latest.id), options.auto_restart)
            .await?;
        self.pipeline.record(&attempt);
        Ok(attempt)
    }

    /// Differences between the latest snapshot and the live document
    ///
    /// # Errors
    /// - `GuardError::Store` with `StoreError::NoSnapshots` on an empty store
    /// - `GuardError::LiveDocument` if either side does not parse
    pub fn diff(&self) -> Result<Vec<Change>> {
        let store = self.pipeline.store();
        let latest = store
            .latest()?
            .ok_or_else(|| StoreError::NoSnapshots(store.dir().to_path_buf()))?;
        let bytes = store.read(&latest.id)?;
        let before = ConfigDocument::parse(&String::from_utf8_lossy(&bytes))
            .map_err(GuardError::LiveDocument)?;
        let after = self.load_live()?;
        Ok(diff(&before, &after))
    }

    fn reject(&self, mut attempt: MutationAttempt) -> Result<MutationAttempt> {
        for error in attempt.errors() {
            tracing::warn!(attempt_id = %attempt.id, rule = %error.rule, "{}", error.message);
        }
        attempt.transition(ApplyState::Idle)?;
        attempt.finish(Disposition::Rejected);
        self.pipeline.record(&attempt);
        Ok(attempt)
    }

    fn restore(&self, id: &tether_store::SnapshotId) -> std::result::Result<(), StoreError> {
        self.pipeline.store().restore(id, &self.live).map(|_| ())
    }

    fn load_live(&self) -> Result<ConfigDocument> {
        let text = self.live.read_text()?;
        ConfigDocument::parse(&text).map_err(GuardError::LiveDocument)
    }

    fn baseline(&self) -> Result<Option<ConfigDocument>> {
        if let Ok(doc) = self.load_live() {
            return Ok(Some(doc));
        }
        let store = self.pipeline.store();
        let Some(latest) = store.latest()? else {
            return Ok(None);
        };
        let bytes = store.read(&latest.id)?;
        Ok(ConfigDocument::parse(&String::from_utf8_lossy(&bytes)).ok())
    }
}

fn syntax_report(error: &tether_document::DocumentError) -> ValidationReport {
    ValidationReport::new(vec![Finding::error(Rule::Syntax, error.to_string())])
}
