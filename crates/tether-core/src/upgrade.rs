//! Upgrade orchestrator
//!
//! Apply's state machine over a plugin tree instead of one document:
//! - backup is a tree snapshot with a checksum manifest
//! - validation resolves plugin descriptors over the overlaid tree
//! - after writing, every file is re-hashed and compared with the
//!   expected manifest before the host is even reloaded

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tether_store::{atomic_write, resolve_key, ManifestDiff, StoreError, TreeManifest, TreeSnapshot};
use tether_validate::{Finding, Rule, ValidationReport};

use crate::attempt::{ApplyOptions, Disposition, MutationAttempt, MutationKind};
use crate::error::Result;
use crate::pipeline::MutationPipeline;
use crate::state_machine::ApplyState;

const HOLDER: &str = "upgrade";

/// Contents of a plugin descriptor file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginDescriptor {
    /// Plugin name, referenced by other plugins' dependencies
    pub name: String,
    /// Entry file relative to the plugin directory
    #[serde(default)]
    pub main: Option<String>,
    /// Names of plugins this one needs
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Copies one staged file into the live tree
pub trait FileInstaller: Send + Sync {
    /// Install `source` at `target`, creating parent directories
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the copy fails
    fn install(&self, source: &Path, target: &Path) -> std::result::Result<(), StoreError>;
}

/// Read-then-atomic-write installer
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicInstaller;

impl FileInstaller for AtomicInstaller {
    fn install(&self, source: &Path, target: &Path) -> std::result::Result<(), StoreError> {
        let bytes = fs::read(source).map_err(|e| StoreError::Io {
            context: "read staged file",
            path: source.to_path_buf(),
            source: e,
        })?;
        atomic_write(target, &bytes)
    }
}

/// Checksum-verified plugin tree upgrades
pub struct UpgradeOrchestrator {
    pipeline: Arc<MutationPipeline>,
    plugin_root: PathBuf,
    descriptor_name: String,
    installer: Arc<dyn FileInstaller>,
}

impl std::fmt::Debug for UpgradeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeOrchestrator")
            .field("plugin_root", &self.plugin_root)
            .field("descriptor_name", &self.descriptor_name)
            .finish_non_exhaustive()
    }
}

impl UpgradeOrchestrator {
    /// Create an orchestrator for the tree at `plugin_root`
    #[must_use]
    pub fn new(
        pipeline: Arc<MutationPipeline>,
        plugin_root: impl Into<PathBuf>,
        descriptor_name: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            plugin_root: plugin_root.into(),
            descriptor_name: descriptor_name.into(),
            installer: Arc::new(AtomicInstaller),
        }
    }

    /// Replace the file installer
    #[must_use]
    pub fn with_installer(mut self, installer: Arc<dyn FileInstaller>) -> Self {
        self.installer = installer;
        self
    }

    /// Live plugin tree
    #[inline]
    #[must_use]
    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    /// Resolve descriptors as if `staging` were installed, without writing
    ///
    /// # Errors
    /// Returns `GuardError::Store` if either tree cannot be scanned
    pub fn check(&self, staging: &Path) -> Result<ValidationReport> {
        let live = TreeManifest::scan(&self.plugin_root)?;
        let staged = TreeManifest::scan(staging)?;
        let sources = overlay(
            live.files.keys().map(|k| (k.clone(), self.plugin_root.clone())),
            &staged,
            staging,
        );
        Ok(ValidationReport::new(self.preflight(&staged, &sources)))
    }

    /// Differences between the latest tree snapshot and the live tree
    ///
    /// # Errors
    /// - `GuardError::Store` with `StoreError::NoSnapshots` if no tree
    ///   snapshot exists
    pub fn diff(&self) -> Result<ManifestDiff> {
        let store = self.pipeline.store();
        let snapshot = store
            .latest_tree()?
            .ok_or_else(|| StoreError::NoSnapshots(store.dir().to_path_buf()))?;
        let live = TreeManifest::scan(&self.plugin_root)?;
        Ok(snapshot.manifest.diff(&live))
    }

    /// Install the files under `staging` into the live tree
    ///
    /// # Errors
    /// - `GuardError::Store` if the lock is held, the tree snapshot cannot be
    ///   taken, or the staging directory cannot be read
    /// - `GuardError::Host` if a restart is requested and the host has no
    ///   reload capability
    pub async fn upgrade(&self, staging: &Path, options: ApplyOptions) -> Result<MutationAttempt> {
        self.pipeline.ensure_reloadable(options)?;
        let _permit = self.pipeline.begin(HOLDER).await?;
        let mut attempt =
            MutationAttempt::new(MutationKind::Upgrade, staging.display().to_string());

        attempt.transition(ApplyState::BackingUp)?;
        let snapshot = self.pipeline.store().create_tree(&self.plugin_root)?;
        attempt.snapshot = Some(snapshot.id.clone());

        attempt.transition(ApplyState::Validating)?;
        let staged = TreeManifest::scan(staging)?;
        let mut expected = snapshot.manifest.clone();
        for (key, hash) in &staged.files {
            expected.insert(key.clone(), *hash);
        }
        let sources = overlay(
            snapshot
                .manifest
                .files
                .keys()
                .map(|k| (k.clone(), snapshot.files_dir())),
            &staged,
            staging,
        );
        attempt.findings = self.preflight(&staged, &sources);
        if attempt.errors().next().is_some() {
            for error in attempt.errors() {
                tracing::warn!(attempt_id = %attempt.id, rule = %error.rule, "{}", error.message);
            }
            attempt.transition(ApplyState::Idle)?;
            attempt.finish(Disposition::Rejected);
            self.pipeline.record(&attempt);
            return Ok(attempt);
        }

        attempt.transition(ApplyState::Writing)?;
        if let Err(e) = self.install(&staged, staging) {
            tracing::error!(attempt_id = %attempt.id, error = %e, "plugin install failed");
            attempt.note(format!("install failed: {e}"));
            self.roll_back(&mut attempt, &snapshot, options).await?;
            return Ok(attempt);
        }

        attempt.transition(ApplyState::Verifying)?;
        let integrity = self.verify(&expected);
        if !integrity.is_empty() {
            for finding in &integrity {
                tracing::error!(attempt_id = %attempt.id, rule = %finding.rule, "{}", finding.message);
            }
            attempt.findings.extend(integrity);
            self.roll_back(&mut attempt, &snapshot, options).await?;
            return Ok(attempt);
        }

        if options.auto_restart {
            self.pipeline
                .settle(&mut attempt, || self.restore(&snapshot))
                .await?;
        } else {
            self.pipeline.commit_unverified(&mut attempt)?;
        }
        self.pipeline.record(&attempt);
        Ok(attempt)
    }

    async fn roll_back(
        &self,
        attempt: &mut MutationAttempt,
        snapshot: &TreeSnapshot,
        options: ApplyOptions,
    ) -> Result<()> {
        self.pipeline
            .roll_back(attempt, || self.restore(snapshot), options.auto_restart)
            .await?;
        self.pipeline.record(attempt);
        Ok(())
    }

    fn restore(&self, snapshot: &TreeSnapshot) -> std::result::Result<(), StoreError> {
        self.pipeline.store().restore_tree(snapshot, &self.plugin_root)
    }

    fn preflight(&self, staged: &TreeManifest, sources: &BTreeMap<String, PathBuf>) -> Vec<Finding> {
        if staged.is_empty() {
            return vec![Finding::error(Rule::Integrity, "staging directory contains no files")];
        }
        resolve_descriptors(sources, &self.descriptor_name)
    }

    fn install(&self, staged: &TreeManifest, staging: &Path) -> std::result::Result<(), StoreError> {
        for key in staged.files.keys() {
            let source = resolve_key(staging, key)?;
            let target = resolve_key(&self.plugin_root, key)?;
            self.installer.install(&source, &target)?;
        }
        tracing::info!(files = staged.len(), root = %self.plugin_root.display(), "staged files installed");
        Ok(())
    }

    fn verify(&self, expected: &TreeManifest) -> Vec<Finding> {
        let actual = match TreeManifest::scan(&self.plugin_root) {
            Ok(actual) => actual,
            Err(e) => {
                return vec![Finding::error(
                    Rule::Integrity,
                    format!("cannot checksum installed tree: {e}"),
                )]
            }
        };
        let drift = expected.diff(&actual);
        let mut findings: Vec<Finding> = drift
            .removed
            .iter()
            .map(|key| Finding::error(Rule::Integrity, format!("{key}: missing after install")))
            .chain(
                drift
                    .changed
                    .iter()
                    .map(|key| Finding::error(Rule::Integrity, format!("{key}: checksum mismatch"))),
            )
            .chain(
                drift
                    .added
                    .iter()
                    .map(|key| Finding::error(Rule::Integrity, format!("{key}: unexpected file"))),
            )
            .collect();

        let sources = actual
            .files
            .keys()
            .map(|k| (k.clone(), self.plugin_root.clone()))
            .collect();
        findings.extend(resolve_descriptors(&sources, &self.descriptor_name));
        findings
    }
}

/// Map every key to the root it should be read from, staged files winning
fn overlay(
    base: impl Iterator<Item = (String, PathBuf)>,
    staged: &TreeManifest,
    staging: &Path,
) -> BTreeMap<String, PathBuf> {
    let mut sources: BTreeMap<String, PathBuf> = base.collect();
    for key in staged.files.keys() {
        sources.insert(key.clone(), staging.to_path_buf());
    }
    sources
}

/// Check every descriptor in a tree given as key → root
///
/// A plugin resolves when its `main` file is in the tree and each of its
/// dependencies names a plugin that is.
pub fn resolve_descriptors(
    sources: &BTreeMap<String, PathBuf>,
    descriptor_name: &str,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut plugins = Vec::new();

    for (key, root) in sources {
        let (dir, file) = match key.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", key.as_str()),
        };
        if file != descriptor_name {
            continue;
        }
        let descriptor = resolve_key(root, key)
            .and_then(|path| {
                fs::read(&path).map_err(|e| StoreError::Io {
                    context: "read descriptor",
                    path,
                    source: e,
                })
            })
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<PluginDescriptor>(&bytes).map_err(|e| e.to_string())
            });
        match descriptor {
            Ok(descriptor) => plugins.push((dir.to_string(), descriptor)),
            Err(e) => findings.push(Finding::error(
                Rule::UnresolvedDependency,
                format!("{key}: unreadable descriptor: {e}"),
            )),
        }
    }

    for (dir, plugin) in &plugins {
        if let Some(main) = &plugin.main {
            let main = main.trim_start_matches("./");
            let entry = if dir.is_empty() {
                main.to_string()
            } else {
                format!("{dir}/{main}")
            };
            if !sources.contains_key(&entry) {
                findings.push(Finding::error(
                    Rule::UnresolvedDependency,
                    format!("plugin '{}': entry point '{entry}' not found", plugin.name),
                ));
            }
        }
        for dependency in &plugin.dependencies {
            if !plugins.iter().any(|(_, p)| &p.name == dependency) {
                findings.push(Finding::error(
                    Rule::UnresolvedDependency,
                    format!("plugin '{}': dependency '{dependency}' is not installed", plugin.name),
                ));
            }
        }
    }
    findings
}
