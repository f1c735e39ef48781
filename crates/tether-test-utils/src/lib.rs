//! Testing utilities for the Tether workspace
//!
//! Scripted host, recording notifier and throwaway workspaces wired to
//! real stores. Health windows keep their default lengths; tests run them
//! on tokio's paused clock.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tether_core::{
    Alert, ApplyOrchestrator, AuditLog, HealthConfig, HealthStatus, HostController, HostError,
    IntegrationStatus, MutationPipeline, Notifier, NotifyError, ProcessSupervisor,
    UpgradeOrchestrator, Watchdog, WatchdogConfig,
};
use tether_store::{LiveDocument, SnapshotStore, TreeManifest};
use tether_validate::{SemanticValidator, ValidationPolicy};

pub mod fixtures {
    /// Live document that validates clean under the default policy
    pub const LIVE_CONFIG: &str = r##"{
  "models": {
    "default": "agent-sonnet-4-5",
    "fallbacks": ["agent-haiku-3"]
  },
  "notifications": {
    "token": "123:abc",
    "chatId": "42"
  },
  "profiles": {
    "main": { "color": "#336699" }
  },
  "security": {
    "deny": ["rm -rf /", "mkfs"]
  }
}
"##;

    /// Dot-separated model identifier
    pub const DOTTED_IDENTIFIER_PATCH: &str = r#"{"models":{"default":"agent-sonnet-4.5"}}"#;

    /// Clean patch adding a fallback model
    pub const FALLBACK_PATCH: &str =
        r#"{"models":{"fallbacks":["agent-haiku-3","agent-opus-4"]},"logging":{"level":"debug"}}"#;

    /// Patch that replaces `notifications` without its token
    pub const DROP_TOKEN_PATCH: &str = r#"{"notifications":{"token":null}}"#;
}

// ---------------------------------------------------------------------------
// Mock host
// ---------------------------------------------------------------------------

/// Scripted host
///
/// Health answers come from the script first, then from the fallback.
/// A host built with [`MockHost::recovering_after_reloads`] answers
/// healthy once it has seen that many reloads.
#[derive(Debug)]
pub struct MockHost {
    script: Mutex<VecDeque<bool>>,
    fallback: AtomicBool,
    recover_after_reloads: Option<u32>,
    alive: AtomicBool,
    fail_reloads: AtomicBool,
    integrations: Mutex<Vec<(String, bool)>>,
    reloads: AtomicU32,
    restarts: AtomicU32,
    health_checks: AtomicU32,
}

impl MockHost {
    pub fn healthy() -> Self {
        Self::scripted([], true)
    }

    pub fn unhealthy() -> Self {
        Self::scripted([], false)
    }

    pub fn scripted(script: impl IntoIterator<Item = bool>, then: bool) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: AtomicBool::new(then),
            recover_after_reloads: None,
            alive: AtomicBool::new(true),
            fail_reloads: AtomicBool::new(false),
            integrations: Mutex::new(Vec::new()),
            reloads: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
        }
    }

    /// Unhealthy until the `n`th reload, e.g. 2 for "bad after apply, good after rollback"
    pub fn recovering_after_reloads(n: u32) -> Self {
        Self {
            recover_after_reloads: Some(n),
            ..Self::unhealthy()
        }
    }

    pub fn with_integration(self, name: &str, healthy: bool) -> Self {
        self.integrations.lock().push((name.to_string(), healthy));
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.script.lock().clear();
        self.fallback.store(healthy, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn fail_reloads(&self, fail: bool) {
        self.fail_reloads.store(fail, Ordering::SeqCst);
    }

    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostController for MockHost {
    async fn reload(&self) -> Result<(), HostError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reloads.load(Ordering::SeqCst) {
            return Err(HostError::NotConfigured("reload"));
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        let recovered = self
            .recover_after_reloads
            .is_some_and(|n| self.reloads.load(Ordering::SeqCst) >= n);
        let healthy = recovered
            || self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.fallback.load(Ordering::SeqCst));
        if healthy {
            HealthStatus::healthy(Duration::from_millis(1))
        } else {
            HealthStatus::unhealthy(Duration::from_millis(1), "scripted failure")
        }
    }
}

#[async_trait]
impl ProcessSupervisor for MockHost {
    async fn process_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn restart(&self) -> Result<(), HostError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn integration_health(&self) -> Vec<IntegrationStatus> {
        self.integrations
            .lock()
            .iter()
            .map(|(name, healthy)| IntegrationStatus {
                name: name.clone(),
                status: if *healthy {
                    HealthStatus::healthy(Duration::ZERO)
                } else {
                    HealthStatus::unhealthy(Duration::ZERO, "integration down")
                },
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Keeps every alert
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Temp dir with a live document, snapshot dir and plugin tree
#[derive(Debug)]
pub struct TestWorkspace {
    dir: TempDir,
    pub live_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub audit_path: PathBuf,
}

impl TestWorkspace {
    /// Workspace whose live document is [`fixtures::LIVE_CONFIG`]
    pub fn new() -> Self {
        Self::with_live(fixtures::LIVE_CONFIG)
    }

    pub fn with_live(contents: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path().to_path_buf();
        let ws = Self {
            live_path: root.join("config.json"),
            snapshot_dir: root.join(".tether/snapshots"),
            plugin_dir: root.join("plugins"),
            audit_path: root.join(".tether/audit.jsonl"),
            dir,
        };
        fs::write(&ws.live_path, contents).expect("write live document");
        fs::create_dir_all(&ws.plugin_dir).expect("create plugin dir");
        ws
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn live(&self) -> LiveDocument {
        LiveDocument::new(&self.live_path)
    }

    pub fn read_live(&self) -> String {
        fs::read_to_string(&self.live_path).expect("read live document")
    }

    pub fn write_live(&self, contents: &str) {
        fs::write(&self.live_path, contents).expect("write live document");
    }

    pub fn store(&self) -> SnapshotStore {
        SnapshotStore::open(&self.snapshot_dir).expect("open snapshot store")
    }

    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::new(AuditLog::open(&self.audit_path).expect("open audit log"))
    }

    /// Write a file into the live plugin tree
    pub fn write_plugin(&self, key: &str, contents: &str) {
        write_file(&self.plugin_dir, key, contents);
    }

    /// Create a staging directory holding `files`
    pub fn stage(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let staging = self.root().join("staging").join(name);
        fs::create_dir_all(&staging).expect("create staging dir");
        for (key, contents) in files {
            write_file(&staging, key, contents);
        }
        staging
    }

    pub fn plugin_manifest(&self) -> TreeManifest {
        TreeManifest::scan(&self.plugin_dir).expect("scan plugin tree")
    }

    pub fn pipeline(
        &self,
        host: Arc<MockHost>,
        notifier: Arc<RecordingNotifier>,
    ) -> Arc<MutationPipeline> {
        Arc::new(
            MutationPipeline::new(self.store(), host)
                .with_notifier(notifier)
                .with_audit(self.audit())
                .with_health(HealthConfig::default()),
        )
    }

    pub fn apply_orchestrator(
        &self,
        host: Arc<MockHost>,
        notifier: Arc<RecordingNotifier>,
    ) -> ApplyOrchestrator {
        self.apply_orchestrator_with(host, notifier, ValidationPolicy::default())
    }

    pub fn apply_orchestrator_with(
        &self,
        host: Arc<MockHost>,
        notifier: Arc<RecordingNotifier>,
        policy: ValidationPolicy,
    ) -> ApplyOrchestrator {
        ApplyOrchestrator::new(
            self.pipeline(host, notifier),
            self.live(),
            SemanticValidator::new(policy).expect("default policy compiles"),
        )
    }

    pub fn upgrade_orchestrator(
        &self,
        host: Arc<MockHost>,
        notifier: Arc<RecordingNotifier>,
    ) -> UpgradeOrchestrator {
        UpgradeOrchestrator::new(self.pipeline(host, notifier), &self.plugin_dir, "plugin.json")
    }

    pub fn watchdog(&self, host: Arc<MockHost>, notifier: Arc<RecordingNotifier>) -> Watchdog {
        Watchdog::new(host, self.store(), self.live(), &WatchdogConfig::default())
            .with_notifier(notifier)
            .with_audit(self.audit())
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

fn write_file(root: &Path, key: &str, contents: &str) {
    let path = root.join(key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(path, contents).expect("write file");
}

/// Parse JSON text into a value, for comparing documents structurally
pub fn json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).expect("valid JSON")
}
