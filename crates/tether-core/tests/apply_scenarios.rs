//! Apply orchestrator end to end against a scripted host
//!
//! Health windows run at their default lengths on tokio's paused clock.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tether_core::{
    ApplyOptions, ApplyOrchestrator, ApplyState, AuditLog, CommandHost, Disposition, GuardError,
    HealthWindowKind, HostConfig, HostError, MutationPipeline,
};
use tether_document::{simulate, ConfigDocument, Patch};
use tether_store::MutationLock;
use tether_test_utils::{fixtures, json, MockHost, RecordingNotifier, TestWorkspace};
use tether_validate::{Rule, SemanticValidator, Severity, ValidationPolicy};

fn setup(host: MockHost) -> (TestWorkspace, Arc<MockHost>, Arc<RecordingNotifier>) {
    (
        TestWorkspace::new(),
        Arc::new(host),
        Arc::new(RecordingNotifier::new()),
    )
}

#[tokio::test(start_paused = true)]
async fn malformed_patch_is_rejected_without_write() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host.clone(), notifier);
    let before = ws.read_live();

    let report = apply.check_patch("{\"models\": ").unwrap();
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].rule, Rule::Syntax);

    let attempt = apply.apply("{\"models\": ", ApplyOptions::default()).await.unwrap();
    assert_eq!(attempt.disposition, Some(Disposition::Rejected));
    assert_eq!(attempt.errors().count(), 1);
    assert_eq!(ws.read_live(), before);
    assert_eq!(host.reloads(), 0);
}

#[tokio::test(start_paused = true)]
async fn dotted_identifier_is_rejected_without_write() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host.clone(), notifier);
    let before = ws.read_live();

    let report = apply.check_patch(fixtures::DOTTED_IDENTIFIER_PATCH).unwrap();
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].rule, Rule::IdentifierFormat);
    assert!(errors[0].message.contains("agent-sonnet-4-5"));

    let attempt = apply
        .apply(fixtures::DOTTED_IDENTIFIER_PATCH, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(attempt.disposition, Some(Disposition::Rejected));
    assert_eq!(
        attempt.path(),
        vec![
            ApplyState::Idle,
            ApplyState::BackingUp,
            ApplyState::Validating,
            ApplyState::Idle
        ]
    );
    assert_eq!(ws.read_live(), before);
    assert_eq!(host.reloads(), 0);
}

#[tokio::test(start_paused = true)]
async fn healthy_apply_writes_the_simulated_merge() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host.clone(), notifier.clone());

    let expected = simulate(
        &ConfigDocument::parse(fixtures::LIVE_CONFIG).unwrap(),
        &Patch::parse(fixtures::FALLBACK_PATCH).unwrap(),
    );

    let attempt = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(attempt.disposition, Some(Disposition::Committed));
    assert!(attempt.health_verified);
    assert_eq!(
        attempt.path(),
        vec![
            ApplyState::Idle,
            ApplyState::BackingUp,
            ApplyState::Validating,
            ApplyState::Writing,
            ApplyState::AwaitingHealth,
            ApplyState::Committed,
            ApplyState::Idle
        ]
    );
    assert_eq!(json(&ws.read_live()), expected.to_value());
    assert_eq!(host.reloads(), 1);
    assert_eq!(notifier.count(), 0);

    let snapshot = attempt.snapshot.clone().unwrap();
    assert_eq!(ws.store().read(&snapshot).unwrap(), fixtures::LIVE_CONFIG.as_bytes());
}

#[tokio::test(start_paused = true)]
async fn dropping_notification_token_warns_and_commits() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);

    let report = apply.check_patch(fixtures::DROP_TOKEN_PATCH).unwrap();
    assert!(!report.has_errors());
    let warnings: Vec<_> = report.warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].rule, Rule::CriticalRegression);

    let attempt = apply
        .apply(fixtures::DROP_TOKEN_PATCH, ApplyOptions::default())
        .await
        .unwrap();
    assert!(attempt.is_committed());
    let warnings: Vec<_> = attempt.warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, Severity::Warning);
    assert_eq!(json(&ws.read_live())["notifications"]["token"], serde_json::Value::Null);
}

#[tokio::test(start_paused = true)]
async fn blocking_policy_rejects_regressions() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator_with(
        host,
        notifier,
        ValidationPolicy::default().blocking_regressions(true),
    );
    let before = ws.read_live();

    let attempt = apply
        .apply(r#"{"security":{"deny":["mkfs"]}}"#, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(attempt.disposition, Some(Disposition::Rejected));
    assert_eq!(attempt.errors().next().unwrap().rule, Rule::CriticalRegression);
    assert_eq!(ws.read_live(), before);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_window_rolls_back_with_shorter_second_window() {
    let (ws, host, notifier) = setup(MockHost::recovering_after_reloads(2));
    let apply = ws.apply_orchestrator(host.clone(), notifier.clone());
    let before = ws.read_live();

    let attempt = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(attempt.disposition, Some(Disposition::RolledBack));
    assert_eq!(attempt.state, ApplyState::Idle);
    assert_eq!(ws.read_live(), before);

    assert_eq!(attempt.health_windows.len(), 2);
    let (first, second) = (&attempt.health_windows[0], &attempt.health_windows[1]);
    assert_eq!(first.kind, HealthWindowKind::Apply);
    assert!(!first.confirmed);
    assert_eq!(second.kind, HealthWindowKind::Rollback);
    assert!(second.confirmed);
    assert!(second.timeout_ms < first.timeout_ms);

    assert_eq!(host.reloads(), 2);
    assert_eq!(notifier.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_rollback_escalates_and_restores_bytes() {
    let (ws, host, notifier) = setup(MockHost::unhealthy());
    let apply = ws.apply_orchestrator(host, notifier.clone());
    let before = ws.read_live();

    let attempt = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(attempt.disposition, Some(Disposition::FatalRollbackFailure));
    assert_eq!(attempt.state, ApplyState::FatalUnrecoverable);
    assert_eq!(ws.read_live(), before);

    let alerts = notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source, "apply");
    assert_eq!(alerts[0].attempt_id.as_deref(), Some(attempt.id.to_string().as_str()));

    let escalation = attempt.escalation.clone().unwrap();
    let err = attempt.into_recovered().unwrap_err();
    assert!(err.requires_operator());
    assert!(err.to_string().contains(&escalation));
}

#[tokio::test(start_paused = true)]
async fn restart_without_reload_command_is_refused_before_backup() {
    let ws = TestWorkspace::new();
    let host = Arc::new(CommandHost::new(HostConfig::default()).unwrap());
    let pipeline = Arc::new(MutationPipeline::new(ws.store(), host).with_audit(ws.audit()));
    let apply = ApplyOrchestrator::new(
        pipeline,
        ws.live(),
        SemanticValidator::new(ValidationPolicy::default()).unwrap(),
    );

    let err = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Host(HostError::NotConfigured("reload"))));
    assert!(!err.requires_operator());
    assert_eq!(ws.read_live(), fixtures::LIVE_CONFIG);
    assert!(ws.store().list().unwrap().is_empty());
    assert_eq!(AuditLog::verify(&ws.audit_path).unwrap(), 0);

    assert!(apply.rollback(ApplyOptions::default()).await.is_err());

    let attempt = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::without_restart())
        .await
        .unwrap();
    assert!(attempt.is_committed());
}

#[tokio::test]
async fn out_of_band_snapshot_waits_for_the_mutation_lock() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let pipeline = ws.pipeline(host, notifier);
    let held = MutationLock::acquire(
        pipeline.store().dir(),
        "apply",
        std::time::Duration::from_secs(600),
    )
    .unwrap();

    let err = pipeline.snapshot_document(&ws.live()).await.unwrap_err();
    assert!(err.is_locked());
    assert!(pipeline.snapshot_tree(&ws.plugin_dir).await.unwrap_err().is_locked());
    assert!(ws.store().list().unwrap().is_empty());
    assert!(ws.store().latest().unwrap().is_none());

    drop(held);
    let info = pipeline.snapshot_document(&ws.live()).await.unwrap();
    assert_eq!(ws.store().latest().unwrap().map(|s| s.id), Some(info.id));
}

#[tokio::test(start_paused = true)]
async fn reload_failure_counts_as_unhealthy() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    host.fail_reloads(true);
    let apply = ws.apply_orchestrator(host.clone(), notifier.clone());
    let before = ws.read_live();

    let attempt = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(attempt.disposition, Some(Disposition::FatalRollbackFailure));
    assert!(attempt.health_windows.iter().all(|w| w.reload_error.is_some()));
    assert_eq!(host.health_checks(), 0);
    assert_eq!(ws.read_live(), before);
    assert_eq!(notifier.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn apply_without_restart_is_unverified() {
    let (ws, host, notifier) = setup(MockHost::unhealthy());
    let apply = ws.apply_orchestrator(host.clone(), notifier);

    let attempt = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::without_restart())
        .await
        .unwrap();

    assert!(attempt.is_committed());
    assert!(!attempt.health_verified);
    assert!(attempt.health_windows.is_empty());
    assert_eq!(host.reloads(), 0);
    assert_eq!(json(&ws.read_live())["logging"]["level"], "debug");
}

#[tokio::test(start_paused = true)]
async fn rollback_is_idempotent() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);
    apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap();
    assert_ne!(ws.read_live(), fixtures::LIVE_CONFIG);

    let first = apply.rollback(ApplyOptions::default()).await.unwrap();
    let after_first = ws.read_live();
    let second = apply.rollback(ApplyOptions::default()).await.unwrap();

    assert_eq!(first.disposition, Some(Disposition::RolledBack));
    assert_eq!(second.disposition, Some(Disposition::RolledBack));
    assert_eq!(after_first, fixtures::LIVE_CONFIG);
    assert_eq!(ws.read_live(), after_first);
    assert_eq!(first.snapshot, second.snapshot);
    assert_eq!(ws.store().list().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rollback_with_empty_store_is_an_error() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);

    let err = apply.rollback(ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        tether_core::GuardError::Store(ref e) if e.is_not_found()
    ));
    assert_eq!(ws.read_live(), fixtures::LIVE_CONFIG);
}

#[tokio::test(start_paused = true)]
async fn concurrent_applies_are_serialized() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);

    let (a, b) = tokio::join!(
        apply.apply(r#"{"logging":{"level":"debug"}}"#, ApplyOptions::default()),
        apply.apply(r#"{"ui":{"theme":"dark"}}"#, ApplyOptions::default()),
    );
    assert!(a.unwrap().is_committed());
    assert!(b.unwrap().is_committed());

    let live = json(&ws.read_live());
    assert_eq!(live["logging"]["level"], "debug");
    assert_eq!(live["ui"]["theme"], "dark");
    assert_eq!(ws.store().list().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn held_lock_refuses_apply() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);
    let store = ws.store();
    let _held = MutationLock::acquire(store.dir(), "other", std::time::Duration::from_secs(600))
        .unwrap();

    let err = apply
        .apply(fixtures::FALLBACK_PATCH, ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_locked());
    assert_eq!(ws.read_live(), fixtures::LIVE_CONFIG);
}

#[tokio::test(start_paused = true)]
async fn attempts_are_journaled_and_diffable() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);

    apply
        .apply(fixtures::DOTTED_IDENTIFIER_PATCH, ApplyOptions::default())
        .await
        .unwrap();
    apply
        .apply(r#"{"logging":{"level":"debug"}}"#, ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(AuditLog::verify(&ws.audit_path).unwrap(), 2);

    let changes = apply.diff().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path.to_string(), "logging");
}

#[test]
fn check_document_reports_every_schema_error() {
    let (ws, host, notifier) = setup(MockHost::healthy());
    let apply = ws.apply_orchestrator(host, notifier);

    let report = apply
        .check_document(r#"{"models":{"default":"x.1"},"bogus":1,"profiles":{"p":{}}}"#)
        .unwrap();
    let mut rules: Vec<_> = report.errors().map(|f| f.rule.as_str()).collect();
    rules.sort_unstable();
    assert_eq!(rules, vec!["identifier-format", "required-field", "unknown-key"]);
    assert_eq!(ws.read_live(), fixtures::LIVE_CONFIG);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn malformed_documents_never_reach_the_live_file(text in "[a-z{}\\[\\]:,\" ]{0,24}") {
        prop_assume!(Patch::parse(&text).is_err());

        let (ws, host, notifier) = setup(MockHost::healthy());
        let apply = ws.apply_orchestrator(host.clone(), notifier);
        prop_assert!(apply.check_document(&text).unwrap().has_errors());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        let attempt = runtime
            .block_on(apply.apply(&text, ApplyOptions::default()))
            .unwrap();
        prop_assert_eq!(attempt.disposition, Some(Disposition::Rejected));
        prop_assert_eq!(ws.read_live(), fixtures::LIVE_CONFIG);
        prop_assert_eq!(host.reloads(), 0);
    }
}
