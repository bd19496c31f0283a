//! End-to-end investigations against scripted reasoners and in-process probes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use sleuth::cancel::CancellationToken;
use sleuth::core::types::{FindingKind, ProbeErrorKind, ProbeOutcome, SessionState};
use sleuth::error::ReasoningCall;
use sleuth::investigation::{InvestigationConfig, InvestigationOutcome, Investigator};
use sleuth::io::session_store::{load_session, write_session};
use sleuth::probes::config::{CONTENTS, DETECTION};
use sleuth::probes::registry_with;
use sleuth::registry::{ProbeArgs, ProbeRegistry};
use sleuth::test_support::{
    ScriptedReasoner, ScriptedReply, counting_probe, panicking_probe, registry_of, slow_probe,
    static_probe, write_file,
};

fn investigator(
    reasoner: &Arc<ScriptedReasoner>,
    registry: ProbeRegistry,
    config: InvestigationConfig,
) -> Investigator<ScriptedReasoner> {
    Investigator::new(Arc::clone(reasoner), Arc::new(registry), config).expect("investigator")
}

fn count_kind(outcome: &InvestigationOutcome, kind: FindingKind) -> usize {
    outcome
        .session
        .findings()
        .iter()
        .filter(|finding| finding.kind == kind)
        .count()
}

/// A container probe, then a config read that pulls in file detection first.
#[test]
fn container_then_config_investigation_concludes() {
    let workspace = tempfile::tempdir().expect("tempdir");
    write_file(
        workspace.path(),
        ".env",
        "DATABASE_URL=postgres://db:5432/app\nPORT=8080\n",
    );
    let registry = registry_with(vec![static_probe(
        "containers_state",
        json!([{"name": "api", "state": "exited", "exit_code": 1}]),
    )])
    .expect("registry");
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .hypotheses(json!({"hypotheses": [
                {"text": "api exits on a bad DATABASE_URL", "confidence": "medium"}
            ]}))
            .plan(json!({"probe_name": "containers_state", "args": {}}))
            .plan(json!({"probe_name": CONTENTS, "args": {"type": "environment_variables"}}))
            .stop(json!({"should_stop": false, "rationale": "need the env"}))
            .stop(json!({"should_stop": true, "rationale": "env explains the crash"}))
            .diagnose(json!({
                "description": "api cannot reach the database named in .env",
                "confidence": "high",
                "recommended_fixes": ["point DATABASE_URL at the running db service"]
            })),
    );

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "api container will not start",
        workspace.path(),
        3,
        &CancellationToken::new(),
    );

    assert_eq!(outcome.final_state, SessionState::Concluded);
    assert_eq!(outcome.session.step(), 2);
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].probe_name, "containers_state");
    assert_eq!(log[1].probe_name, DETECTION);
    assert_eq!(log[2].probe_name, CONTENTS);
    assert!(log.iter().all(|invocation| invocation.outcome.is_success()));

    let contents = log[2].outcome.payload().expect("contents payload");
    assert_eq!(contents["total_files"], json!(1));
    assert_eq!(contents["files"][0]["format"], json!("dotenv"));
    assert_eq!(contents["files"][0]["variables"]["PORT"], json!("8080"));

    let root_cause = outcome.root_cause.expect("root cause");
    assert!(root_cause.description.contains("database"));
    assert_eq!(outcome.session.stop_rationale(), Some("env explains the crash"));
    assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 1);
}

/// The same probe with reordered arguments runs once; repeats reuse its result.
#[test]
fn repeated_probe_is_skipped_and_reuses_the_first_outcome() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let executions = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![counting_probe("disk_usage", Arc::clone(&executions))]);
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"probe_name": "disk_usage", "args": {"path": "/var", "depth": 1}}))
            .plan(json!({"probe_name": "disk_usage", "args": {"depth": 1, "path": "/var"}})),
    );

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "disk full",
        workspace.path(),
        3,
        &CancellationToken::new(),
    );

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(reasoner.calls(ReasoningCall::PlanProbe), 3);
    assert_eq!(outcome.final_state, SessionState::Exhausted);
    assert_eq!(outcome.session.step(), 3);
    assert_eq!(outcome.session.executed_signatures().len(), 1);
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 3);
    assert!(!log[0].was_skipped_as_duplicate);
    for duplicate in &log[1..] {
        assert!(duplicate.was_skipped_as_duplicate);
        assert_eq!(duplicate.signature, log[0].signature);
        assert_eq!(duplicate.outcome, ProbeOutcome::Reused { invocation: 0 });
    }
    assert_eq!(count_kind(&outcome, FindingKind::DuplicateSkipped), 2);

    // Digestion of a skipped probe sees the original result.
    let digests = reasoner.requests(ReasoningCall::DigestEvidence);
    assert_eq!(digests.len(), 3);
    let reused = &digests[1]["outcomes"][0];
    assert_eq!(reused["duplicate"], json!(true));
    assert_eq!(reused["outcome"]["status"], json!("success"));
    assert_eq!(reused["outcome"]["payload"]["path"], json!("/var"));
}

/// Running out of steps still asks for a diagnosis.
#[test]
fn budget_exhaustion_produces_a_diagnosis() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let executions = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![counting_probe("ping", Arc::clone(&executions))]);
    let mut reasoner = ScriptedReasoner::new();
    for attempt in 1..=5 {
        reasoner = reasoner.plan(json!({"probe_name": "ping", "args": {"attempt": attempt}}));
    }
    let reasoner = Arc::new(reasoner.diagnose(json!({
        "description": "upstream is flapping",
        "confidence": "medium",
        "recommended_fixes": []
    })));

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "intermittent 502",
        workspace.path(),
        5,
        &CancellationToken::new(),
    );

    assert_eq!(outcome.final_state, SessionState::Exhausted);
    assert_eq!(outcome.session.step(), 5);
    assert_eq!(outcome.session.probe_log().len(), 5);
    assert_eq!(executions.load(Ordering::SeqCst), 5);
    assert_eq!(reasoner.calls(ReasoningCall::DecideStop), 5);
    assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 1);
    assert_eq!(
        outcome.root_cause.expect("root cause").description,
        "upstream is flapping"
    );
}

#[test]
fn zero_budget_is_exhausted_before_any_step() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let reasoner = Arc::new(ScriptedReasoner::new());
    let outcome = investigator(&reasoner, registry_of(Vec::new()), InvestigationConfig::default())
        .run("anything", workspace.path(), 0, &CancellationToken::new());

    assert_eq!(outcome.final_state, SessionState::Exhausted);
    assert_eq!(outcome.session.step(), 0);
    assert_eq!(reasoner.calls(ReasoningCall::GenerateHypotheses), 0);
    assert!(outcome.root_cause.is_some());
}

/// Four malformed replies in a row end the session without a diagnosis.
#[test]
fn malformed_streak_errors_the_session() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .push(
                ReasoningCall::GenerateHypotheses,
                ScriptedReply::Fail("model overloaded".to_string()),
            )
            .push(
                ReasoningCall::DecideStop,
                ScriptedReply::Fail("model overloaded".to_string()),
            ),
    );

    let outcome = investigator(&reasoner, registry_of(Vec::new()), InvestigationConfig::default())
        .run("db down", workspace.path(), 5, &CancellationToken::new());

    assert_eq!(outcome.final_state, SessionState::Errored);
    assert!(outcome.root_cause.is_none());
    assert_eq!(outcome.session.step(), 1);
    assert_eq!(count_kind(&outcome, FindingKind::MalformedReasoningOutput), 4);
    assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 0);
}

/// A reasoner that starts panicking errors the session and keeps earlier work.
#[test]
fn panicking_reasoner_errors_with_partial_log() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let registry = registry_of(vec![static_probe("uptime", json!({"up": 1}))]);
    let panic = || ScriptedReply::Panic("backend crashed".to_string());
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .hypotheses(json!({"hypotheses": ["host rebooted"]}))
            .push(ReasoningCall::GenerateHypotheses, panic())
            .plan(json!({"probe_name": "uptime", "args": {}}))
            .push(ReasoningCall::PlanProbe, panic())
            .stop(json!({"should_stop": false, "rationale": "look further"}))
            .push(ReasoningCall::DecideStop, panic()),
    );

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "host unreachable",
        workspace.path(),
        5,
        &CancellationToken::new(),
    );

    assert_eq!(outcome.final_state, SessionState::Errored);
    assert!(outcome.root_cause.is_none());
    assert_eq!(outcome.session.step(), 2);
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 1);
    assert!(log[0].outcome.is_success());
    assert_eq!(outcome.session.hypotheses()[0].text, "host rebooted");
    let malformed: Vec<_> = outcome
        .session
        .findings()
        .iter()
        .filter(|finding| finding.kind == FindingKind::MalformedReasoningOutput)
        .collect();
    assert_eq!(malformed.len(), 4);
    assert!(
        malformed
            .iter()
            .all(|finding| finding.summary.contains("reasoner panicked: backend crashed"))
    );
    assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 0);
}

#[test]
fn schema_violations_count_as_malformed() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let registry = registry_of(vec![static_probe("uptime", json!({"up": 1}))]);
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"args": {}}))
            .stop(json!({"should_stop": true, "rationale": "recovered"})),
    );

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "p",
        workspace.path(),
        3,
        &CancellationToken::new(),
    );

    assert_eq!(outcome.final_state, SessionState::Concluded);
    assert_eq!(count_kind(&outcome, FindingKind::MalformedReasoningOutput), 1);
    assert_eq!(outcome.session.consecutive_malformed(), 0);
}

#[test]
fn dependency_cycle_is_reported_without_running_anything() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let executions = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![
        counting_probe("a", Arc::clone(&executions)).requires("b", |_: &Value| ProbeArgs::new()),
        counting_probe("b", Arc::clone(&executions)).requires("a", |_: &Value| ProbeArgs::new()),
    ]);
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"probe_name": "a", "args": {}}))
            .stop(json!({"should_stop": true, "rationale": "stuck"})),
    );

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "p",
        workspace.path(),
        2,
        &CancellationToken::new(),
    );

    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert!(outcome.session.probe_log().is_empty());
    assert_eq!(count_kind(&outcome, FindingKind::DependencyCycle), 1);
    assert_eq!(reasoner.calls(ReasoningCall::DigestEvidence), 0);
    assert_eq!(outcome.final_state, SessionState::Concluded);
}

#[test]
fn failed_prerequisite_halts_the_target() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let executions = Arc::new(AtomicUsize::new(0));
    let registry = registry_of(vec![
        sleuth::test_support::failing_probe("list_pods", "kubectl not found"),
        counting_probe("pod_logs", Arc::clone(&executions))
            .requires("list_pods", |_: &Value| ProbeArgs::new()),
    ]);
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"probe_name": "pod_logs", "args": {}}))
            .stop(json!({"should_stop": true, "rationale": "no cluster access"})),
    );

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run(
        "pods crashloop",
        workspace.path(),
        2,
        &CancellationToken::new(),
    );

    assert_eq!(executions.load(Ordering::SeqCst), 0);
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].probe_name, "list_pods");
    assert!(!log[0].outcome.is_success());
    assert!(
        outcome
            .session
            .findings()
            .iter()
            .any(|finding| finding.summary.contains("prerequisite `list_pods` failed"))
    );
}

#[test]
fn probe_panics_and_timeouts_become_findings() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let registry = registry_of(vec![
        panicking_probe("explode"),
        slow_probe("hang", Duration::from_secs(5)),
    ]);
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"probe_name": "explode", "args": {}}))
            .plan(json!({"probe_name": "hang", "args": {}}))
            .stop(json!({"should_stop": false, "rationale": "try another"}))
            .stop(json!({"should_stop": true, "rationale": "enough"})),
    );
    let config = InvestigationConfig {
        probe_timeout: Duration::from_millis(300),
        ..InvestigationConfig::default()
    };

    let outcome = investigator(&reasoner, registry, config).run(
        "p",
        workspace.path(),
        4,
        &CancellationToken::new(),
    );

    assert_eq!(outcome.final_state, SessionState::Concluded);
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 2);
    match &log[0].outcome {
        ProbeOutcome::Error { error } => {
            assert_eq!(error.kind, ProbeErrorKind::Execution);
            assert!(error.message.contains("probe exploded"));
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    match &log[1].outcome {
        ProbeOutcome::Error { error } => assert_eq!(error.kind, ProbeErrorKind::Timeout),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(count_kind(&outcome, FindingKind::ProbeExecutionError), 1);
    assert_eq!(count_kind(&outcome, FindingKind::ProbeTimeout), 1);
}

#[test]
fn slow_reasoner_reply_counts_as_malformed() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .push(
                ReasoningCall::GenerateHypotheses,
                ScriptedReply::Delayed(Duration::from_secs(5), json!({"hypotheses": []})),
            )
            .push(ReasoningCall::GenerateHypotheses, ScriptedReply::Value(json!({"hypotheses": []})))
            .stop(json!({"should_stop": true, "rationale": "done"})),
    );
    let config = InvestigationConfig {
        reasoning_timeout: Duration::from_millis(500),
        ..InvestigationConfig::default()
    };

    let outcome = investigator(&reasoner, registry_of(Vec::new()), config).run(
        "p",
        workspace.path(),
        2,
        &CancellationToken::new(),
    );

    assert_eq!(outcome.final_state, SessionState::Concluded);
    assert!(
        outcome
            .session
            .findings()
            .iter()
            .any(|finding| finding.kind == FindingKind::MalformedReasoningOutput
                && finding.summary.contains("no reply within"))
    );
}

/// Cancelling between steps keeps exactly the completed steps.
#[test]
fn cancellation_between_steps_aborts_with_completed_work() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let registry = registry_of(vec![static_probe("uptime", json!({"up": 1}))]);
    let reasoner = Arc::new(
        ScriptedReasoner::new().plan(json!({"probe_name": "uptime", "args": {}})),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run_with(
        "p",
        workspace.path(),
        5,
        &cancel,
        move |snapshot| {
            if snapshot.step() == 1 {
                trigger.cancel();
            }
        },
    );

    assert_eq!(outcome.final_state, SessionState::Aborted);
    assert_eq!(outcome.session.step(), 1);
    assert_eq!(outcome.session.probe_log().len(), 1);
    assert!(outcome.root_cause.is_none());
    assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 0);
}

/// Cancelling while a probe runs drops the in-flight step.
#[test]
fn cancellation_during_a_probe_discards_the_step() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let registry = registry_of(vec![
        static_probe("uptime", json!({"up": 1})),
        slow_probe("full_scan", Duration::from_secs(10)),
    ]);
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"probe_name": "uptime", "args": {}}))
            .plan(json!({"probe_name": "full_scan", "args": {}})),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut armed = false;

    let outcome = investigator(&reasoner, registry, InvestigationConfig::default()).run_with(
        "p",
        workspace.path(),
        5,
        &cancel,
        move |snapshot| {
            if snapshot.step() == 1 && !armed {
                armed = true;
                let trigger = trigger.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(200));
                    trigger.cancel();
                });
            }
        },
    );

    assert_eq!(outcome.final_state, SessionState::Aborted);
    assert_eq!(outcome.session.step(), 1);
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].probe_name, "uptime");
}

/// A snapshot written mid-run reloads identically and can be resumed.
#[test]
fn persisted_snapshot_round_trips_and_resumes() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let store = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(registry_of(vec![static_probe("uptime", json!({"up": 1}))]));

    let first = Arc::new(
        ScriptedReasoner::new()
            .hypotheses(json!({"hypotheses": ["clock skew"]}))
            .plan(json!({"probe_name": "uptime", "args": {}})),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut snapshot = None;
    Investigator::new(first, Arc::clone(&registry), InvestigationConfig::default())
        .expect("investigator")
        .run_with("tokens rejected", workspace.path(), 4, &cancel, |session| {
            if session.step() == 1 && snapshot.is_none() {
                snapshot = Some(session.clone());
                trigger.cancel();
            }
        });
    let snapshot = snapshot.expect("snapshot after step 1");
    assert_eq!(snapshot.state(), SessionState::Active);

    let path = store.path().join(format!("{}.json", snapshot.id()));
    write_session(&path, &snapshot).expect("write");
    let reloaded = load_session(&path).expect("load");
    assert_eq!(reloaded, snapshot);

    let second = Arc::new(
        ScriptedReasoner::new()
            .plan(json!({"probe_name": "uptime", "args": {}}))
            .stop(json!({"should_stop": true, "rationale": "uptime is fine"})),
    );
    let outcome = Investigator::new(second, registry, InvestigationConfig::default())
        .expect("investigator")
        .resume(reloaded, &CancellationToken::new(), |_| {});

    assert_eq!(outcome.final_state, SessionState::Concluded);
    assert_eq!(outcome.session.step(), 2);
    assert_eq!(outcome.session.id(), snapshot.id());
    // The repeat of step 1's probe is recognised across the reload.
    let log = outcome.session.probe_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].outcome, ProbeOutcome::Reused { invocation: 0 });

    write_session(&path, &outcome.session).expect("write final");
    assert_eq!(load_session(&path).expect("reload final"), outcome.session);
}
