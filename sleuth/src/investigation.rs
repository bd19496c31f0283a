//! The investigation loop.
//!
//! [`Investigator`] drives one session from `Active` to a terminal state:
//! hypothesize, plan a probe, resolve and execute it, digest the evidence and
//! decide whether to stop, once per step until the reasoner stops, the budget
//! runs out, the reasoner keeps replying garbage or the caller cancels.
//!
//! Every change a step makes is staged in a [`StepDraft`]; a cancelled step is
//! dropped whole, so an aborted session holds exactly the completed steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::core::budget::call_timeout;
use crate::core::session::{InvestigationSession, StepDraft};
use crate::core::signature::canonicalize;
use crate::core::types::{
    Confidence, Finding, FindingKind, Hypothesis, HypothesisStatus, ProbeErrorKind,
    ProbeInvocation, ProbeOutcome, RootCause, SessionState,
};
use crate::error::{InvestigationError, ReasoningCall};
use crate::io::probe_executor::outcome_error;
use crate::io::supervise::{Bounded, run_bounded};
use crate::reasoning::reply::{ProbePlan, ReplyValidator};
use crate::reasoning::{
    DiagnoseRequest, DigestRequest, HypothesesRequest, ObservedOutcome, PlanRequest, ProbeSummary,
    ReasoningPort, StopRequest,
};
use crate::registry::{ProbeContext, ProbeRegistry, ProbeSchema};
use crate::resolver::{ResolveRequest, Resolver};

/// Consecutive malformed replies tolerated before the session errors out.
pub const DEFAULT_MALFORMED_THRESHOLD: u32 = 3;

/// Limits applied to one investigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestigationConfig {
    pub probe_timeout: Duration,
    pub reasoning_timeout: Duration,
    /// Wall-clock cap for the whole session; per-call timeouts are clamped to it.
    pub session_timeout: Option<Duration>,
    pub malformed_threshold: u32,
    pub max_parallel_probes: usize,
    pub probe_output_limit_bytes: usize,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(60),
            reasoning_timeout: Duration::from_secs(300),
            session_timeout: None,
            malformed_threshold: DEFAULT_MALFORMED_THRESHOLD,
            max_parallel_probes: 4,
            probe_output_limit_bytes: 100_000,
        }
    }
}

/// Result of driving a session to a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct InvestigationOutcome {
    pub final_state: SessionState,
    pub root_cause: Option<RootCause>,
    pub session: InvestigationSession,
}

impl From<InvestigationSession> for InvestigationOutcome {
    fn from(session: InvestigationSession) -> Self {
        Self {
            final_state: session.state(),
            root_cause: session.root_cause().cloned(),
            session,
        }
    }
}

/// A reasoning reply after validation.
enum Reply<T> {
    Valid(T),
    Malformed(InvestigationError),
}

/// How a step ended.
enum StepEnd {
    Continue(StepDraft),
    Stop(StepDraft),
    /// The malformed-reply threshold was exceeded mid-step.
    Errored(StepDraft),
}

/// Drives investigations against a fixed registry and reasoner.
pub struct Investigator<R: ReasoningPort + ?Sized + 'static> {
    reasoner: Arc<R>,
    registry: Arc<ProbeRegistry>,
    catalog: Vec<ProbeSchema>,
    validator: ReplyValidator,
    config: InvestigationConfig,
}

impl<R: ReasoningPort + ?Sized + 'static> Investigator<R> {
    pub fn new(
        reasoner: Arc<R>,
        registry: Arc<ProbeRegistry>,
        config: InvestigationConfig,
    ) -> Result<Self> {
        let catalog = registry.catalog();
        Ok(Self {
            reasoner,
            registry,
            catalog,
            validator: ReplyValidator::new()?,
            config,
        })
    }

    pub fn config(&self) -> &InvestigationConfig {
        &self.config
    }

    /// Investigate `problem` in `workspace` for at most `budget` steps.
    pub fn run(
        &self,
        problem: &str,
        workspace: &Path,
        budget: u32,
        cancel: &CancellationToken,
    ) -> InvestigationOutcome {
        self.run_with(problem, workspace, budget, cancel, |_| {})
    }

    /// Like [`Investigator::run`], calling `observer` after every committed
    /// step and once more with the terminal session.
    pub fn run_with<F: FnMut(&InvestigationSession)>(
        &self,
        problem: &str,
        workspace: &Path,
        budget: u32,
        cancel: &CancellationToken,
        observer: F,
    ) -> InvestigationOutcome {
        let session = InvestigationSession::new(problem, workspace.display().to_string(), budget);
        self.resume(session, cancel, observer)
    }

    /// Drive an existing session (fresh or reloaded) to a terminal state.
    ///
    /// A session that is already terminal is returned untouched.
    pub fn resume<F: FnMut(&InvestigationSession)>(
        &self,
        mut session: InvestigationSession,
        cancel: &CancellationToken,
        mut observer: F,
    ) -> InvestigationOutcome {
        if session.state().is_terminal() {
            debug!(session = session.id(), state = %session.state(), "session already closed");
            return session.into();
        }

        match self.drive(&mut session, cancel, &mut observer) {
            Ok(()) => {}
            Err(InvestigationError::SessionAborted) => {
                info!(session = session.id(), step = session.step(), "investigation cancelled");
                close(&mut session, SessionState::Aborted);
            }
            Err(err) => {
                error!(session = session.id(), err = %err, "investigation failed");
                close(&mut session, SessionState::Errored);
            }
        }

        info!(
            session = session.id(),
            state = %session.state(),
            steps = session.step(),
            probes = session.probe_log().len(),
            "investigation finished"
        );
        observer(&session);
        session.into()
    }

    #[instrument(skip_all, fields(session = %session.id(), budget = session.budget()))]
    fn drive<F: FnMut(&InvestigationSession)>(
        &self,
        session: &mut InvestigationSession,
        cancel: &CancellationToken,
        observer: &mut F,
    ) -> Result<(), InvestigationError> {
        let deadline = self.config.session_timeout.map(|t| Instant::now() + t);
        let workspace = PathBuf::from(session.workspace());

        let closing = loop {
            if cancel.is_cancelled() {
                return Err(InvestigationError::SessionAborted);
            }
            if session.budget_spent() {
                info!(step = session.step(), "step budget exhausted");
                break SessionState::Exhausted;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!(step = session.step(), "session deadline reached");
                break SessionState::Exhausted;
            }

            match self.step(session, cancel, deadline, &workspace)? {
                StepEnd::Continue(draft) => {
                    session.commit_step(draft, true)?;
                    observer(session);
                }
                StepEnd::Stop(draft) => {
                    session.commit_step(draft, true)?;
                    observer(session);
                    info!(step = session.step(), "reasoner decided to stop");
                    break SessionState::Concluded;
                }
                StepEnd::Errored(draft) => {
                    session.commit_step(draft, false)?;
                    warn!(
                        streak = session.consecutive_malformed(),
                        "too many malformed reasoning replies"
                    );
                    session.terminate(SessionState::Errored)?;
                    return Ok(());
                }
            }
        };

        self.finalize(session, closing, cancel)
    }

    /// Run one step against `session` without touching it.
    #[instrument(skip_all, fields(step = session.step() + 1))]
    fn step(
        &self,
        session: &InvestigationSession,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        workspace: &Path,
    ) -> Result<StepEnd, InvestigationError> {
        let mut draft = session.begin_step();
        let step = draft.step();
        info!(step, budget = session.budget(), "starting step");

        let request = HypothesesRequest {
            problem: session.problem().to_string(),
            step,
            budget: session.budget(),
            findings: session.findings().to_vec(),
            hypotheses: draft.hypotheses().to_vec(),
        };
        let reply = self.ask(
            ReasoningCall::GenerateHypotheses,
            deadline,
            cancel,
            move |r| r.generate_hypotheses(&request),
            ReplyValidator::hypotheses,
        )?;
        match reply {
            Reply::Valid(reply) => {
                draft.reasoning_succeeded();
                draft.merge_hypotheses(reply.hypotheses.into_iter().map(Hypothesis::from).collect());
            }
            Reply::Malformed(err) => {
                if self.malformed(&mut draft, &err) {
                    return Ok(StepEnd::Errored(draft));
                }
            }
        }

        let request = PlanRequest {
            problem: session.problem().to_string(),
            hypotheses: draft.hypotheses().to_vec(),
            findings: findings_so_far(session, &draft),
            catalog: self.catalog.clone(),
            history: summarize_log(session.probe_log()),
        };
        let reply = self.ask(
            ReasoningCall::PlanProbe,
            deadline,
            cancel,
            move |r| r.plan_probe(&request),
            ReplyValidator::plan,
        )?;
        let plan = match reply {
            Reply::Valid(plan) => {
                draft.reasoning_succeeded();
                Some(plan)
            }
            Reply::Malformed(err) => {
                if self.malformed(&mut draft, &err) {
                    return Ok(StepEnd::Errored(draft));
                }
                None
            }
        };

        let observed = match plan {
            Some(plan) => self.investigate(session, &mut draft, plan, deadline, cancel, workspace)?,
            None => Vec::new(),
        };

        if !observed.is_empty() {
            let request = DigestRequest {
                problem: session.problem().to_string(),
                hypotheses: draft.hypotheses().to_vec(),
                findings: findings_so_far(session, &draft),
                outcomes: observed
                    .iter()
                    .filter_map(|&index| observed_outcome(session, &draft, index))
                    .collect(),
            };
            let reply = self.ask(
                ReasoningCall::DigestEvidence,
                deadline,
                cancel,
                move |r| r.digest_evidence(&request),
                ReplyValidator::digest,
            )?;
            match reply {
                Reply::Valid(digest) => {
                    draft.reasoning_succeeded();
                    let mut fresh = Vec::with_capacity(digest.findings.len());
                    for item in digest.findings {
                        fresh.push(draft.push_finding(Finding {
                            step_ref: step,
                            kind: FindingKind::Observation,
                            summary: item.summary,
                            detail: item.detail,
                            evidence_refs: observed.clone(),
                            confidence: item.confidence,
                        }));
                    }
                    let updates = digest
                        .hypothesis_updates
                        .into_iter()
                        .map(|update| {
                            let current = draft
                                .hypotheses()
                                .iter()
                                .find(|h| h.text.trim() == update.text.trim())
                                .map(|h| h.confidence);
                            let mut hypothesis = Hypothesis::new(update.text);
                            hypothesis.confidence =
                                update.confidence.or(current).unwrap_or_default();
                            hypothesis.status = update.status;
                            match update.status {
                                HypothesisStatus::Confirmed => {
                                    hypothesis.supporting_refs = fresh.clone();
                                }
                                HypothesisStatus::Refuted => {
                                    hypothesis.refuting_refs = fresh.clone();
                                }
                                HypothesisStatus::Active => {}
                            }
                            hypothesis
                        })
                        .collect();
                    draft.merge_hypotheses(updates);
                    debug!(findings = fresh.len(), "evidence digested");
                }
                Reply::Malformed(err) => {
                    if self.malformed(&mut draft, &err) {
                        return Ok(StepEnd::Errored(draft));
                    }
                }
            }
        }

        let request = StopRequest {
            problem: session.problem().to_string(),
            findings: findings_so_far(session, &draft),
            hypotheses: draft.hypotheses().to_vec(),
            step,
            budget: session.budget(),
        };
        let reply = self.ask(
            ReasoningCall::DecideStop,
            deadline,
            cancel,
            move |r| r.decide_stop(&request),
            ReplyValidator::stop,
        )?;
        let should_stop = match reply {
            Reply::Valid(decision) => {
                draft.reasoning_succeeded();
                if !decision.missing_evidence.is_empty() {
                    debug!(missing = ?decision.missing_evidence, "reasoner wants more evidence");
                }
                draft.set_stop_rationale(decision.rationale);
                decision.should_stop
            }
            Reply::Malformed(err) => {
                if self.malformed(&mut draft, &err) {
                    return Ok(StepEnd::Errored(draft));
                }
                false
            }
        };

        if should_stop {
            Ok(StepEnd::Stop(draft))
        } else {
            Ok(StepEnd::Continue(draft))
        }
    }

    /// Validate, deduplicate, resolve and execute a planned probe.
    ///
    /// Returns the absolute log indices whose outcomes should be digested.
    fn investigate(
        &self,
        session: &InvestigationSession,
        draft: &mut StepDraft,
        plan: ProbePlan,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        workspace: &Path,
    ) -> Result<Vec<usize>, InvestigationError> {
        let step = draft.step();
        let prepared = self
            .registry
            .get(&plan.probe_name)
            .and_then(|spec| spec.prepare_args(&plan.args).map(|args| (spec, args)));
        let (spec, args) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(probe = %plan.probe_name, err = %err, "planner chose an unusable probe");
                draft.record_error(&err, Vec::new());
                return Ok(Vec::new());
            }
        };

        let canonical = canonicalize(&spec.name, &Value::Object(args.clone()));
        if session.executed_signatures().contains(&canonical.signature)
            && let Some(original) = session.original_invocation(&canonical.signature)
        {
            info!(
                probe = %spec.name,
                signature = %canonical.signature,
                original,
                "skipping duplicate probe"
            );
            let now = Utc::now();
            let index = draft.push_invocation(ProbeInvocation {
                step,
                probe_name: spec.name.clone(),
                canonical_args: canonical.args,
                signature: canonical.signature,
                started_at: now,
                finished_at: now,
                outcome: ProbeOutcome::Reused {
                    invocation: original,
                },
                was_skipped_as_duplicate: true,
                effective_args: None,
            });
            draft.push_finding(Finding {
                step_ref: step,
                kind: FindingKind::DuplicateSkipped,
                summary: format!(
                    "skipped `{}`: identical to probe_log[{original}]",
                    spec.name
                ),
                detail: None,
                evidence_refs: vec![index, original],
                confidence: Confidence::High,
            });
            return Ok(vec![index]);
        }

        let timeout = call_timeout(self.config.probe_timeout, deadline).unwrap_or(Duration::ZERO);
        let context = ProbeContext {
            workspace: workspace.to_path_buf(),
            timeout,
            output_limit_bytes: self.config.probe_output_limit_bytes,
        };
        let resolution = Resolver::new(&self.registry, self.config.max_parallel_probes).resolve(
            ResolveRequest {
                target: spec,
                target_args: args,
                target_canonical: canonical,
                session,
                step,
                context: &context,
                timeout,
                cancel,
            },
        );
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(InvestigationError::SessionAborted) => {
                return Err(InvestigationError::SessionAborted);
            }
            Err(err) => {
                warn!(probe = %spec.name, err = %err, "probe plan rejected");
                draft.record_error(&err, Vec::new());
                return Ok(Vec::new());
            }
        };

        let mut observed = Vec::with_capacity(resolution.invocations.len());
        for invocation in resolution.invocations {
            let failure = outcome_error(&invocation.probe_name, &invocation.outcome);
            let index = draft.push_invocation(invocation);
            if let Some(err) = failure {
                draft.record_error(&err, vec![index]);
            }
            observed.push(index);
        }
        if let Some(prerequisite) = resolution.halted_by {
            draft.push_finding(Finding {
                step_ref: step,
                kind: FindingKind::ProbeExecutionError,
                summary: format!(
                    "`{}` not run: prerequisite `{prerequisite}` failed",
                    spec.name
                ),
                detail: None,
                evidence_refs: observed.clone(),
                confidence: Confidence::High,
            });
        }
        Ok(observed)
    }

    /// Ask for a diagnosis, retrying malformed replies up to the threshold.
    fn finalize(
        &self,
        session: &mut InvestigationSession,
        closing: SessionState,
        cancel: &CancellationToken,
    ) -> Result<(), InvestigationError> {
        loop {
            let request = DiagnoseRequest {
                problem: session.problem().to_string(),
                findings: session.findings().to_vec(),
                hypotheses: session.hypotheses().to_vec(),
                probes: summarize_log(session.probe_log()),
                closing_state: closing,
            };
            let reply = self.ask(
                ReasoningCall::Diagnose,
                None,
                cancel,
                move |r| r.diagnose(&request),
                ReplyValidator::diagnosis,
            )?;
            match reply {
                Reply::Valid(diagnosis) => {
                    session.reset_malformed()?;
                    info!(state = %closing, confidence = ?diagnosis.confidence, "diagnosis recorded");
                    return session.conclude(closing, diagnosis.into());
                }
                Reply::Malformed(err) => {
                    let streak = session.record_malformed(&err)?;
                    if streak > self.config.malformed_threshold {
                        warn!(streak, "no usable diagnosis");
                        return session.terminate(SessionState::Errored);
                    }
                }
            }
        }
    }

    /// Stage a malformed reply; true once the streak exceeds the threshold.
    fn malformed(&self, draft: &mut StepDraft, err: &InvestigationError) -> bool {
        warn!(err = %err, "malformed reasoning reply");
        draft.record_malformed(err) > self.config.malformed_threshold
    }

    /// Run one reasoning call under its timeout and validate the reply.
    ///
    /// `Err` only on cancellation; every other failure is a malformed reply.
    fn ask<T, C>(
        &self,
        call: ReasoningCall,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
        invoke: C,
        validate: fn(&ReplyValidator, Value) -> Result<T, InvestigationError>,
    ) -> Result<Reply<T>, InvestigationError>
    where
        C: FnOnce(&R) -> Result<Value> + Send + 'static,
    {
        let timeout = call_timeout(self.config.reasoning_timeout, deadline).unwrap_or(Duration::ZERO);
        let reasoner = Arc::clone(&self.reasoner);
        debug!(call = %call, timeout_ms = timeout.as_millis() as u64, "asking reasoner");
        let raw = match run_bounded(call.as_str(), timeout, cancel, move || invoke(&*reasoner)) {
            Bounded::Completed(Ok(raw)) => raw,
            Bounded::Completed(Err(err)) => {
                return Ok(Reply::Malformed(InvestigationError::malformed(
                    call,
                    format!("reasoner failed: {err:#}"),
                )));
            }
            Bounded::Panicked(message) => {
                return Ok(Reply::Malformed(InvestigationError::malformed(
                    call,
                    format!("reasoner panicked: {message}"),
                )));
            }
            Bounded::TimedOut => {
                return Ok(Reply::Malformed(InvestigationError::malformed(
                    call,
                    format!("no reply within {}ms", timeout.as_millis()),
                )));
            }
            Bounded::Cancelled => return Err(InvestigationError::SessionAborted),
        };
        Ok(match validate(&self.validator, raw) {
            Ok(reply) => Reply::Valid(reply),
            Err(err) => Reply::Malformed(err),
        })
    }
}

/// Move an active session into `state`, ignoring sessions already closed.
fn close(session: &mut InvestigationSession, state: SessionState) {
    if let Err(err) = session.terminate(state) {
        debug!(err = %err, "session already closed");
    }
}

fn findings_so_far(session: &InvestigationSession, draft: &StepDraft) -> Vec<Finding> {
    session
        .findings()
        .iter()
        .chain(draft.staged_findings())
        .cloned()
        .collect()
}

/// Compact history view handed to the planner and the diagnosis.
pub fn summarize_log(log: &[ProbeInvocation]) -> Vec<ProbeSummary> {
    log.iter()
        .enumerate()
        .map(|(index, invocation)| ProbeSummary {
            index,
            step: invocation.step,
            probe_name: invocation.probe_name.clone(),
            args: invocation.canonical_args.clone(),
            status: match &invocation.outcome {
                ProbeOutcome::Success { .. } => "success",
                ProbeOutcome::Error { error } if error.kind == ProbeErrorKind::Timeout => {
                    "timeout"
                }
                ProbeOutcome::Error { .. } => "error",
                ProbeOutcome::Reused { .. } => "duplicate",
            },
        })
        .collect()
}

/// A staged invocation with its outcome resolved through the committed log.
fn observed_outcome(
    session: &InvestigationSession,
    draft: &StepDraft,
    index: usize,
) -> Option<ObservedOutcome> {
    let invocation = draft.invocation(index)?;
    let outcome = match &invocation.outcome {
        ProbeOutcome::Reused { invocation } => session.outcome_of(*invocation)?.clone(),
        other => other.clone(),
    };
    Some(ObservedOutcome {
        index,
        probe_name: invocation.probe_name.clone(),
        args: invocation.canonical_args.clone(),
        duplicate: invocation.was_skipped_as_duplicate,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedReasoner, registry_of, static_probe};
    use serde_json::json;

    fn investigator(
        reasoner: Arc<ScriptedReasoner>,
        registry: ProbeRegistry,
    ) -> Investigator<ScriptedReasoner> {
        Investigator::new(reasoner, Arc::new(registry), InvestigationConfig::default())
            .expect("investigator")
    }

    /// A reasoner that stops after the first step yields a diagnosed session.
    #[test]
    fn stop_after_first_step_concludes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reasoner = Arc::new(
            ScriptedReasoner::new()
                .plan(json!({"probe_name": "uptime", "args": {}}))
                .stop(json!({"should_stop": true, "rationale": "enough"})),
        );
        let registry = registry_of(vec![static_probe("uptime", json!({"up": 5}))]);
        let outcome = investigator(Arc::clone(&reasoner), registry).run(
            "slow api",
            temp.path(),
            4,
            &CancellationToken::new(),
        );

        assert_eq!(outcome.final_state, SessionState::Concluded);
        assert_eq!(outcome.session.step(), 1);
        assert_eq!(outcome.session.probe_log().len(), 1);
        assert_eq!(outcome.session.stop_rationale(), Some("enough"));
        assert!(outcome.root_cause.is_some());
        assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 1);
    }

    /// An unknown probe name is recorded and nothing executes or gets digested.
    #[test]
    fn unknown_probe_is_recorded_without_execution() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reasoner = Arc::new(
            ScriptedReasoner::new()
                .plan(json!({"probe_name": "nope", "args": {}}))
                .stop(json!({"should_stop": true, "rationale": "done"})),
        );
        let registry = registry_of(vec![static_probe("uptime", json!({}))]);
        let outcome = investigator(Arc::clone(&reasoner), registry).run(
            "p",
            temp.path(),
            2,
            &CancellationToken::new(),
        );

        assert!(outcome.session.probe_log().is_empty());
        assert!(
            outcome
                .session
                .findings()
                .iter()
                .any(|f| f.kind == FindingKind::InvalidProbe)
        );
        assert_eq!(reasoner.calls(ReasoningCall::DigestEvidence), 0);
    }

    /// Digest updates attach the new findings as support for confirmed hypotheses.
    #[test]
    fn confirmed_hypothesis_gains_supporting_refs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reasoner = Arc::new(
            ScriptedReasoner::new()
                .hypotheses(json!({"hypotheses": [{"text": "disk full", "confidence": "low"}]}))
                .plan(json!({"probe_name": "df", "args": {}}))
                .digest(json!({
                    "findings": [{"summary": "root volume at 100%", "confidence": "high"}],
                    "hypothesis_updates": [{"text": "disk full", "status": "confirmed"}]
                }))
                .stop(json!({"should_stop": true, "rationale": "confirmed"})),
        );
        let registry = registry_of(vec![static_probe("df", json!({"use": "100%"}))]);
        let outcome = investigator(reasoner, registry).run(
            "writes fail",
            temp.path(),
            3,
            &CancellationToken::new(),
        );

        let session = &outcome.session;
        let hypothesis = &session.hypotheses()[0];
        assert_eq!(hypothesis.status, HypothesisStatus::Confirmed);
        assert_eq!(hypothesis.confidence, Confidence::Low);
        let observation = session
            .findings()
            .iter()
            .position(|f| f.kind == FindingKind::Observation)
            .expect("observation");
        assert_eq!(hypothesis.supporting_refs, vec![observation]);
        assert_eq!(session.findings()[observation].evidence_refs, vec![0]);
    }

    /// A diagnosis that fails once is retried and the streak is cleared.
    #[test]
    fn diagnosis_is_retried_after_malformed_reply() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reasoner = Arc::new(
            ScriptedReasoner::new()
                .stop(json!({"should_stop": true, "rationale": "r"}))
                .diagnose(json!({"nonsense": true}))
                .diagnose(json!({
                    "description": "bad config",
                    "confidence": "medium",
                    "recommended_fixes": ["fix it"]
                })),
        );
        let registry = registry_of(vec![static_probe("noop", json!({}))]);
        let outcome = investigator(Arc::clone(&reasoner), registry).run(
            "p",
            temp.path(),
            2,
            &CancellationToken::new(),
        );

        assert_eq!(outcome.final_state, SessionState::Concluded);
        assert_eq!(reasoner.calls(ReasoningCall::Diagnose), 2);
        assert_eq!(outcome.session.consecutive_malformed(), 0);
        let root_cause = outcome.root_cause.expect("root cause");
        assert_eq!(root_cause.description, "bad config");
    }

    /// Resuming a closed session returns it unchanged without reasoning calls.
    #[test]
    fn resume_of_terminal_session_is_a_no_op() {
        let reasoner = Arc::new(ScriptedReasoner::new());
        let registry = registry_of(vec![static_probe("noop", json!({}))]);
        let mut session = InvestigationSession::new("p", "/tmp", 1);
        session
            .terminate(SessionState::Aborted)
            .expect("terminate");

        let outcome = investigator(Arc::clone(&reasoner), registry).resume(
            session.clone(),
            &CancellationToken::new(),
            |_| {},
        );
        assert_eq!(outcome.session, session);
        assert_eq!(reasoner.total_calls(), 0);
    }

    #[test]
    fn summaries_label_outcomes() {
        let mut session = InvestigationSession::new("p", "/tmp", 3);
        let mut draft = session.begin_step();
        let now = Utc::now();
        let canonical = canonicalize("a", &json!({}));
        draft.push_invocation(ProbeInvocation {
            step: 1,
            probe_name: "a".to_string(),
            canonical_args: canonical.args.clone(),
            signature: canonical.signature.clone(),
            started_at: now,
            finished_at: now,
            outcome: ProbeOutcome::Success { payload: json!(1) },
            was_skipped_as_duplicate: false,
            effective_args: None,
        });
        draft.push_invocation(ProbeInvocation {
            step: 1,
            probe_name: "a".to_string(),
            canonical_args: canonical.args,
            signature: canonical.signature,
            started_at: now,
            finished_at: now,
            outcome: ProbeOutcome::Reused { invocation: 0 },
            was_skipped_as_duplicate: true,
            effective_args: None,
        });
        session.commit_step(draft, true).expect("commit");

        let statuses: Vec<_> = summarize_log(session.probe_log())
            .into_iter()
            .map(|s| s.status)
            .collect();
        assert_eq!(statuses, vec!["success", "duplicate"]);
    }
}
