//! The investigation session aggregate.
//!
//! A session is append-only while `Active` and frozen afterwards. All changes
//! made during one loop step are staged in a [`StepDraft`] and applied by
//! [`InvestigationSession::commit_step`], so a step is either fully recorded or
//! not recorded at all (the cancellation boundary).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::types::{
    Confidence, Finding, FindingKind, Hypothesis, ProbeInvocation, ProbeOutcome, RootCause,
    SessionState,
};
use crate::error::InvestigationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationSession {
    id: String,
    problem: String,
    workspace: String,
    budget: u32,
    step: u32,
    state: SessionState,
    probe_log: Vec<ProbeInvocation>,
    findings: Vec<Finding>,
    hypotheses: Vec<Hypothesis>,
    executed_signatures: BTreeSet<String>,
    consecutive_malformed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_rationale: Option<String>,
    root_cause: Option<RootCause>,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

/// Generate a short opaque session id (`inv-` + 8 hex characters).
pub fn new_session_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("inv-{}", &uuid[..8])
}

impl InvestigationSession {
    pub fn new(problem: impl Into<String>, workspace: impl Into<String>, budget: u32) -> Self {
        Self::with_id(new_session_id(), problem, workspace, budget)
    }

    pub fn with_id(
        id: impl Into<String>,
        problem: impl Into<String>,
        workspace: impl Into<String>,
        budget: u32,
    ) -> Self {
        Self {
            id: id.into(),
            problem: problem.into(),
            workspace: workspace.into(),
            budget,
            step: 0,
            state: SessionState::Active,
            probe_log: Vec::new(),
            findings: Vec::new(),
            hypotheses: Vec::new(),
            executed_signatures: BTreeSet::new(),
            consecutive_malformed: 0,
            stop_rationale: None,
            root_cause: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn problem(&self) -> &str {
        &self.problem
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Completed steps so far.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn probe_log(&self) -> &[ProbeInvocation] {
        &self.probe_log
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn executed_signatures(&self) -> &BTreeSet<String> {
        &self.executed_signatures
    }

    pub fn consecutive_malformed(&self) -> u32 {
        self.consecutive_malformed
    }

    pub fn stop_rationale(&self) -> Option<&str> {
        self.stop_rationale.as_deref()
    }

    pub fn root_cause(&self) -> Option<&RootCause> {
        self.root_cause.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn budget_spent(&self) -> bool {
        self.step >= self.budget
    }

    pub fn ensure_active(&self) -> Result<(), InvestigationError> {
        if self.state.is_terminal() {
            return Err(InvestigationError::SessionClosed { state: self.state });
        }
        Ok(())
    }

    /// Outcome of the log entry at `index`, following duplicate references.
    pub fn outcome_of(&self, index: usize) -> Option<&ProbeOutcome> {
        resolve_outcome(&self.probe_log, index)
    }

    /// Latest non-duplicate invocation carrying `signature`.
    pub fn original_invocation(&self, signature: &str) -> Option<usize> {
        self.probe_log
            .iter()
            .rposition(|inv| !inv.was_skipped_as_duplicate && inv.signature == signature)
    }

    /// Latest successful non-duplicate invocation carrying `signature`.
    pub fn successful_invocation(&self, signature: &str) -> Option<usize> {
        self.probe_log.iter().rposition(|inv| {
            !inv.was_skipped_as_duplicate && inv.signature == signature && inv.outcome.is_success()
        })
    }

    /// Stage a new step against the current state.
    pub fn begin_step(&self) -> StepDraft {
        StepDraft {
            step: self.step + 1,
            log_base: self.probe_log.len(),
            findings_base: self.findings.len(),
            invocations: Vec::new(),
            findings: Vec::new(),
            hypotheses: self.hypotheses.clone(),
            signatures: BTreeSet::new(),
            consecutive_malformed: self.consecutive_malformed,
            stop_rationale: None,
        }
    }

    /// Apply a staged step. `completed` advances the step counter.
    pub fn commit_step(
        &mut self,
        draft: StepDraft,
        completed: bool,
    ) -> Result<(), InvestigationError> {
        self.ensure_active()?;
        if draft.log_base != self.probe_log.len() || draft.findings_base != self.findings.len() {
            return Err(InvestigationError::StaleDraft { step: draft.step });
        }
        if completed && self.step >= self.budget {
            return Err(InvestigationError::BudgetExhausted {
                budget: self.budget,
            });
        }
        self.probe_log.extend(draft.invocations);
        self.findings.extend(draft.findings);
        self.hypotheses = draft.hypotheses;
        self.executed_signatures.extend(draft.signatures);
        self.consecutive_malformed = draft.consecutive_malformed;
        if draft.stop_rationale.is_some() {
            self.stop_rationale = draft.stop_rationale;
        }
        if completed {
            self.step += 1;
        }
        Ok(())
    }

    /// Record a malformed reply outside of a step and return the new streak length.
    pub fn record_malformed(&mut self, err: &InvestigationError) -> Result<u32, InvestigationError> {
        self.ensure_active()?;
        self.findings.push(error_finding(self.step, err, Vec::new()));
        self.consecutive_malformed += 1;
        Ok(self.consecutive_malformed)
    }

    pub fn reset_malformed(&mut self) -> Result<(), InvestigationError> {
        self.ensure_active()?;
        self.consecutive_malformed = 0;
        Ok(())
    }

    /// Leave `Active` with a diagnosis. Only `Concluded` and `Exhausted` carry one.
    pub fn conclude(
        &mut self,
        state: SessionState,
        root_cause: RootCause,
    ) -> Result<(), InvestigationError> {
        self.ensure_active()?;
        if !matches!(state, SessionState::Concluded | SessionState::Exhausted) {
            return Err(InvestigationError::SessionClosed { state });
        }
        self.root_cause = Some(root_cause);
        self.finish(state);
        Ok(())
    }

    /// Leave `Active` without a diagnosis (`Aborted` or `Errored`).
    pub fn terminate(&mut self, state: SessionState) -> Result<(), InvestigationError> {
        self.ensure_active()?;
        if !matches!(state, SessionState::Aborted | SessionState::Errored) {
            return Err(InvestigationError::SessionClosed { state });
        }
        self.finish(state);
        Ok(())
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// Changes accumulated during one loop step.
#[derive(Debug, Clone)]
pub struct StepDraft {
    step: u32,
    log_base: usize,
    findings_base: usize,
    invocations: Vec<ProbeInvocation>,
    findings: Vec<Finding>,
    hypotheses: Vec<Hypothesis>,
    signatures: BTreeSet<String>,
    consecutive_malformed: u32,
    stop_rationale: Option<String>,
}

impl StepDraft {
    /// Step number (1-indexed) this draft will become.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn consecutive_malformed(&self) -> u32 {
        self.consecutive_malformed
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn staged_findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Stage an invocation and return its absolute log index.
    pub fn push_invocation(&mut self, invocation: ProbeInvocation) -> usize {
        self.signatures.insert(invocation.signature.clone());
        self.invocations.push(invocation);
        self.log_base + self.invocations.len() - 1
    }

    /// Staged invocation at an absolute log index.
    pub fn invocation(&self, index: usize) -> Option<&ProbeInvocation> {
        index
            .checked_sub(self.log_base)
            .and_then(|offset| self.invocations.get(offset))
    }

    /// Stage a finding and return its absolute index.
    pub fn push_finding(&mut self, finding: Finding) -> usize {
        self.findings.push(finding);
        self.findings_base + self.findings.len() - 1
    }

    /// Stage a finding describing a recoverable error.
    pub fn record_error(&mut self, err: &InvestigationError, evidence_refs: Vec<usize>) -> usize {
        let finding = error_finding(self.step, err, evidence_refs);
        self.push_finding(finding)
    }

    /// Stage a malformed reply and return the resulting streak length.
    pub fn record_malformed(&mut self, err: &InvestigationError) -> u32 {
        self.record_error(err, Vec::new());
        self.consecutive_malformed += 1;
        self.consecutive_malformed
    }

    pub fn reasoning_succeeded(&mut self) {
        self.consecutive_malformed = 0;
    }

    pub fn merge_hypotheses(&mut self, incoming: Vec<Hypothesis>) {
        for hypothesis in incoming {
            merge_hypothesis(&mut self.hypotheses, hypothesis);
        }
    }

    pub fn set_stop_rationale(&mut self, rationale: String) {
        self.stop_rationale = Some(rationale);
    }
}

/// Merge by text equality: known hypotheses take the new status and
/// confidence and gain references, unknown ones are appended.
pub fn merge_hypothesis(existing: &mut Vec<Hypothesis>, incoming: Hypothesis) {
    let key = incoming.text.trim();
    match existing.iter_mut().find(|h| h.text.trim() == key) {
        Some(current) => {
            current.status = incoming.status;
            current.confidence = incoming.confidence;
            extend_unique(&mut current.supporting_refs, incoming.supporting_refs);
            extend_unique(&mut current.refuting_refs, incoming.refuting_refs);
        }
        None => existing.push(incoming),
    }
}

fn extend_unique(target: &mut Vec<usize>, refs: Vec<usize>) {
    for r in refs {
        if !target.contains(&r) {
            target.push(r);
        }
    }
}

/// Follow `Reused` references to the outcome that was actually observed.
pub fn resolve_outcome(log: &[ProbeInvocation], index: usize) -> Option<&ProbeOutcome> {
    let mut current = index;
    // Reused entries only point backwards, so this walk is bounded by the index.
    loop {
        let invocation = log.get(current)?;
        match &invocation.outcome {
            ProbeOutcome::Reused { invocation } if *invocation < current => current = *invocation,
            ProbeOutcome::Reused { .. } => return None,
            outcome => return Some(outcome),
        }
    }
}

fn error_finding(step: u32, err: &InvestigationError, evidence_refs: Vec<usize>) -> Finding {
    Finding {
        step_ref: step,
        kind: err.finding_kind().unwrap_or(FindingKind::Observation),
        summary: err.to_string(),
        detail: None,
        evidence_refs,
        confidence: Confidence::High,
    }
}
