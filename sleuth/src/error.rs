//! Domain error taxonomy for an investigation.
//!
//! Recoverable variants never leave the orchestrator: they are converted into
//! findings at the step boundary. Only the terminal state of a session tells
//! the caller which class of failure ended it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{FindingKind, SessionState};

/// Reasoning port operation that produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningCall {
    GenerateHypotheses,
    PlanProbe,
    DigestEvidence,
    DecideStop,
    Diagnose,
}

impl ReasoningCall {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningCall::GenerateHypotheses => "generate_hypotheses",
            ReasoningCall::PlanProbe => "plan_probe",
            ReasoningCall::DigestEvidence => "digest_evidence",
            ReasoningCall::DecideStop => "decide_stop",
            ReasoningCall::Diagnose => "diagnose",
        }
    }
}

impl fmt::Display for ReasoningCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvestigationError {
    #[error("probe `{probe}` failed: {message}")]
    ProbeExecution { probe: String, message: String },

    #[error("probe `{probe}` timed out after {timeout_ms}ms")]
    ProbeTimeout { probe: String, timeout_ms: u64 },

    #[error("dependency cycle: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("invalid probe `{probe}`: {reason}")]
    InvalidProbe { probe: String, reason: String },

    #[error("malformed {call} output: {reason}")]
    MalformedReasoningOutput { call: ReasoningCall, reason: String },

    #[error("step budget of {budget} exhausted")]
    BudgetExhausted { budget: u32 },

    #[error("session aborted by cancellation")]
    SessionAborted,

    #[error("session is {state} and can no longer be modified")]
    SessionClosed { state: SessionState },

    #[error("draft for step {step} no longer matches the session")]
    StaleDraft { step: u32 },
}

impl InvestigationError {
    /// Finding kind used when this error is recorded in the session log.
    ///
    /// Returns `None` for errors that end the session instead of being logged.
    pub fn finding_kind(&self) -> Option<FindingKind> {
        match self {
            InvestigationError::ProbeExecution { .. } => Some(FindingKind::ProbeExecutionError),
            InvestigationError::ProbeTimeout { .. } => Some(FindingKind::ProbeTimeout),
            InvestigationError::DependencyCycle { .. } => Some(FindingKind::DependencyCycle),
            InvestigationError::InvalidProbe { .. } => Some(FindingKind::InvalidProbe),
            InvestigationError::MalformedReasoningOutput { .. } => {
                Some(FindingKind::MalformedReasoningOutput)
            }
            InvestigationError::BudgetExhausted { .. }
            | InvestigationError::SessionAborted
            | InvestigationError::SessionClosed { .. }
            | InvestigationError::StaleDraft { .. } => None,
        }
    }

    pub fn invalid_probe(probe: &str, reason: impl Into<String>) -> Self {
        InvestigationError::InvalidProbe {
            probe: probe.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(call: ReasoningCall, reason: impl Into<String>) -> Self {
        InvestigationError::MalformedReasoningOutput {
            call,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_chain() {
        let err = InvestigationError::DependencyCycle {
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn terminal_errors_have_no_finding_kind() {
        assert_eq!(InvestigationError::SessionAborted.finding_kind(), None);
        assert_eq!(
            InvestigationError::BudgetExhausted { budget: 3 }.finding_kind(),
            None
        );
        assert_eq!(
            InvestigationError::malformed(ReasoningCall::PlanProbe, "not json").finding_kind(),
            Some(FindingKind::MalformedReasoningOutput)
        );
    }
}
