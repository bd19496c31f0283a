//! Shared deterministic types for the investigation record.
//!
//! These types are the persisted contract of a session. They carry no
//! behavior beyond small classification helpers and must serialize
//! identically across runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of an investigation session.
///
/// `Active` is the only non-terminal state. Transitions only ever leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Concluded,
    Exhausted,
    Aborted,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self != SessionState::Active
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Concluded => "concluded",
            SessionState::Exhausted => "exhausted",
            SessionState::Aborted => "aborted",
            SessionState::Errored => "errored",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal confidence shared by findings, hypotheses and diagnoses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HypothesisStatus {
    #[default]
    Active,
    Confirmed,
    Refuted,
}

/// Failure class of a probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    /// The probe reported a failure or faulted while running.
    Execution,
    /// The probe did not finish within its timeout.
    Timeout,
}

/// Structured error recorded in place of a probe payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Result of one probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success { payload: Value },
    Error { error: ProbeError },
    /// Duplicate entries point at the log index that holds the real outcome.
    Reused { invocation: usize },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            ProbeOutcome::Success { payload } => Some(payload),
            _ => None,
        }
    }
}

/// One entry of the append-only probe log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeInvocation {
    /// Step (1-indexed) that produced this entry.
    pub step: u32,
    pub probe_name: String,
    pub canonical_args: Value,
    pub signature: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub was_skipped_as_duplicate: bool,
    /// Arguments passed to the probe after dependency patches, when they
    /// differ from `canonical_args`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_args: Option<Value>,
}

/// What produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Interpretation produced by evidence digestion.
    Observation,
    DuplicateSkipped,
    InvalidProbe,
    ProbeExecutionError,
    ProbeTimeout,
    DependencyCycle,
    MalformedReasoningOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Step (1-indexed) during which the finding was recorded.
    pub step_ref: u32,
    pub kind: FindingKind,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Indices into the session probe log.
    pub evidence_refs: Vec<usize>,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub text: String,
    pub status: HypothesisStatus,
    #[serde(default)]
    pub confidence: Confidence,
    /// Indices into the session findings.
    #[serde(default)]
    pub supporting_refs: Vec<usize>,
    #[serde(default)]
    pub refuting_refs: Vec<usize>,
}

impl Hypothesis {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: HypothesisStatus::Active,
            confidence: Confidence::Low,
            supporting_refs: Vec::new(),
            refuting_refs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootCause {
    pub description: String,
    pub confidence: Confidence,
    pub recommended_fixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confidence_is_ordinal() {
        assert!(Confidence::Low < Confidence::Medium);
        assert!(Confidence::Medium < Confidence::High);
    }

    #[test]
    fn only_active_is_non_terminal() {
        assert!(!SessionState::Active.is_terminal());
        for state in [
            SessionState::Concluded,
            SessionState::Exhausted,
            SessionState::Aborted,
            SessionState::Errored,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = ProbeOutcome::Reused { invocation: 2 };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value, json!({"status": "reused", "invocation": 2}));

        let error = ProbeOutcome::Error {
            error: ProbeError {
                kind: ProbeErrorKind::Timeout,
                message: "slow".to_string(),
                details: None,
            },
        };
        let value = serde_json::to_value(&error).expect("serialize");
        assert_eq!(
            value,
            json!({"status": "error", "error": {"kind": "timeout", "message": "slow"}})
        );
    }
}
