//! Boundary to the reasoning service.
//!
//! Adapters implement [`ReasoningPort`] and return raw JSON. Nothing they
//! return is trusted: [`reply::ReplyValidator`] is the only place raw replies
//! become typed values, and any adapter error, timeout or invalid shape is a
//! malformed reply as far as the orchestrator is concerned.

pub mod reply;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::core::types::{Finding, Hypothesis, ProbeOutcome, SessionState};
use crate::registry::ProbeSchema;

/// Abstract reasoning service. Implementations hold no session state.
pub trait ReasoningPort: Send + Sync {
    fn generate_hypotheses(&self, request: &HypothesesRequest) -> Result<Value>;
    fn plan_probe(&self, request: &PlanRequest) -> Result<Value>;
    fn digest_evidence(&self, request: &DigestRequest) -> Result<Value>;
    fn decide_stop(&self, request: &StopRequest) -> Result<Value>;
    fn diagnose(&self, request: &DiagnoseRequest) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HypothesesRequest {
    pub problem: String,
    /// Step (1-indexed) being planned.
    pub step: u32,
    pub budget: u32,
    pub findings: Vec<Finding>,
    pub hypotheses: Vec<Hypothesis>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub problem: String,
    pub hypotheses: Vec<Hypothesis>,
    pub findings: Vec<Finding>,
    pub catalog: Vec<ProbeSchema>,
    /// Probes already run, so the planner can avoid repeats.
    pub history: Vec<ProbeSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DigestRequest {
    pub problem: String,
    pub hypotheses: Vec<Hypothesis>,
    pub findings: Vec<Finding>,
    pub outcomes: Vec<ObservedOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopRequest {
    pub problem: String,
    pub findings: Vec<Finding>,
    pub hypotheses: Vec<Hypothesis>,
    pub step: u32,
    pub budget: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnoseRequest {
    pub problem: String,
    pub findings: Vec<Finding>,
    pub hypotheses: Vec<Hypothesis>,
    pub probes: Vec<ProbeSummary>,
    /// State the session will enter once diagnosed.
    pub closing_state: SessionState,
}

/// Compact view of a probe log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub index: usize,
    pub step: u32,
    pub probe_name: String,
    pub args: Value,
    pub status: &'static str,
}

/// A log entry handed to evidence digestion, with duplicates resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedOutcome {
    pub index: usize,
    pub probe_name: String,
    pub args: Value,
    pub duplicate: bool,
    pub outcome: ProbeOutcome,
}
