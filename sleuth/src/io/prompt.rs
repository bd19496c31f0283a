//! Prompt rendering for the command-backed reasoner.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;
use serde_json::Value;

use crate::error::ReasoningCall;
use crate::reasoning::{
    DiagnoseRequest, DigestRequest, HypothesesRequest, PlanRequest, StopRequest,
};
use crate::registry::render_tools_spec;

const HYPOTHESES_TEMPLATE: &str = include_str!("prompts/generate_hypotheses.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan_probe.md");
const DIGEST_TEMPLATE: &str = include_str!("prompts/digest_evidence.md");
const STOP_TEMPLATE: &str = include_str!("prompts/decide_stop.md");
const DIAGNOSE_TEMPLATE: &str = include_str!("prompts/diagnose.md");

/// A reasoning request that can be rendered into a prompt.
pub trait PromptRequest: Serialize {
    const CALL: ReasoningCall;

    /// Markdown catalog section, for requests that offer probes.
    fn tools(&self) -> Option<String> {
        None
    }
}

impl PromptRequest for HypothesesRequest {
    const CALL: ReasoningCall = ReasoningCall::GenerateHypotheses;
}

impl PromptRequest for PlanRequest {
    const CALL: ReasoningCall = ReasoningCall::PlanProbe;

    fn tools(&self) -> Option<String> {
        Some(render_tools_spec(&self.catalog))
    }
}

impl PromptRequest for DigestRequest {
    const CALL: ReasoningCall = ReasoningCall::DigestEvidence;
}

impl PromptRequest for StopRequest {
    const CALL: ReasoningCall = ReasoningCall::DecideStop;
}

impl PromptRequest for DiagnoseRequest {
    const CALL: ReasoningCall = ReasoningCall::Diagnose;
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (call, source) in [
            (ReasoningCall::GenerateHypotheses, HYPOTHESES_TEMPLATE),
            (ReasoningCall::PlanProbe, PLAN_TEMPLATE),
            (ReasoningCall::DigestEvidence, DIGEST_TEMPLATE),
            (ReasoningCall::DecideStop, STOP_TEMPLATE),
            (ReasoningCall::Diagnose, DIAGNOSE_TEMPLATE),
        ] {
            env.add_template(call.as_str(), source)
                .expect("prompt template should be valid");
        }
        Self { env }
    }

    pub fn render<Q: PromptRequest>(&self, request: &Q) -> Result<String> {
        let mut context = serde_json::to_value(request).context("serialize prompt request")?;
        embed_json_fields(&mut context);
        if let (Some(tools), Some(object)) = (request.tools(), context.as_object_mut()) {
            object.insert("tools".to_string(), Value::String(tools));
        }
        let template = self
            .env
            .get_template(Q::CALL.as_str())
            .with_context(|| format!("load {} template", Q::CALL))?;
        let rendered = template
            .render(&context)
            .with_context(|| format!("render {} prompt", Q::CALL))?;
        Ok(rendered.trim().to_string() + "\n")
    }
}

/// Replace structured probe arguments and outcomes with JSON text so the
/// templates print them verbatim.
fn embed_json_fields(context: &mut Value) {
    for list in ["history", "probes", "outcomes"] {
        let Some(items) = context.get_mut(list).and_then(Value::as_array_mut) else {
            continue;
        };
        for item in items.iter_mut().filter_map(Value::as_object_mut) {
            if let Some(args) = item.get_mut("args") {
                *args = Value::String(args.to_string());
            }
            if let Some(outcome) = item.get_mut("outcome") {
                let text = serde_json::to_string_pretty(outcome).unwrap_or_default();
                *outcome = Value::String(text);
            }
        }
    }
}
