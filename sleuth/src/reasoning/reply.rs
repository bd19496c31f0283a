//! Validation of raw reasoning replies.
//!
//! Each reply passes three stages: shape normalization (aliases, casing,
//! loosely typed fields), JSON Schema validation, and deserialization into
//! the typed reply. Failure at any stage is a
//! [`InvestigationError::MalformedReasoningOutput`].

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::types::{Confidence, Hypothesis, HypothesisStatus, RootCause};
use crate::error::{InvestigationError, ReasoningCall};
use crate::registry::ProbeArgs;

const HYPOTHESES_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/hypotheses.schema.json"
));
const PROBE_PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/probe_plan.schema.json"
));
const EVIDENCE_DIGEST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/evidence_digest.schema.json"
));
const STOP_DECISION_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/stop_decision.schema.json"
));
const DIAGNOSIS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/diagnosis.schema.json"
));

/// JSON Schema text constraining the reply of `call`.
pub fn output_schema(call: ReasoningCall) -> &'static str {
    match call {
        ReasoningCall::GenerateHypotheses => HYPOTHESES_SCHEMA,
        ReasoningCall::PlanProbe => PROBE_PLAN_SCHEMA,
        ReasoningCall::DigestEvidence => EVIDENCE_DIGEST_SCHEMA,
        ReasoningCall::DecideStop => STOP_DECISION_SCHEMA,
        ReasoningCall::Diagnose => DIAGNOSIS_SCHEMA,
    }
}

/// Key aliases accepted from reasoning replies, per object kind.
const HYPOTHESIS_ALIASES: &[(&str, &str)] = &[("statement", "text"), ("hypothesis", "text")];
const PLAN_ALIASES: &[(&str, &str)] = &[("probe", "probe_name"), ("name", "probe_name")];
const STOP_ALIASES: &[(&str, &str)] = &[("reasoning", "rationale"), ("stop", "should_stop")];
const DIAGNOSIS_ALIASES: &[(&str, &str)] = &[
    ("root_cause", "description"),
    ("additional_notes", "notes"),
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HypothesesReply {
    pub hypotheses: Vec<ProposedHypothesis>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposedHypothesis {
    pub text: String,
    #[serde(default)]
    pub status: HypothesisStatus,
    #[serde(default)]
    pub confidence: Confidence,
}

impl From<ProposedHypothesis> for Hypothesis {
    fn from(proposed: ProposedHypothesis) -> Self {
        Hypothesis {
            status: proposed.status,
            confidence: proposed.confidence,
            ..Hypothesis::new(proposed.text.trim())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbePlan {
    pub probe_name: String,
    pub args: ProbeArgs,
    #[serde(default)]
    pub expected_signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvidenceDigest {
    pub findings: Vec<DigestedFinding>,
    pub hypothesis_updates: Vec<HypothesisUpdate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DigestedFinding {
    pub summary: String,
    #[serde(default)]
    pub detail: Option<String>,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HypothesisUpdate {
    pub text: String,
    pub status: HypothesisStatus,
    #[serde(default)]
    pub confidence: Option<Confidence>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StopDecision {
    pub should_stop: bool,
    pub rationale: String,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub missing_evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Diagnosis {
    pub description: String,
    pub confidence: Confidence,
    pub recommended_fixes: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl From<Diagnosis> for RootCause {
    fn from(diagnosis: Diagnosis) -> Self {
        RootCause {
            description: diagnosis.description,
            confidence: diagnosis.confidence,
            recommended_fixes: diagnosis.recommended_fixes,
            notes: diagnosis.notes.filter(|notes| !notes.trim().is_empty()),
        }
    }
}

/// Compiled schemas for every reply kind.
pub struct ReplyValidator {
    hypotheses: Validator,
    plan: Validator,
    digest: Validator,
    stop: Validator,
    diagnosis: Validator,
}

impl ReplyValidator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hypotheses: compile(ReasoningCall::GenerateHypotheses)?,
            plan: compile(ReasoningCall::PlanProbe)?,
            digest: compile(ReasoningCall::DigestEvidence)?,
            stop: compile(ReasoningCall::DecideStop)?,
            diagnosis: compile(ReasoningCall::Diagnose)?,
        })
    }

    pub fn hypotheses(&self, raw: Value) -> Result<HypothesesReply, InvestigationError> {
        let mut value = raw;
        // A bare array is accepted as the hypothesis list.
        if value.is_array() {
            let mut wrapped = Map::new();
            wrapped.insert("hypotheses".to_string(), value);
            value = Value::Object(wrapped);
        }
        if let Some(items) = value.get_mut("hypotheses").and_then(Value::as_array_mut) {
            for item in items {
                if let Some(text) = item.as_str().map(str::to_string) {
                    let mut object = Map::new();
                    object.insert("text".to_string(), Value::String(text));
                    *item = Value::Object(object);
                }
                rename_keys(item, HYPOTHESIS_ALIASES);
                lowercase_fields(item, &["status", "confidence"]);
            }
        }
        self.check(ReasoningCall::GenerateHypotheses, &self.hypotheses, value)
    }

    pub fn plan(&self, raw: Value) -> Result<ProbePlan, InvestigationError> {
        let mut value = raw;
        rename_keys(&mut value, PLAN_ALIASES);
        if let Some(object) = value.as_object_mut() {
            let replacement = match object.get("args") {
                None | Some(Value::Null) => Some(Map::new()),
                Some(Value::String(text)) => Some(parse_lenient_args(text)),
                Some(_) => None,
            };
            if let Some(args) = replacement {
                object.insert("args".to_string(), Value::Object(args));
            }
            if let Some(Value::String(name)) = object.get_mut("probe_name") {
                *name = name.trim().to_string();
            }
        }
        self.check(ReasoningCall::PlanProbe, &self.plan, value)
    }

    pub fn digest(&self, raw: Value) -> Result<EvidenceDigest, InvestigationError> {
        let mut value = raw;
        if let Some(object) = value.as_object_mut() {
            object
                .entry("findings")
                .or_insert_with(|| Value::Array(Vec::new()));
            object
                .entry("hypothesis_updates")
                .or_insert_with(|| Value::Array(Vec::new()));
        }
        for key in ["findings", "hypothesis_updates"] {
            if let Some(items) = value.get_mut(key).and_then(Value::as_array_mut) {
                for item in items {
                    rename_keys(item, HYPOTHESIS_ALIASES);
                    lowercase_fields(item, &["status", "confidence"]);
                }
            }
        }
        self.check(ReasoningCall::DigestEvidence, &self.digest, value)
    }

    pub fn stop(&self, raw: Value) -> Result<StopDecision, InvestigationError> {
        let mut value = raw;
        rename_keys(&mut value, STOP_ALIASES);
        lowercase_fields(&mut value, &["confidence"]);
        if let Some(object) = value.as_object_mut() {
            let parsed = match object.get("should_stop") {
                Some(Value::String(flag)) => match flag.trim().to_ascii_lowercase().as_str() {
                    "yes" | "true" => Some(true),
                    "no" | "false" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            if let Some(parsed) = parsed {
                object.insert("should_stop".to_string(), Value::Bool(parsed));
            }
        }
        self.check(ReasoningCall::DecideStop, &self.stop, value)
    }

    pub fn diagnosis(&self, raw: Value) -> Result<Diagnosis, InvestigationError> {
        let mut value = raw;
        rename_keys(&mut value, DIAGNOSIS_ALIASES);
        lowercase_fields(&mut value, &["confidence"]);
        if let Some(object) = value.as_object_mut() {
            let fixes = match object.get("recommended_fixes") {
                Some(Value::String(text)) => Some(split_fix_list(text)),
                _ => None,
            };
            if let Some(fixes) = fixes {
                let fixes = fixes.into_iter().map(Value::String).collect();
                object.insert("recommended_fixes".to_string(), Value::Array(fixes));
            }
        }
        self.check(ReasoningCall::Diagnose, &self.diagnosis, value)
    }

    fn check<T: DeserializeOwned>(
        &self,
        call: ReasoningCall,
        validator: &Validator,
        value: Value,
    ) -> Result<T, InvestigationError> {
        if !validator.is_valid(&value) {
            let messages = validator
                .iter_errors(&value)
                .map(|err| err.to_string())
                .collect::<Vec<_>>();
            return Err(InvestigationError::malformed(call, messages.join("; ")));
        }
        serde_json::from_value(value)
            .map_err(|err| InvestigationError::malformed(call, err.to_string()))
    }
}

fn compile(call: ReasoningCall) -> Result<Validator> {
    let schema: Value = serde_json::from_str(output_schema(call))
        .map_err(|err| anyhow!("parse {call} schema: {err}"))?;
    validator_for(&schema).map_err(|err| anyhow!("invalid {call} schema: {err}"))
}

fn rename_keys(value: &mut Value, aliases: &[(&str, &str)]) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for (alias, canonical) in aliases {
        if object.contains_key(*canonical) {
            continue;
        }
        if let Some(inner) = object.remove(*alias) {
            object.insert((*canonical).to_string(), inner);
        }
    }
}

fn lowercase_fields(value: &mut Value, fields: &[&str]) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    for field in fields {
        if let Some(Value::String(text)) = object.get_mut(*field) {
            *text = text.trim().to_ascii_lowercase();
        }
    }
}

/// Parse planner arguments given as a string.
///
/// Accepts a JSON object, or `key=value` pairs separated by commas or
/// whitespace. Integer-looking values become numbers, quotes are stripped.
pub fn parse_lenient_args(text: &str) -> ProbeArgs {
    static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*("[^"]*"|'[^']*'|[^,\s]+)"#)
            .expect("argument pair regex should be valid")
    });

    let trimmed = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return map;
    }
    let mut args = ProbeArgs::new();
    for caps in PAIR_RE.captures_iter(trimmed) {
        let (Some(key), Some(raw)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let raw = raw.as_str();
        let unquoted = raw
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
        let value = match unquoted {
            Some(text) => Value::String(text.to_string()),
            None => match raw.parse::<i64>() {
                Ok(int) => Value::from(int),
                Err(_) => Value::String(raw.to_string()),
            },
        };
        args.insert(key.as_str().to_string(), value);
    }
    args
}

/// Split a free-text fix list ("1. do x\n2. do y") into items.
fn split_fix_list(text: &str) -> Vec<String> {
    static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(?:\d+[.)]|[-*])\s*").expect("bullet regex should be valid")
    });
    text.lines()
        .map(|line| BULLET_RE.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
