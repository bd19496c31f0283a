//! Immutable catalog of probes.
//!
//! A [`ProbeRegistry`] is assembled once with [`ProbeRegistryBuilder`] and then
//! shared read-only (`Arc`) with the orchestrator. Each entry carries the
//! calling contract, the schema shown to the planner, and the dependency
//! descriptors the resolver walks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::InvestigationError;

/// Arguments passed to a probe.
pub type ProbeArgs = Map<String, Value>;

/// Patch derived from an upstream payload.
pub type Transform = Arc<dyn Fn(&Value) -> ProbeArgs + Send + Sync>;

/// Argument names commonly produced by planners, mapped to their canonical key.
const ARG_ALIASES: &[(&str, &str)] = &[
    ("container_name", "container"),
    ("cmd", "command"),
    ("tail_lines", "tail"),
    ("timeout_s", "timeout"),
];

/// Environment handed to a probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    /// Root of the workspace under investigation.
    pub workspace: PathBuf,
    /// Budget the probe should respect for its own child processes.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Structured failure reported by a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeFault {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ProbeFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Calling contract of a probe. Implementations report failures as
/// [`ProbeFault`] values; panics are contained by the executor.
pub trait ProbeContract: Send + Sync {
    fn execute(&self, args: &ProbeArgs, ctx: &ProbeContext) -> Result<Value, ProbeFault>;
}

impl<F> ProbeContract for F
where
    F: Fn(&ProbeArgs, &ProbeContext) -> Result<Value, ProbeFault> + Send + Sync,
{
    fn execute(&self, args: &ProbeArgs, ctx: &ProbeContext) -> Result<Value, ProbeFault> {
        self(args, ctx)
    }
}

/// Whether a probe only observes or runs commands inside the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    #[default]
    ReadOnly,
    ExecInTarget,
}

/// Upstream probe plus the transform that patches this probe's arguments.
#[derive(Clone)]
pub struct Dependency {
    pub requires: String,
    pub transform: Transform,
}

impl Dependency {
    pub fn new(
        requires: impl Into<String>,
        transform: impl Fn(&Value) -> ProbeArgs + Send + Sync + 'static,
    ) -> Self {
        Self {
            requires: requires.into(),
            transform: Arc::new(transform),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ProbeSpec {
    pub name: String,
    pub description: String,
    /// Declared arguments and their documentation.
    pub args: BTreeMap<String, String>,
    pub required_args: BTreeSet<String>,
    /// Arguments only ever supplied by dependency transforms.
    pub derived_args: BTreeSet<String>,
    pub default_args: ProbeArgs,
    pub example: Option<Value>,
    pub side_effects: SideEffects,
    pub dependencies: Vec<Dependency>,
    pub contract: Arc<dyn ProbeContract>,
}

impl fmt::Debug for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeSpec")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("required_args", &self.required_args)
            .field("side_effects", &self.side_effects)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl ProbeSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        contract: impl ProbeContract + 'static,
    ) -> Self {
        Self::from_contract(name, description, Arc::new(contract))
    }

    pub fn from_contract(
        name: impl Into<String>,
        description: impl Into<String>,
        contract: Arc<dyn ProbeContract>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: BTreeMap::new(),
            required_args: BTreeSet::new(),
            derived_args: BTreeSet::new(),
            default_args: ProbeArgs::new(),
            example: None,
            side_effects: SideEffects::ReadOnly,
            dependencies: Vec::new(),
            contract,
        }
    }

    pub fn arg(mut self, name: &str, doc: &str) -> Self {
        self.args.insert(name.to_string(), doc.to_string());
        self
    }

    pub fn required_arg(mut self, name: &str, doc: &str) -> Self {
        self.required_args.insert(name.to_string());
        self.arg(name, doc)
    }

    pub fn derived_arg(mut self, name: &str, doc: &str) -> Self {
        self.derived_args.insert(name.to_string());
        self.arg(name, doc)
    }

    pub fn default_arg(mut self, name: &str, value: Value) -> Self {
        self.default_args.insert(name.to_string(), value);
        self
    }

    pub fn example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = side_effects;
        self
    }

    pub fn requires(
        mut self,
        upstream: &str,
        transform: impl Fn(&Value) -> ProbeArgs + Send + Sync + 'static,
    ) -> Self {
        self.dependencies.push(Dependency::new(upstream, transform));
        self
    }

    /// Planner-facing view of this probe.
    pub fn schema(&self) -> ProbeSchema {
        ProbeSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            args: self
                .args
                .iter()
                .filter(|(name, _)| !self.derived_args.contains(*name))
                .map(|(name, doc)| ArgDoc {
                    name: name.clone(),
                    description: doc.clone(),
                    required: self.required_args.contains(name),
                })
                .collect(),
            example: self.example.clone(),
            side_effects: self.side_effects,
            requires: self
                .dependencies
                .iter()
                .map(|dep| dep.requires.clone())
                .collect(),
        }
    }

    /// Defaults overlaid with the planner's arguments.
    ///
    /// Aliases are normalized, undeclared keys are dropped when the probe
    /// declares arguments, and derived arguments are always dropped. A
    /// required argument that is neither supplied, defaulted nor derived is
    /// an [`InvestigationError::InvalidProbe`].
    pub fn prepare_args(&self, raw: &ProbeArgs) -> Result<ProbeArgs, InvestigationError> {
        let mut args = self.default_args.clone();
        for (key, value) in normalize_aliases(raw) {
            if self.derived_args.contains(&key) {
                continue;
            }
            if !self.args.is_empty() && !self.args.contains_key(&key) {
                continue;
            }
            args.insert(key, value);
        }

        let missing: Vec<&str> = self
            .required_args
            .iter()
            .filter(|name| !self.derived_args.contains(*name))
            .filter(|name| args.get(*name).is_none_or(is_empty_value))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(InvestigationError::invalid_probe(
                &self.name,
                format!("missing required arguments: {}", missing.join(", ")),
            ));
        }
        Ok(args)
    }
}

/// Argument documentation shown to the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDoc {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Serializable catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSchema {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<Value>,
    pub side_effects: SideEffects,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ProbeRegistryBuilder {
    probes: BTreeMap<String, ProbeSpec>,
}

impl ProbeRegistryBuilder {
    pub fn register(mut self, spec: ProbeSpec) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(anyhow!("probe name must be non-empty"));
        }
        if self.probes.contains_key(&spec.name) {
            return Err(anyhow!("probe `{}` registered twice", spec.name));
        }
        self.probes.insert(spec.name.clone(), spec);
        Ok(self)
    }

    /// Freeze the catalog. Every dependency must name a registered probe;
    /// cycles are allowed here and reported per step by the resolver.
    pub fn build(self) -> Result<ProbeRegistry> {
        for spec in self.probes.values() {
            for dep in &spec.dependencies {
                if !self.probes.contains_key(&dep.requires) {
                    return Err(anyhow!(
                        "probe `{}` requires unknown probe `{}`",
                        spec.name,
                        dep.requires
                    ));
                }
            }
        }
        Ok(ProbeRegistry {
            probes: self.probes,
        })
    }
}

#[derive(Debug)]
pub struct ProbeRegistry {
    probes: BTreeMap<String, ProbeSpec>,
}

impl ProbeRegistry {
    pub fn builder() -> ProbeRegistryBuilder {
        ProbeRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<&ProbeSpec, InvestigationError> {
        self.probes
            .get(name)
            .ok_or_else(|| InvestigationError::invalid_probe(name, "not in the probe catalog"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.probes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Schemas of every probe, ordered by name.
    pub fn catalog(&self) -> Vec<ProbeSchema> {
        self.probes.values().map(ProbeSpec::schema).collect()
    }
}

/// Rewrite alias keys to their canonical names. An explicit canonical key wins.
pub fn normalize_aliases(raw: &ProbeArgs) -> ProbeArgs {
    let mut out = ProbeArgs::new();
    for (key, value) in raw {
        let canonical = ARG_ALIASES
            .iter()
            .find(|(alias, _)| alias == key)
            .map(|(_, canonical)| *canonical);
        match canonical {
            Some(canonical) => {
                if !raw.contains_key(canonical) {
                    out.insert(canonical.to_string(), value.clone());
                }
            }
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// True for null, empty strings, empty arrays and empty objects.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Fill keys of `args` that are absent or empty from `patch`.
pub fn apply_patch(args: &mut ProbeArgs, patch: ProbeArgs) {
    for (key, value) in patch {
        if args.get(&key).is_none_or(is_empty_value) {
            args.insert(key, value);
        }
    }
}

/// Markdown listing of the catalog for prompt-based planners.
pub fn render_tools_spec(catalog: &[ProbeSchema]) -> String {
    let mut lines = vec!["# Available Diagnostic Probes".to_string(), String::new()];
    for schema in catalog {
        lines.push(format!("## {}", schema.name));
        lines.push(schema.description.clone());
        if schema.side_effects == SideEffects::ExecInTarget {
            lines.push("_Runs commands inside the target._".to_string());
        }
        if schema.args.is_empty() {
            lines.push(String::new());
            lines.push("**Arguments:** None".to_string());
        } else {
            lines.push(String::new());
            lines.push("**Arguments:**".to_string());
            for arg in &schema.args {
                let marker = if arg.required { "REQUIRED" } else { "optional" };
                lines.push(format!(
                    "  - `{}` ({marker}): {}",
                    arg.name, arg.description
                ));
            }
        }
        if !schema.requires.is_empty() {
            lines.push(format!(
                "\n**Runs first:** {}",
                schema.requires.join(", ")
            ));
        }
        let example = schema
            .example
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "{}".to_string());
        lines.push(format!("\n**Example:** `{example}`\n"));
    }
    lines.join("\n")
}
