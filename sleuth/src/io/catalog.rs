//! Command-backed probes declared in `.sleuth/probes.toml`.
//!
//! Each `[[probe]]` table becomes a [`ProbeSpec`] whose contract runs an argv
//! template in the workspace. `{name}` in a template token is replaced by the
//! argument value; a token that is exactly `{name}` with an array value
//! expands to one token per element, and is dropped when the argument is
//! absent. Dependencies map JSON pointers of the upstream payload onto
//! argument names, which makes those arguments derived.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::io::process::run_command_with_timeout;
use crate::registry::{
    ProbeArgs, ProbeContext, ProbeContract, ProbeFault, ProbeSpec, SideEffects,
};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex should be valid")
});

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default, rename = "probe")]
    probes: Vec<CommandProbeDef>,
}

/// How a command's stdout becomes the probe payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Text,
    Json,
    JsonLines,
}

/// One `[[probe]]` table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandProbeDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub output: OutputMode,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub defaults: ProbeArgs,
    #[serde(default)]
    pub side_effects: SideEffects,
    #[serde(default)]
    pub example: Option<Value>,
    #[serde(default)]
    pub requires: Vec<DependencyDef>,
}

/// `[[probe.requires]]`: upstream probe plus `argument = "/json/pointer"` pairs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DependencyDef {
    pub probe: String,
    #[serde(default)]
    pub map: BTreeMap<String, String>,
}

/// Parse a catalog file. A missing file is an empty catalog.
pub fn load_catalog(path: &Path) -> Result<Vec<CommandProbeDef>> {
    if !path.exists() {
        debug!(path = %path.display(), "no probe catalog");
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: CatalogFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    for def in &file.probes {
        def.validate()
            .with_context(|| format!("probe `{}` in {}", def.name, path.display()))?;
    }
    debug!(path = %path.display(), probes = file.probes.len(), "probe catalog loaded");
    Ok(file.probes)
}

/// Load a catalog and turn it into registry entries.
pub fn load_command_probes(path: &Path) -> Result<Vec<ProbeSpec>> {
    Ok(load_catalog(path)?
        .into_iter()
        .map(CommandProbeDef::into_spec)
        .collect())
}

impl CommandProbeDef {
    fn validate(&self) -> Result<()> {
        if self.command.first().is_none_or(|c| c.trim().is_empty()) {
            bail!("command must be a non-empty array");
        }
        for dep in &self.requires {
            for (arg, pointer) in &dep.map {
                if !pointer.is_empty() && !pointer.starts_with('/') {
                    bail!("map `{arg}`: `{pointer}` is not a JSON pointer");
                }
            }
        }
        Ok(())
    }

    pub fn into_spec(self) -> ProbeSpec {
        let contract = CommandProbe {
            name: self.name.clone(),
            command: self.command,
            output: self.output,
        };
        let mut spec = ProbeSpec::new(self.name, self.description, contract)
            .side_effects(self.side_effects);
        for (name, doc) in &self.args {
            spec = spec.arg(name, doc);
        }
        for name in &self.required {
            let doc = self.args.get(name).map_or("", String::as_str);
            spec = spec.required_arg(name, doc);
        }
        for (name, value) in self.defaults {
            spec = spec.default_arg(&name, value);
        }
        if let Some(example) = self.example {
            spec = spec.example(example);
        }
        for dep in self.requires {
            for arg in dep.map.keys() {
                let doc = self.args.get(arg).map_or("", String::as_str);
                spec = spec.derived_arg(arg, doc);
            }
            let map = dep.map;
            spec = spec.requires(&dep.probe, move |payload: &Value| {
                map.iter()
                    .filter_map(|(arg, pointer)| {
                        payload
                            .pointer(pointer)
                            .filter(|v| !v.is_null())
                            .map(|v| (arg.clone(), v.clone()))
                    })
                    .collect()
            });
        }
        spec
    }
}

/// Runs a rendered argv in the workspace.
struct CommandProbe {
    name: String,
    command: Vec<String>,
    output: OutputMode,
}

impl ProbeContract for CommandProbe {
    fn execute(&self, args: &ProbeArgs, ctx: &ProbeContext) -> Result<Value, ProbeFault> {
        let argv = render_command(&self.command, args)?;
        let Some((program, rest)) = argv.split_first() else {
            return Err(ProbeFault::new("command rendered to nothing"));
        };
        let mut cmd = Command::new(program);
        cmd.args(rest).current_dir(&ctx.workspace);
        debug!(probe = %self.name, ?argv, "running command probe");

        let output = run_command_with_timeout(cmd, None, ctx.timeout, ctx.output_limit_bytes)
            .map_err(|err| ProbeFault::new(format!("{err:#}")))?;
        if output.timed_out {
            return Err(ProbeFault::new(format!("`{program}` timed out"))
                .with_details(json!({"timeout_ms": ctx.timeout.as_millis() as u64})));
        }
        if !output.status.success() {
            return Err(ProbeFault::new(format!(
                "`{program}` exited with status {}",
                output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string())
            ))
            .with_details(json!({
                "exit_code": output.status.code(),
                "stdout": output.stdout_text(),
                "stderr": output.stderr_text(),
            })));
        }

        let stdout = output.stdout_text();
        match self.output {
            OutputMode::Text => Ok(json!({
                "stdout": stdout,
                "stderr": output.stderr_text(),
                "truncated_bytes": output.stdout_truncated,
            })),
            OutputMode::Json => serde_json::from_str(&stdout)
                .map_err(|err| ProbeFault::new(format!("stdout is not JSON: {err}"))),
            OutputMode::JsonLines => stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .enumerate()
                .map(|(n, line)| {
                    serde_json::from_str(line).map_err(|err| {
                        ProbeFault::new(format!("stdout line {} is not JSON: {err}", n + 1))
                    })
                })
                .collect::<Result<Vec<Value>, _>>()
                .map(Value::Array),
        }
    }
}

/// Substitute `{name}` placeholders in an argv template.
pub fn render_command(template: &[String], args: &ProbeArgs) -> Result<Vec<String>, ProbeFault> {
    let mut argv = Vec::with_capacity(template.len());
    for token in template {
        if let Some(caps) = PLACEHOLDER_RE.captures(token)
            && caps.get(0).is_some_and(|m| m.as_str() == token)
        {
            let name = &caps[1];
            match args.get(name) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => argv.extend(items.iter().map(scalar_text)),
                Some(value) => argv.push(scalar_text(value)),
            }
            continue;
        }

        let mut missing = None;
        let rendered = PLACEHOLDER_RE.replace_all(token, |caps: &regex::Captures<'_>| {
            match args.get(&caps[1]) {
                Some(value) if !value.is_null() => scalar_text(value),
                _ => {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    String::new()
                }
            }
        });
        if let Some(name) = missing {
            return Err(ProbeFault::new(format!(
                "argument `{name}` has no value for `{token}`"
            )));
        }
        argv.push(rendered.into_owned());
    }
    Ok(argv)
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(scalar_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
