//! Command-backed reasoning adapter.
//!
//! [`AgentReasoner`] implements [`ReasoningPort`] by rendering a prompt per
//! call, writing the reply schema next to it and running an agent command
//! through an [`Executor`]. The default backend is `codex exec`, which is
//! told where the schema is and where to leave its last message. Tests
//! substitute executors that write canned output without spawning anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{PromptEngine, PromptRequest};
use crate::reasoning::reply::output_schema;
use crate::reasoning::{
    DiagnoseRequest, DigestRequest, HypothesesRequest, PlanRequest, ReasoningPort, StopRequest,
};

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// JSON Schema the reply must satisfy.
    pub output_schema_path: PathBuf,
    /// Where the agent must leave its reply.
    pub output_path: PathBuf,
    /// Where agent stdout/stderr are kept.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over agent backends.
pub trait Executor: Send + Sync {
    /// Run the agent. Must write its reply to `request.output_path`.
    fn exec(&self, request: &ExecRequest) -> Result<()>;
}

/// Executor that spawns a configured agent command (`codex exec` by default).
///
/// The command is extended with `--output-schema <path> --output-last-message
/// <path> -` and receives the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(vec!["codex".to_string(), "exec".to_string()])
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoner command is empty"))?;
        info!(program, workdir = %request.workdir.display(), "starting reasoner command");

        if !request.output_schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.output_schema_path.display()
            ));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(program);
        cmd.args(args);
        if is_codex(program) {
            // Workspaces under investigation are often not git repositories.
            cmd.arg("--skip-git-repo-check");
        }
        cmd.arg("--output-schema")
            .arg(&request.output_schema_path)
            .arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {program}"))?;

        fs::write(&request.log_path, output.transcript("reasoner"))
            .with_context(|| format!("write reasoner log {}", request.log_path.display()))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "reasoner command timed out");
            return Err(anyhow!("{program} timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reasoner command failed");
            return Err(anyhow!(
                "{program} failed with status {:?}",
                output.status.code()
            ));
        }

        debug!("reasoner command completed successfully");
        Ok(())
    }
}

fn is_codex(program: &str) -> bool {
    Path::new(program)
        .file_name()
        .is_some_and(|name| name == "codex")
}

/// Execute the agent and load its reply as JSON.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn execute_and_load_json<E: Executor + ?Sized>(executor: &E, request: &ExecRequest) -> Result<Value> {
    executor.exec(request)?;
    if !request.output_path.exists() {
        return Err(anyhow!(
            "missing reasoner output {}",
            request.output_path.display()
        ));
    }
    let contents = fs::read_to_string(&request.output_path)
        .with_context(|| format!("read reasoner output {}", request.output_path.display()))?;
    extract_json(&contents)
        .with_context(|| format!("parse {}", request.output_path.display()))
}

/// Parse a reply that may be wrapped in a Markdown fence or prose.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    if let Ok(value) = serde_json::from_str(unfenced) {
        return Ok(value);
    }
    let start = unfenced.find('{');
    let end = unfenced.rfind('}');
    if let (Some(start), Some(end)) = (start, end)
        && start < end
        && let Ok(value) = serde_json::from_str(&unfenced[start..=end])
    {
        return Ok(value);
    }
    Err(anyhow!("reply is not JSON"))
}

/// [`ReasoningPort`] backed by an agent command.
pub struct AgentReasoner<E: Executor> {
    executor: E,
    prompts: PromptEngine,
    workdir: PathBuf,
    scratch_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    calls: AtomicU64,
}

impl<E: Executor> AgentReasoner<E> {
    /// `scratch_dir` receives one directory per call with the prompt,
    /// schema, reply and log.
    pub fn new(
        executor: E,
        workdir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            executor,
            prompts: PromptEngine::new(),
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
            timeout,
            output_limit_bytes,
            calls: AtomicU64::new(0),
        }
    }

    fn ask<Q: PromptRequest>(&self, request: &Q) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let call_dir = self.scratch_dir.join(format!("{n:04}-{}", Q::CALL));
        fs::create_dir_all(&call_dir)
            .with_context(|| format!("create {}", call_dir.display()))?;

        let schema_path = call_dir.join("schema.json");
        fs::write(&schema_path, output_schema(Q::CALL))
            .with_context(|| format!("write {}", schema_path.display()))?;
        let prompt = self.prompts.render(request)?;
        let prompt_path = call_dir.join("prompt.md");
        fs::write(&prompt_path, &prompt)
            .with_context(|| format!("write {}", prompt_path.display()))?;

        let exec = ExecRequest {
            workdir: self.workdir.clone(),
            prompt,
            output_schema_path: schema_path,
            output_path: call_dir.join("reply.json"),
            log_path: call_dir.join("reasoner.log"),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };
        debug!(call = %Q::CALL, dir = %call_dir.display(), "invoking reasoner");
        execute_and_load_json(&self.executor, &exec)
    }
}

impl<E: Executor> ReasoningPort for AgentReasoner<E> {
    fn generate_hypotheses(&self, request: &HypothesesRequest) -> Result<Value> {
        self.ask(request)
    }

    fn plan_probe(&self, request: &PlanRequest) -> Result<Value> {
        self.ask(request)
    }

    fn digest_evidence(&self, request: &DigestRequest) -> Result<Value> {
        self.ask(request)
    }

    fn decide_stop(&self, request: &StopRequest) -> Result<Value> {
        self.ask(request)
    }

    fn diagnose(&self, request: &DiagnoseRequest) -> Result<Value> {
        self.ask(request)
    }
}
