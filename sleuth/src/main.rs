//! `sleuth`: investigate a failure with an agent and a probe catalog.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::warn;

use sleuth::cancel::CancellationToken;
use sleuth::core::session::InvestigationSession;
use sleuth::core::types::ProbeOutcome;
use sleuth::exit_codes;
use sleuth::investigation::Investigator;
use sleuth::io::catalog::load_command_probes;
use sleuth::io::codex::{AgentReasoner, CommandExecutor};
use sleuth::io::config::{SleuthConfig, load_config};
use sleuth::io::init::{SleuthPaths, init_sleuth};
use sleuth::io::session_store::{load_session, locate_session, write_session};
use sleuth::logging;
use sleuth::probes::registry_with;
use sleuth::registry::{ProbeRegistry, render_tools_spec};

#[derive(Parser)]
#[command(
    name = "sleuth",
    version,
    about = "Bounded root-cause investigation driven by an agent"
)]
struct Cli {
    /// Project root holding `.sleuth/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.sleuth/` with a default config and an example probe catalog.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new investigation.
    Run {
        /// Problem statement.
        #[arg(long, required_unless_present = "problem_file", conflicts_with = "problem_file")]
        problem: Option<String>,
        /// Read the problem statement from a file.
        #[arg(long)]
        problem_file: Option<PathBuf>,
        /// Directory under investigation (defaults to the project root).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Step budget (defaults to `budget` in the config).
        #[arg(long)]
        budget: Option<u32>,
    },
    /// Continue an unfinished session by id or path.
    Resume { session: String },
    /// Print a session summary.
    Show { session: String },
    /// List the probe catalog.
    Probes,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = SleuthPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => {
            let paths = init_sleuth(&cli.root, force)?;
            println!("initialized {}", paths.sleuth_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            problem,
            problem_file,
            workspace,
            budget,
        } => {
            let config = load_config(&paths.config_path)?;
            let problem = read_problem(problem, problem_file.as_deref())?;
            let workspace = workspace.unwrap_or_else(|| cli.root.clone());
            let workspace = fs::canonicalize(&workspace)
                .with_context(|| format!("resolve workspace {}", workspace.display()))?;
            let session = InvestigationSession::new(
                problem,
                workspace.display().to_string(),
                budget.unwrap_or(config.budget),
            );
            investigate(&paths, &config, session)
        }
        Command::Resume { session } => {
            let config = load_config(&paths.config_path)?;
            let session = load_session(&locate_session(&paths.sessions_dir, &session))?;
            if session.state().is_terminal() {
                bail!("session {} is already {}", session.id(), session.state());
            }
            investigate(&paths, &config, session)
        }
        Command::Show { session } => {
            let session = load_session(&locate_session(&paths.sessions_dir, &session))?;
            print!("{}", render_summary(&session));
            Ok(exit_codes::for_state(session.state()))
        }
        Command::Probes => {
            let config = load_config(&paths.config_path)?;
            let registry = load_registry(&paths, &config)?;
            println!("{}", render_tools_spec(&registry.catalog()));
            Ok(exit_codes::OK)
        }
    }
}

fn read_problem(problem: Option<String>, problem_file: Option<&Path>) -> Result<String> {
    let text = match (problem, problem_file) {
        (Some(text), _) => text,
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("read problem file {}", path.display()))?,
        (None, None) => bail!("either --problem or --problem-file is required"),
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        bail!("problem statement is empty");
    }
    Ok(text)
}

fn load_registry(paths: &SleuthPaths, config: &SleuthConfig) -> Result<ProbeRegistry> {
    let catalog_path = paths.catalog_path(config);
    let command_probes = load_command_probes(&catalog_path)?;
    registry_with(command_probes)
        .with_context(|| format!("build registry from {}", catalog_path.display()))
}

/// Drive `session` to a terminal state, snapshotting it after every step.
fn investigate(
    paths: &SleuthPaths,
    config: &SleuthConfig,
    session: InvestigationSession,
) -> Result<i32> {
    let registry = Arc::new(load_registry(paths, config)?);
    let limits = config.investigation();
    let workspace = PathBuf::from(session.workspace());
    let reasoner = Arc::new(AgentReasoner::new(
        CommandExecutor::new(config.reasoner.command.clone()),
        &workspace,
        paths.scratch_dir.join(session.id()),
        limits.reasoning_timeout,
        config.reasoner.output_limit_bytes,
    ));
    let investigator = Investigator::new(reasoner, registry, limits)?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("cancelling investigation...");
        handler_token.cancel();
    })
    .context("install Ctrl-C handler")?;

    let session_path = paths.session_path(session.id());
    write_session(&session_path, &session)?;
    eprintln!(
        "investigating {} (session {}, budget {})",
        session.workspace(),
        session.id(),
        session.budget()
    );

    let outcome = investigator.resume(session, &cancel, |snapshot| {
        if let Err(err) = write_session(&session_path, snapshot) {
            warn!(err = %format!("{err:#}"), "failed to persist session snapshot");
        }
    });
    write_session(&session_path, &outcome.session)?;

    print!("{}", render_summary(&outcome.session));
    println!("session saved to {}", session_path.display());
    Ok(exit_codes::for_state(outcome.final_state))
}

fn render_summary(session: &InvestigationSession) -> String {
    let mut out = String::new();
    out.push_str(&format!("Session {} [{}]\n", session.id(), session.state()));
    out.push_str(&format!("Problem: {}\n", session.problem()));
    out.push_str(&format!(
        "Steps: {}/{}  Probes: {}  Findings: {}\n",
        session.step(),
        session.budget(),
        session.probe_log().len(),
        session.findings().len()
    ));

    if !session.hypotheses().is_empty() {
        out.push_str("\nHypotheses:\n");
        for hypothesis in session.hypotheses() {
            out.push_str(&format!(
                "  - [{:?}/{:?}] {}\n",
                hypothesis.status, hypothesis.confidence, hypothesis.text
            ));
        }
    }
    if !session.probe_log().is_empty() {
        out.push_str("\nProbes:\n");
        for (index, invocation) in session.probe_log().iter().enumerate() {
            let status = match &invocation.outcome {
                ProbeOutcome::Success { .. } => "ok".to_string(),
                ProbeOutcome::Error { error } => format!("error: {}", error.message),
                ProbeOutcome::Reused { invocation } => format!("duplicate of [{invocation}]"),
            };
            out.push_str(&format!(
                "  [{index}] step {} {} {} -> {status}\n",
                invocation.step, invocation.probe_name, invocation.canonical_args
            ));
        }
    }
    if let Some(rationale) = session.stop_rationale() {
        out.push_str(&format!("\nStop rationale: {rationale}\n"));
    }
    match session.root_cause() {
        Some(root_cause) => {
            out.push_str(&format!(
                "\nRoot cause ({:?} confidence): {}\n",
                root_cause.confidence, root_cause.description
            ));
            for fix in &root_cause.recommended_fixes {
                out.push_str(&format!("  - {fix}\n"));
            }
            if let Some(notes) = &root_cause.notes {
                out.push_str(&format!("Notes: {notes}\n"));
            }
        }
        None => out.push_str("\nNo root cause recorded.\n"),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["sleuth", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["sleuth", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_budget() {
        let cli = Cli::parse_from(["sleuth", "run", "--problem", "502s", "--budget", "4"]);
        match cli.command {
            Command::Run {
                problem, budget, ..
            } => {
                assert_eq!(problem.as_deref(), Some("502s"));
                assert_eq!(budget, Some(4));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_problem() {
        assert!(Cli::try_parse_from(["sleuth", "run"]).is_err());
        assert!(
            Cli::try_parse_from(["sleuth", "run", "--problem", "a", "--problem-file", "b"])
                .is_err()
        );
    }

    #[test]
    fn problem_is_trimmed_and_required() {
        assert_eq!(
            read_problem(Some("  disk full \n".to_string()), None).expect("problem"),
            "disk full"
        );
        assert!(read_problem(Some("   ".to_string()), None).is_err());
    }

    #[test]
    fn summary_mentions_state_and_missing_root_cause() {
        let session = InvestigationSession::with_id("inv-1", "api down", "/srv", 3);
        let summary = render_summary(&session);
        assert!(summary.starts_with("Session inv-1 [active]"));
        assert!(summary.contains("Steps: 0/3"));
        assert!(summary.contains("No root cause recorded."));
    }
}
