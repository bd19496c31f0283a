//! Initialization helpers for `.sleuth/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{SleuthConfig, write_config};

/// Canonical paths within `.sleuth/` for a project root.
#[derive(Debug, Clone)]
pub struct SleuthPaths {
    pub root: PathBuf,
    pub sleuth_dir: PathBuf,
    pub config_path: PathBuf,
    pub sessions_dir: PathBuf,
    /// Per-call agent prompts, schemas and logs.
    pub scratch_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl SleuthPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let sleuth_dir = root.join(".sleuth");
        Self {
            root: root.clone(),
            config_path: sleuth_dir.join("config.toml"),
            sessions_dir: sleuth_dir.join("sessions"),
            scratch_dir: sleuth_dir.join("scratch"),
            gitignore_path: sleuth_dir.join(".gitignore"),
            sleuth_dir,
        }
    }

    /// Catalog location named by `config` (relative to `.sleuth/`).
    pub fn catalog_path(&self, config: &SleuthConfig) -> PathBuf {
        self.sleuth_dir.join(&config.catalog)
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }
}

/// Create `.sleuth/` scaffolding in `root`.
///
/// Fails if `.sleuth/` already exists unless `force` is set.
pub fn init_sleuth(root: &Path, force: bool) -> Result<SleuthPaths> {
    let paths = SleuthPaths::new(root);
    if paths.sleuth_dir.exists() && !paths.sleuth_dir.is_dir() {
        return Err(anyhow!("sleuth init: .sleuth exists but is not a directory"));
    }
    if paths.sleuth_dir.exists() && !force {
        return Err(anyhow!(
            "sleuth init: .sleuth already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.sleuth_dir)?;
    create_dir(&paths.sessions_dir)?;
    create_dir(&paths.scratch_dir)?;

    let config = SleuthConfig::default();
    write_config(&paths.config_path, &config)?;
    write_file(&paths.catalog_path(&config), CATALOG_EXAMPLE)?;
    write_file(&paths.gitignore_path, SLEUTH_GITIGNORE)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const SLEUTH_GITIGNORE: &str = "sessions/\nscratch/\n";

const CATALOG_EXAMPLE: &str = r#"# Command-backed probes available to the investigator.
#
# `command` is an argv template: `{name}` is replaced by the argument value.
# `output` is "text", "json" or "json_lines".

[[probe]]
name = "containers_state"
description = "List containers with their state and health."
command = ["docker", "ps", "--all", "--format", "{{json .}}"]
output = "json_lines"

[[probe]]
name = "container_logs"
description = "Recent log lines of one container."
command = ["docker", "logs", "--tail", "{tail}", "{container}"]
required = ["container"]
side_effects = "read_only"

[probe.args]
container = "Container name or id."
tail = "Number of lines to show."

[probe.defaults]
tail = 200

[[probe]]
name = "volumes_list"
description = "Docker volumes, to spot stale or orphaned state."
command = ["docker", "volume", "ls", "--format", "{{json .}}"]
output = "json_lines"

[[probe]]
name = "dns_resolution"
description = "Resolve a hostname from the host running sleuth."
command = ["getent", "ahosts", "{host}"]
required = ["host"]

[probe.args]
host = "Hostname to resolve."

[[probe]]
name = "tcp_connect"
description = "Check that a TCP port accepts connections."
command = ["nc", "-z", "-v", "-w", "{timeout}", "{host}", "{port}"]
required = ["host", "port"]

[probe.args]
host = "Target host."
port = "Target port."
timeout = "Connect timeout in seconds."

[probe.defaults]
timeout = 5

[[probe]]
name = "container_exec"
description = "Run a command inside a running container."
command = ["docker", "exec", "{container}", "{command}"]
required = ["container", "command"]
side_effects = "exec_in_target"
example = { container = "api", command = ["cat", "/etc/resolv.conf"] }

[probe.args]
container = "Container name or id."
command = "Argv to run, one element per token."
"#;
