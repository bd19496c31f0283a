//! Sleuth configuration stored under `.sleuth/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::investigation::{DEFAULT_MALFORMED_THRESHOLD, InvestigationConfig};

/// Sleuth configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SleuthConfig {
    /// Default step budget for `sleuth run`.
    pub budget: u32,

    /// Per-probe wall-clock limit in seconds.
    pub probe_timeout_secs: u64,

    /// Per-reasoning-call wall-clock limit in seconds.
    pub reasoning_timeout_secs: u64,

    /// Optional wall-clock limit for a whole session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<u64>,

    /// Consecutive malformed reasoning replies tolerated before erroring out.
    pub malformed_threshold: u32,

    /// Prerequisite probes run concurrently at most this wide.
    pub max_parallel_probes: usize,

    /// Truncate command probe output beyond this many bytes.
    pub probe_output_limit_bytes: usize,

    /// Command probe catalog, relative to `.sleuth/`.
    pub catalog: String,

    pub reasoner: ReasonerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Agent command; the prompt is fed on stdin (e.g. `["codex","exec"]`).
    pub command: Vec<String>,

    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string()],
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for SleuthConfig {
    fn default() -> Self {
        Self {
            budget: 10,
            probe_timeout_secs: 60,
            reasoning_timeout_secs: 300,
            session_timeout_secs: None,
            malformed_threshold: DEFAULT_MALFORMED_THRESHOLD,
            max_parallel_probes: 4,
            probe_output_limit_bytes: 100_000,
            catalog: "probes.toml".to_string(),
            reasoner: ReasonerConfig::default(),
        }
    }
}

impl SleuthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout_secs == 0 {
            return Err(anyhow!("probe_timeout_secs must be > 0"));
        }
        if self.reasoning_timeout_secs == 0 {
            return Err(anyhow!("reasoning_timeout_secs must be > 0"));
        }
        if self.session_timeout_secs == Some(0) {
            return Err(anyhow!("session_timeout_secs must be > 0 when set"));
        }
        if self.max_parallel_probes == 0 {
            return Err(anyhow!("max_parallel_probes must be > 0"));
        }
        if self.probe_output_limit_bytes == 0 {
            return Err(anyhow!("probe_output_limit_bytes must be > 0"));
        }
        if self.catalog.trim().is_empty() {
            return Err(anyhow!("catalog must not be empty"));
        }
        if self.reasoner.command.first().is_none_or(|c| c.trim().is_empty()) {
            return Err(anyhow!("reasoner.command must be a non-empty array"));
        }
        if self.reasoner.output_limit_bytes == 0 {
            return Err(anyhow!("reasoner.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Loop limits derived from this config.
    pub fn investigation(&self) -> InvestigationConfig {
        InvestigationConfig {
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            reasoning_timeout: Duration::from_secs(self.reasoning_timeout_secs),
            session_timeout: self.session_timeout_secs.map(Duration::from_secs),
            malformed_threshold: self.malformed_threshold,
            max_parallel_probes: self.max_parallel_probes,
            probe_output_limit_bytes: self.probe_output_limit_bytes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SleuthConfig::default()`.
pub fn load_config(path: &Path) -> Result<SleuthConfig> {
    if !path.exists() {
        let cfg = SleuthConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SleuthConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SleuthConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
