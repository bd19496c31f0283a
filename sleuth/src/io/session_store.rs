//! Session documents under `.sleuth/sessions/<id>.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::core::invariants::validate_session;
use crate::core::session::InvestigationSession;

/// Load a session and check its invariants.
pub fn load_session(path: &Path) -> Result<InvestigationSession> {
    debug!(path = %path.display(), "loading session");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let session: InvestigationSession = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;
    let errors = validate_session(&session);
    if !errors.is_empty() {
        bail!(
            "session {} violates invariants:\n- {}",
            path.display(),
            errors.join("\n- ")
        );
    }
    debug!(id = session.id(), state = %session.state(), step = session.step(), "session loaded");
    Ok(session)
}

/// Atomically write a session document (temp file + rename).
pub fn write_session(path: &Path, session: &InvestigationSession) -> Result<()> {
    debug!(path = %path.display(), id = session.id(), step = session.step(), "writing session");
    let mut buf = serde_json::to_string_pretty(session).context("serialize session")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

/// Resolve a `show`/`resume` argument: an existing file, or a session id.
pub fn locate_session(sessions_dir: &Path, reference: &str) -> PathBuf {
    let direct = PathBuf::from(reference);
    if direct.is_file() {
        return direct;
    }
    sessions_dir.join(format!("{reference}.json"))
}
