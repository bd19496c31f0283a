//! Semantic invariants of a session that JSON Schema cannot express.
//!
//! Used when a persisted snapshot is loaded back; a session produced by the
//! orchestrator satisfies them by construction.

use std::collections::BTreeSet;

use crate::core::session::InvestigationSession;
use crate::core::signature::canonicalize;
use crate::core::types::{ProbeOutcome, SessionState};

/// Check session invariants:
/// - `step <= budget`
/// - root cause present exactly for `Concluded`/`Exhausted`
/// - `finished_at` present exactly for terminal states
/// - each signature recomputes from `(probe_name, canonical_args)`
/// - `executed_signatures` equals the set of logged signatures
/// - duplicate entries reference an earlier original with the same signature
/// - finding and hypothesis references point at existing entries
pub fn validate_session(session: &InvestigationSession) -> Vec<String> {
    let mut errors = Vec::new();

    if session.step() > session.budget() {
        errors.push(format!(
            "step {} exceeds budget {}",
            session.step(),
            session.budget()
        ));
    }

    let diagnosed = matches!(
        session.state(),
        SessionState::Concluded | SessionState::Exhausted
    );
    if diagnosed != session.root_cause().is_some() {
        errors.push(format!(
            "state {} {} a root cause",
            session.state(),
            if diagnosed { "requires" } else { "must not carry" }
        ));
    }
    if session.state().is_terminal() != session.finished_at().is_some() {
        errors.push(format!(
            "finished_at must be set exactly when the session is terminal (state {})",
            session.state()
        ));
    }

    validate_probe_log(session, &mut errors);

    let log_len = session.probe_log().len();
    for (idx, finding) in session.findings().iter().enumerate() {
        for r in &finding.evidence_refs {
            if *r >= log_len {
                errors.push(format!(
                    "finding {idx}: evidence ref {r} out of range (log has {log_len} entries)"
                ));
            }
        }
        if finding.step_ref > session.step() + 1 {
            errors.push(format!(
                "finding {idx}: step_ref {} is ahead of step {}",
                finding.step_ref,
                session.step()
            ));
        }
    }

    let findings_len = session.findings().len();
    for (idx, hypothesis) in session.hypotheses().iter().enumerate() {
        for r in hypothesis
            .supporting_refs
            .iter()
            .chain(&hypothesis.refuting_refs)
        {
            if *r >= findings_len {
                errors.push(format!(
                    "hypothesis {idx}: finding ref {r} out of range ({findings_len} findings)"
                ));
            }
        }
    }

    errors
}

fn validate_probe_log(session: &InvestigationSession, errors: &mut Vec<String>) {
    let log = session.probe_log();
    let mut logged = BTreeSet::new();
    let mut last_step = 0;

    for (idx, invocation) in log.iter().enumerate() {
        logged.insert(invocation.signature.clone());

        if invocation.step < last_step {
            errors.push(format!(
                "probe_log[{idx}]: step {} goes backwards (previous {last_step})",
                invocation.step
            ));
        }
        last_step = invocation.step;
        if invocation.step == 0 || invocation.step > session.step() + 1 {
            errors.push(format!(
                "probe_log[{idx}]: step {} outside 1..={}",
                invocation.step,
                session.step() + 1
            ));
        }

        let expected = canonicalize(&invocation.probe_name, &invocation.canonical_args);
        if expected.signature != invocation.signature {
            errors.push(format!(
                "probe_log[{idx}]: signature {} does not match {} for {}",
                invocation.signature, expected.signature, invocation.probe_name
            ));
        }

        match &invocation.outcome {
            ProbeOutcome::Reused { invocation: original } => {
                if !invocation.was_skipped_as_duplicate {
                    errors.push(format!(
                        "probe_log[{idx}]: reused outcome on a non-duplicate entry"
                    ));
                }
                match log.get(*original) {
                    Some(target) if *original < idx => {
                        if target.was_skipped_as_duplicate {
                            errors.push(format!(
                                "probe_log[{idx}]: references duplicate entry {original}"
                            ));
                        }
                        if target.signature != invocation.signature {
                            errors.push(format!(
                                "probe_log[{idx}]: references entry {original} with another signature"
                            ));
                        }
                    }
                    _ => errors.push(format!(
                        "probe_log[{idx}]: reused reference {original} must point to an earlier entry"
                    )),
                }
            }
            _ => {
                if invocation.was_skipped_as_duplicate {
                    errors.push(format!(
                        "probe_log[{idx}]: duplicate entry must reference its original"
                    ));
                }
            }
        }
    }

    if &logged != session.executed_signatures() {
        errors.push("executed_signatures does not match the probe log".to_string());
    }
}
