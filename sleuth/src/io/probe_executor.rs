//! Single probe invocation under a timeout.
//!
//! Every fault a probe can produce (reported failure, panic, overrun) comes
//! back as a [`ProbeOutcome`]; only cancellation is surfaced to the caller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::cancel::CancellationToken;
use crate::core::types::{ProbeError, ProbeErrorKind, ProbeOutcome};
use crate::error::InvestigationError;
use crate::io::supervise::{Bounded, run_bounded};
use crate::registry::{ProbeArgs, ProbeContext, ProbeSpec};

/// Outcome plus wall-clock bounds of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRun {
    pub outcome: ProbeOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Execute `spec` with `args`, waiting at most `timeout`.
#[instrument(skip_all, fields(probe = %spec.name, timeout_ms = timeout.as_millis() as u64))]
pub fn execute_probe(
    spec: &ProbeSpec,
    args: ProbeArgs,
    ctx: ProbeContext,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProbeRun, InvestigationError> {
    let started_at = Utc::now();
    let contract = spec.contract.clone();
    let ctx = ProbeContext { timeout, ..ctx };
    let result = run_bounded(&spec.name, timeout, cancel, move || {
        contract.execute(&args, &ctx)
    });
    let finished_at = Utc::now();

    let outcome = match result {
        Bounded::Completed(Ok(payload)) => {
            debug!("probe succeeded");
            ProbeOutcome::Success { payload }
        }
        Bounded::Completed(Err(fault)) => {
            warn!(message = %fault.message, "probe reported failure");
            ProbeOutcome::Error {
                error: ProbeError {
                    kind: ProbeErrorKind::Execution,
                    message: fault.message,
                    details: fault.details,
                },
            }
        }
        Bounded::Panicked(message) => ProbeOutcome::Error {
            error: ProbeError {
                kind: ProbeErrorKind::Execution,
                message: format!("probe panicked: {message}"),
                details: None,
            },
        },
        Bounded::TimedOut => ProbeOutcome::Error {
            error: ProbeError {
                kind: ProbeErrorKind::Timeout,
                message: format!("no result within {}ms", timeout.as_millis()),
                details: Some(json!({"timeout_ms": timeout.as_millis() as u64})),
            },
        },
        Bounded::Cancelled => return Err(InvestigationError::SessionAborted),
    };

    Ok(ProbeRun {
        outcome,
        started_at,
        finished_at,
    })
}

/// Domain error describing a failed outcome, used for the session finding.
pub fn outcome_error(probe: &str, outcome: &ProbeOutcome) -> Option<InvestigationError> {
    let ProbeOutcome::Error { error } = outcome else {
        return None;
    };
    Some(match error.kind {
        ProbeErrorKind::Execution => InvestigationError::ProbeExecution {
            probe: probe.to_string(),
            message: error.message.clone(),
        },
        ProbeErrorKind::Timeout => InvestigationError::ProbeTimeout {
            probe: probe.to_string(),
            timeout_ms: error
                .details
                .as_ref()
                .and_then(|details| details.get("timeout_ms"))
                .and_then(serde_json::Value::as_u64)
                .unwrap_or_default(),
        },
    })
}
