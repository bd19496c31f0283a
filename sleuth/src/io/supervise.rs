//! Run a job on a worker thread under a timeout and a cancellation signal.
//!
//! The worker is detached: a job that overruns its timeout keeps running in
//! the background but its result is discarded. Panics inside the job are
//! caught on the worker and reported as [`Bounded::Panicked`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::CancellationToken;

/// How often a waiting caller re-checks the cancellation signal.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of a bounded job.
#[derive(Debug, Clone, PartialEq)]
pub enum Bounded<T> {
    Completed(T),
    Panicked(String),
    TimedOut,
    Cancelled,
}

/// Run `job` on a named worker thread, waiting at most `timeout`.
pub fn run_bounded<T, F>(
    label: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    job: F,
) -> Bounded<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if cancel.is_cancelled() {
        return Bounded::Cancelled;
    }
    if timeout.is_zero() {
        return Bounded::TimedOut;
    }

    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("sleuth-{label}"))
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(job));
            // The receiver is gone when the caller already gave up on us.
            let _ = tx.send(result);
        });
    if let Err(err) = spawned {
        warn!(label, err = %err, "failed to spawn worker");
        return Bounded::Panicked(format!("failed to spawn worker: {err}"));
    }

    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            debug!(label, "cancelled while waiting for worker");
            return Bounded::Cancelled;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(label, timeout_ms = timeout.as_millis() as u64, "worker timed out");
            return Bounded::TimedOut;
        }
        match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(Ok(value)) => return Bounded::Completed(value),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(label, %message, "worker panicked");
                return Bounded::Panicked(message);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Bounded::Panicked("worker exited without a result".to_string());
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_string()
}
