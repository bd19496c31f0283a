//! Time budget helpers for bounded calls.

use std::time::{Duration, Instant};

/// Remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Per-call timeout clamped by the optional session deadline.
///
/// Returns `None` when the session deadline has already passed.
pub fn call_timeout(per_call: Duration, deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => remaining_budget(deadline).map(|remaining| remaining.min(per_call)),
        None => Some(per_call),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_session_keeps_per_call_timeout() {
        let per_call = Duration::from_secs(5);
        assert_eq!(call_timeout(per_call, None), Some(per_call));
    }

    #[test]
    fn deadline_clamps_per_call_timeout() {
        let deadline = Instant::now() + Duration::from_millis(200);
        let timeout = call_timeout(Duration::from_secs(60), Some(deadline)).expect("remaining");
        assert!(timeout <= Duration::from_millis(200));
    }

    #[test]
    fn passed_deadline_has_no_budget() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(remaining_budget(deadline), None);
        assert_eq!(call_timeout(Duration::from_secs(1), Some(deadline)), None);
    }
}
