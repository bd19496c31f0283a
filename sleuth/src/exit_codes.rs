//! Stable exit codes for sleuth CLI commands.

use crate::core::types::SessionState;

/// Command succeeded; for `run`/`resume`, the session concluded.
pub const OK: i32 = 0;
/// Invalid arguments, config, catalog or session file, or another error.
pub const INVALID: i32 = 1;
/// The step budget or session deadline ran out; a diagnosis was still produced.
pub const EXHAUSTED: i32 = 2;
/// The reasoner kept replying with malformed output.
pub const ERRORED: i32 = 3;
/// Cancelled (Ctrl-C).
pub const ABORTED: i32 = 130;

/// Exit code reporting a session's final state.
pub fn for_state(state: SessionState) -> i32 {
    match state {
        SessionState::Concluded => OK,
        SessionState::Exhausted => EXHAUSTED,
        SessionState::Errored => ERRORED,
        SessionState::Aborted => ABORTED,
        // An unfinished session only comes back from `show`.
        SessionState::Active => OK,
    }
}
