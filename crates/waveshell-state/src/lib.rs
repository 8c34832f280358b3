//! Shell-state model: content-addressed [`ShellState`], diffs against a base, and the
//! in-memory store that resolves a [`ShellStatePtr`] back to a full state.

pub mod diff;
pub mod model;
pub mod sanitize;
pub mod store;

pub use diff::{apply_shell_state_diff, make_shell_state_diff, DiffError};
pub use model::{MapDiff, ShellState, ShellStateDiff, ShellStatePtr, ShellType};
pub use sanitize::{inject_waveterm_vars, strip_env, InjectOpts};
pub use store::{StateStore, StoreError};

/// A diff whose encoded size exceeds this (in bytes) is discarded in favor of persisting
/// the full state. Fixed per the source; not configurable (see DESIGN.md open questions).
pub const NEW_STATE_DIFF_SIZE_THRESHOLD: usize = 30 * 1024;

/// Decide whether `diff` (already computed) should replace the remote-instance pointer,
/// or whether the full `full_state` should be persisted instead.
pub fn should_use_diff(diff: &ShellStateDiff) -> bool {
    let encoded = serde_json::to_vec(diff).map(|v| v.len()).unwrap_or(usize::MAX);
    encoded <= NEW_STATE_DIFF_SIZE_THRESHOLD
}
