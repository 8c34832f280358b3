//! The run-command orchestrator and packet-sink (spec.md §4.5-§4.7, C6/C7).
//!
//! Owns the command-level bookkeeping `waveshell-proc` deliberately has no knowledge of: the
//! [`Store`](waveshell_updates::Store) row per command, the pending-state reservation rules,
//! and the [`ordering::CmdWaitGate`] that keeps a fast-arriving `data`/`cmddone` packet from
//! racing the orchestrator's own row-commit.

pub mod error;
pub mod handlers;
pub mod ordering;
pub mod orchestrator;

pub use error::RunError;
pub use handlers::RunSink;
pub use ordering::CmdWaitGate;
pub use orchestrator::{
    ReleaseGuard, RunOrchestrator, RunRequest, CMDSTART_TIMEOUT, DEFAULT_MAX_PTY_SIZE,
    STATUS_INDICATOR_OUTPUT,
};
