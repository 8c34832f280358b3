use thiserror::Error;

use waveshell_proc::ProcError;
use waveshell_transport::TransportError;
use waveshell_updates::StoreError;

/// Errors surfaced by the run-command orchestrator (spec.md §4.5/§7).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("remote is foreign (owner={owner_id})")]
    ForeignRemote { owner_id: String },
    #[error("run packet group_id {group_id} does not match screen_id {screen_id}")]
    GroupScreenMismatch { group_id: String, screen_id: String },
    #[error("remote not found: {0}")]
    RemoteNotFound(String),
    #[error("remote not connected")]
    NotConnected,
    #[error("no state pointer recorded for this screen/remote")]
    MissingStatePtr,
    #[error("cannot run command while a stateful command (linenum={linenum}) is still running")]
    PendingStateCollision { linenum: u64 },
    #[error("cmdstart rpc timed out")]
    CmdStartTimeout,
    #[error("agent rejected run: {0}")]
    AgentRejected(String),
    #[error("unexpected response to run packet")]
    UnexpectedResponse,
    #[error(transparent)]
    Proc(#[from] ProcError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] waveshell_state::StoreError),
}
