use thiserror::Error;

use waveshell_pty::SudoRelayError;
use waveshell_state::StoreError as StateStoreError;
use waveshell_transport::TransportError;

/// Errors surfaced by [`crate::proc::WaveshellProc`], mapped onto spec.md §7's five error
/// kinds (config/precondition, transport, protocol, agent-reported, timeout).
#[derive(Debug, Error)]
pub enum ProcError {
    #[error("remote is archived")]
    Archived,
    #[error("duplicate local remote (sudo={sudo})")]
    DuplicateLocalRemote { sudo: bool },
    #[error("remote not connected")]
    NotConnected,
    #[error("refused to disconnect: {running} command(s) still running")]
    DisconnectRefused { running: usize },
    #[error("agent handshake failed: {0}")]
    Handshake(String),
    #[error("agent not installed on remote and auto-install is disabled")]
    AgentNotFound,
    #[error("agent version {agent} incompatible with core version {core}")]
    VersionMismatch { agent: String, core: String },
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("install failed: {0}")]
    InstallFailed(String),
    #[error("timed out waiting for password prompt")]
    PasswordPromptTimeout,
    #[error("sudo: incorrect password entered")]
    SudoIncorrectPassword,
    #[error(transparent)]
    Sudo(#[from] SudoRelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    State(#[from] StateStoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
