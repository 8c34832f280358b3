use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] waveshell_proto::CodecError),
    #[error("state error: {0}")]
    State(#[from] waveshell_state::DiffError),
    #[error("sudo relay error: {0}")]
    Sudo(#[from] waveshell_pty::SudoRelayError),
    #[error("no such command key in flight")]
    UnknownCmdKey,
    #[error("command already running for this key")]
    DuplicateCmdKey,
}
