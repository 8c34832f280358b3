//! Controlling pty management, password-prompt detection, and the sudo ECDH relay.

pub mod circular;
pub mod manager;
pub mod sudo;

pub use circular::{CircularBuffer, Snapshot};
pub use manager::{
    build_local_shell_command, build_ssh_command, ControllingPty, SecretCache,
    DEFAULT_SECRET_TIMEOUT,
};
pub use sudo::{encrypt_for_shell, SudoRelayError, SudoResponsePayload};
