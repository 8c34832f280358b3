//! Handles `ReInit`: the core asking the agent to establish a fresh baseline
//! [`ShellState`] for a shell type, independent of any previously tracked state.
//!
//! There is no prior state to apply here, so the agent boots a real login shell (sourcing
//! its profile/rc files the way an interactive session would) and probes the result, the
//! same probe mechanism a `Run` uses to capture post-command state.

use std::process::Stdio;

use waveshell_proto::Packet;
use waveshell_state::ShellType;

use crate::command::shell_type_from_wire;
use crate::state_capture::{interpreter_for, probe_script, read_probe};

/// Build and run a one-shot login shell for `shell_type`, returning the resulting packet
/// to send back (`ShellState` on success, `Response` with an error otherwise).
pub async fn handle_reinit(req_id: String, shell_type: String) -> Packet {
    let shell_type: ShellType = shell_type_from_wire(&shell_type);

    let probe_dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => {
            return Packet::Response {
                req_id,
                error: Some(format!("failed to create probe dir: {e}")),
                data: None,
            }
        }
    };
    let script = probe_script(probe_dir.path(), &shell_type);

    let status = tokio::process::Command::new(interpreter_for(&shell_type))
        .arg("-lc")
        .arg(&script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    if let Err(e) = status {
        return Packet::Response {
            req_id,
            error: Some(format!("reinit shell failed to run: {e}")),
            data: None,
        };
    }

    match read_probe(probe_dir.path(), shell_type) {
        Ok(state) => Packet::ShellState { req_id, state },
        Err(e) => Packet::Response {
            req_id,
            error: Some(format!("state probe read failed: {e}")),
            data: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reinit_returns_a_shell_state_for_bash() {
        let packet = handle_reinit("r1".to_string(), "bash".to_string()).await;
        match packet {
            Packet::ShellState { state, .. } => {
                assert!(!state.cwd.is_empty());
            }
            Packet::Response { error, .. } => {
                panic!("expected ShellState, got error: {error:?}");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
