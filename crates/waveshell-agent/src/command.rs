//! Executes one `Run` packet.
//!
//! The core hands over a complete [`ShellState`] on every run instead of the agent keeping
//! a persistent shell child, so a command maps onto a single one-shot interpreter
//! invocation: apply aliases/functions as a textual preamble, apply env/cwd directly on the
//! spawned process, run the command, and (if `return_state` is set) probe the resulting
//! state back out. Two execution modes are supported: plain piped stdio, or an agent-owned
//! pty (distinct from the core's controlling pty, which only ever wraps the dial itself).

use std::process::Stdio;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use portable_pty::CommandBuilder;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use waveshell_proto::{CmdKey, Packet, SpecialInput};
use waveshell_pty::ControllingPty;
use waveshell_state::{should_use_diff, make_shell_state_diff, ShellState, ShellType};

use crate::state_capture::{interpreter_for, preamble_script, probe_script, read_probe};
use crate::sudo::{looks_like_sudo_prompt, relay_sudo_password, PendingSudo};

const READ_CHUNK: usize = 8192;

/// Parsed-down view of a `Run` packet plus the fields a command execution needs.
pub struct RunSpec {
    pub req_id: String,
    pub ck: CmdKey,
    pub command: String,
    pub state: ShellState,
    pub use_pty: bool,
    pub timeout_ms: Option<u64>,
    pub return_state: bool,
}

pub fn shell_type_from_wire(s: &str) -> ShellType {
    match s {
        "bash" => ShellType::Bash,
        "zsh" => ShellType::Zsh,
        other => ShellType::Other(other.to_string()),
    }
}

fn build_script(spec: &RunSpec, probe_dir: Option<&std::path::Path>) -> String {
    let mut script = preamble_script(&spec.state);
    script.push_str(&spec.command);
    script.push('\n');
    if let Some(dir) = probe_dir {
        script.push_str(&probe_script(dir, &spec.state.shell_type));
    }
    script
}

async fn sleep_opt(ms: Option<u64>) {
    match ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Whether `signum` is one of the common Unix termination signals we can approximate
/// without a signal-sending dependency (the workspace carries neither `nix` nor `libc`).
fn is_terminal_signal(signum: i32) -> bool {
    matches!(signum, 2 | 3 | 6 | 9 | 15) // SIGINT, SIGQUIT, SIGABRT, SIGKILL, SIGTERM
}

/// The control byte a pty's line discipline turns into `signum`, if any.
fn control_byte_for_signal(signum: i32) -> Option<u8> {
    match signum {
        2 => Some(0x03),  // SIGINT  <- Ctrl-C
        3 => Some(0x1c),  // SIGQUIT <- Ctrl-\
        20 => Some(0x1a), // SIGTSTP <- Ctrl-Z
        _ => None,
    }
}

fn resolve_final_state(spec: &RunSpec, probe_dir: &std::path::Path) -> (Option<ShellState>, Option<waveshell_state::ShellStateDiff>) {
    match read_probe(probe_dir, spec.state.shell_type.clone()) {
        Ok(captured) => {
            let diff = make_shell_state_diff(&spec.state, &captured);
            if should_use_diff(&diff) {
                (None, Some(diff))
            } else {
                (Some(captured), None)
            }
        }
        Err(e) => {
            warn!(target: "waveshell_agent", "state probe read failed for {:?}: {e}", spec.ck);
            (None, None)
        }
    }
}

/// Run `spec` without a pty: plain piped stdio via `tokio::process::Command`.
pub async fn run_piped(spec: RunSpec, out_tx: mpsc::Sender<Packet>, mut inbound: mpsc::Receiver<Packet>) {
    let probe_dir = if spec.return_state {
        match tempfile::tempdir() {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(target: "waveshell_agent", "failed to create probe dir: {e}");
                None
            }
        }
    } else {
        None
    };
    let script = build_script(&spec, probe_dir.as_ref().map(|d| d.path()));

    let mut cmd = tokio::process::Command::new(interpreter_for(&spec.state.shell_type));
    cmd.arg("-c")
        .arg(&script)
        .current_dir(&spec.state.cwd)
        .env_clear()
        .envs(&spec.state.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = out_tx
                .send(Packet::Response {
                    req_id: spec.req_id.clone(),
                    error: Some(format!("spawn failed: {e}")),
                    data: None,
                })
                .await;
            return;
        }
    };
    let pid = child.id().unwrap_or(0) as i32;
    let _ = out_tx
        .send(Packet::CmdStart {
            req_id: spec.req_id.clone(),
            ck: spec.ck.clone(),
            pid,
            agent_pid: std::process::id() as i32,
        })
        .await;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let stdout_task = tokio::spawn(pump_fd(stdout, 1, spec.ck.clone(), out_tx.clone()));
    let stderr_task = tokio::spawn(pump_fd(stderr, 2, spec.ck.clone(), out_tx.clone()));

    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
    let dispatch_task = tokio::spawn(async move {
        while let Some(packet) = inbound.recv().await {
            match packet {
                Packet::SpecialInput {
                    input: SpecialInput::Signal { signum },
                    ..
                } => {
                    if is_terminal_signal(signum) {
                        let _ = kill_tx.send(()).await;
                    }
                }
                // TODO(agent-flow-control): DataAck is only logged for piped commands. OS
                // pipe buffers already throttle the child, so real backpressure on top of
                // that isn't implemented yet.
                Packet::DataAck { ack_len, .. } => {
                    debug!(target: "waveshell_agent", "dataack {ack_len}, not yet gating piped writes on it");
                }
                _ => {}
            }
        }
    });

    let start = Instant::now();
    let status = tokio::select! {
        r = child.wait() => r,
        _ = kill_rx.recv() => {
            let _ = child.start_kill();
            child.wait().await
        }
        _ = sleep_opt(spec.timeout_ms) => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    dispatch_task.abort();

    let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
    let (final_state, final_state_diff) = match (spec.return_state, &probe_dir) {
        (true, Some(dir)) => resolve_final_state(&spec, dir.path()),
        _ => (None, None),
    };

    let _ = out_tx
        .send(Packet::CmdDone {
            ck: spec.ck,
            exit_code,
            duration_ms,
            final_state,
            final_state_diff,
            final_state_base_ptr: None,
        })
        .await;
}

async fn pump_fd<R: AsyncRead + Unpin>(mut reader: R, fd_num: i32, ck: CmdKey, out_tx: mpsc::Sender<Packet>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data64 = B64.encode(&buf[..n]);
                if out_tx
                    .send(Packet::Data { ck: ck.clone(), fd_num, data64 })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!(target: "waveshell_agent", "fd {fd_num} read error for {:?}: {e}", ck);
                break;
            }
        }
    }
}

/// Run `spec` under an agent-owned pty, so the command can interact with a tty (full-screen
/// programs, `sudo` prompts) and receive resize/signal delivery via the line discipline.
pub async fn run_pty(spec: RunSpec, out_tx: mpsc::Sender<Packet>, mut inbound: mpsc::Receiver<Packet>) {
    let probe_dir = if spec.return_state {
        match tempfile::tempdir() {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(target: "waveshell_agent", "failed to create probe dir: {e}");
                None
            }
        }
    } else {
        None
    };
    let script = build_script(&spec, probe_dir.as_ref().map(|d| d.path()));

    let mut builder = CommandBuilder::new(interpreter_for(&spec.state.shell_type));
    builder.arg("-c");
    builder.arg(&script);
    builder.cwd(&spec.state.cwd);
    builder.env_clear();
    for (k, v) in &spec.state.env {
        builder.env(k, v);
    }

    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
    let pty = match ControllingPty::spawn(builder, output_tx) {
        Ok(p) => p,
        Err(e) => {
            let _ = out_tx
                .send(Packet::Response {
                    req_id: spec.req_id.clone(),
                    error: Some(format!("pty spawn failed: {e}")),
                    data: None,
                })
                .await;
            return;
        }
    };
    let pid = pty.pid().await.unwrap_or(0) as i32;
    let _ = out_tx
        .send(Packet::CmdStart {
            req_id: spec.req_id.clone(),
            ck: spec.ck.clone(),
            pid,
            agent_pid: std::process::id() as i32,
        })
        .await;

    let output_pump = {
        let ck = spec.ck.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = output_rx.recv().await {
                let data64 = B64.encode(&data);
                if out_tx
                    .send(Packet::Data { ck: ck.clone(), fd_num: 1, data64 })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    let (sudo_reply_tx, mut sudo_reply_rx) = mpsc::channel::<(String, String)>(1);
    let dispatch_pty = pty.clone();
    let dispatch_task = tokio::spawn(async move {
        while let Some(packet) = inbound.recv().await {
            match packet {
                Packet::SpecialInput { input, .. } => match input {
                    SpecialInput::Winsize { rows, cols } => {
                        let _ = dispatch_pty.resize(rows, cols).await;
                    }
                    SpecialInput::Signal { signum } => match control_byte_for_signal(signum) {
                        Some(byte) => {
                            let _ = dispatch_pty.write_input(&[byte]).await;
                        }
                        None if is_terminal_signal(signum) => {
                            let _ = dispatch_pty.kill().await;
                        }
                        None => {}
                    },
                },
                Packet::SudoResponse { encrypted_secret, srv_pub_key, .. } => {
                    let _ = sudo_reply_tx.send((srv_pub_key, encrypted_secret)).await;
                }
                Packet::DataAck { ack_len, .. } => {
                    debug!(target: "waveshell_agent", "dataack {ack_len}, not yet gating pty writes on it");
                }
                _ => {}
            }
        }
    });

    // Sudo prompts during a pty-backed command are relayed the same way the core relays an
    // ssh/sudo dial password: scan the pty's tail line, ECDH-wrap a request, wait for the
    // core's encrypted reply. Piped (non-pty) commands don't get this — there is no tty for
    // `sudo` to detect and no line buffer to scan for the prompt.
    let sudo_watch = {
        let pty = pty.clone();
        let out_tx = out_tx.clone();
        let ck = spec.ck.clone();
        tokio::spawn(async move {
            const MAX_SUDO_ATTEMPTS: u32 = 3;
            let mut attempts: u32 = 0;
            let mut prompted = false;
            loop {
                tokio::time::sleep(Duration::from_millis(150)).await;
                if !pty.is_alive().await {
                    break;
                }
                let line = pty.log.last_line();
                let is_prompt = looks_like_sudo_prompt(&line);
                if is_prompt && !prompted {
                    prompted = true;
                    attempts += 1;
                    if attempts > MAX_SUDO_ATTEMPTS {
                        break;
                    }
                    let status = if attempts == 1 { "first-attempt" } else { "retry" };
                    if attempts > 1 {
                        // A second prompt means the last secret was rejected: tell the core
                        // to evict it before asking fresh (the core sends no reply to this).
                        let (evict, evict_key) = PendingSudo::begin();
                        drop(evict);
                        let _ = out_tx
                            .send(Packet::SudoRequest {
                                ck: ck.clone(),
                                shell_pub_key: evict_key,
                                sudo_status: "failure".to_string(),
                            })
                            .await;
                    }
                    if let Some(password) =
                        relay_sudo_password(ck.clone(), status, &out_tx, &mut sudo_reply_rx).await
                    {
                        let _ = pty.write_input(format!("{password}\n").as_bytes()).await;
                    }
                    // Give the shell a moment to consume the line before re-scanning it.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                } else if !is_prompt {
                    prompted = false;
                }
            }
        })
    };

    let start = Instant::now();
    loop {
        tokio::select! {
            _ = sleep_opt(spec.timeout_ms) => {
                let _ = pty.kill().await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                if !pty.is_alive().await {
                    break;
                }
            }
        }
    }
    let duration_ms = start.elapsed().as_millis() as u64;

    dispatch_task.abort();
    sudo_watch.abort();
    // Give the reader thread a moment to flush its last chunk before dropping the pump.
    tokio::time::sleep(Duration::from_millis(20)).await;
    output_pump.abort();

    let (final_state, final_state_diff) = match (spec.return_state, &probe_dir) {
        (true, Some(dir)) => resolve_final_state(&spec, dir.path()),
        _ => (None, None),
    };

    let _ = out_tx
        .send(Packet::CmdDone {
            ck: spec.ck,
            exit_code: 0,
            duration_ms,
            final_state,
            final_state_diff,
            final_state_base_ptr: None,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use waveshell_proto::CmdKey;

    fn base_state() -> ShellState {
        ShellState::new(ShellType::Bash, "/tmp", BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
    }

    #[tokio::test]
    async fn piped_run_reports_cmdstart_then_data_then_cmddone() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let (_inbound_tx, inbound_rx) = mpsc::channel(4);
        let spec = RunSpec {
            req_id: "r1".to_string(),
            ck: CmdKey::new("s1", "l1"),
            command: "echo hello".to_string(),
            state: base_state(),
            use_pty: false,
            timeout_ms: Some(5_000),
            return_state: false,
        };

        run_piped(spec, out_tx, inbound_rx).await;

        let mut saw_start = false;
        let mut saw_data = false;
        let mut saw_done = false;
        while let Some(packet) = out_rx.recv().await {
            match packet {
                Packet::CmdStart { .. } => saw_start = true,
                Packet::Data { fd_num: 1, data64, .. } => {
                    if B64.decode(&data64).unwrap() == b"hello\n" {
                        saw_data = true;
                    }
                }
                Packet::CmdDone { exit_code, .. } => {
                    saw_done = true;
                    assert_eq!(exit_code, 0);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_start && saw_data && saw_done);
    }

    #[tokio::test]
    async fn piped_run_captures_cwd_change_as_return_state() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let (_inbound_tx, inbound_rx) = mpsc::channel(4);
        let dir = tempfile::tempdir().unwrap();
        let spec = RunSpec {
            req_id: "r1".to_string(),
            ck: CmdKey::new("s1", "l1"),
            command: format!("cd {}", dir.path().display()),
            state: base_state(),
            use_pty: false,
            timeout_ms: Some(5_000),
            return_state: true,
        };

        run_piped(spec, out_tx, inbound_rx).await;

        let mut new_cwd = None;
        while let Some(packet) = out_rx.recv().await {
            if let Packet::CmdDone { final_state, final_state_diff, .. } = packet {
                if let Some(s) = final_state {
                    new_cwd = Some(s.cwd);
                } else if let Some(d) = final_state_diff {
                    new_cwd = d.cwd;
                }
                break;
            }
        }
        assert_eq!(new_cwd.as_deref(), Some(dir.path().to_str().unwrap()));
    }

    #[test]
    fn terminal_signals_are_recognized() {
        assert!(is_terminal_signal(9));
        assert!(is_terminal_signal(15));
        assert!(!is_terminal_signal(28)); // SIGWINCH, handled via Winsize instead
    }
}
