//! Library half of the shell agent: everything the binary needs except the stdin/stdout
//! event loop itself, which lives in `main.rs` (and, for tests, in `waveshell-cli`'s fixture
//! binary that links this crate directly rather than spawning a prebuilt copy). Mirrors
//! `slarti-ssh`'s split between a reusable library and a thin demo `main.rs`.

pub mod command;
pub mod dispatch;
pub mod error;
pub mod fileio;
pub mod handshake;
pub mod reinit;
pub mod state_capture;
pub mod sudo;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use waveshell_proto::{encode_line, DecodedLine, Packet, PacketDecoder};
use waveshell_state::ShellState;

use command::RunSpec;
use dispatch::Dispatch;
use fileio::FileWrites;

pub use handshake::{build_init, AGENT_PROTOCOL_VERSION};

const OUTBOUND_CHANNEL_SIZE: usize = 256;

/// Run the agent's full read-eval-print loop against the process's own stdin/stdout.
///
/// A dedicated writer task drains an mpsc channel fed by every in-flight command, so the
/// main task only ever reads stdin and fans work out to per-command tasks: a slow `Run`
/// never blocks the agent from answering pings or routing `SpecialInput` to other commands.
pub async fn run_agent_main() -> Result<()> {
    let (out_tx, mut out_rx) = mpsc::channel::<Packet>(OUTBOUND_CHANNEL_SIZE);

    let writer_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(packet) = out_rx.recv().await {
            let line = match encode_line(&packet) {
                Ok(l) => l,
                Err(e) => {
                    warn!(target: "waveshell_agent", "failed to encode outbound packet: {e}");
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                debug!(target: "waveshell_agent", "stdout closed, writer task exiting");
                break;
            }
        }
    });

    if out_tx.send(build_init()).await.is_err() {
        return Ok(());
    }

    let dispatch = Arc::new(Dispatch::new());
    let file_writes = Arc::new(FileWrites::new());

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut decoder = PacketDecoder::new(false);

    info!(target: "waveshell_agent", version = AGENT_PROTOCOL_VERSION, "agent started");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => {
                debug!(target: "waveshell_agent", "stdin closed, shutting down");
                break;
            }
            Err(e) => {
                error!(target: "waveshell_agent", "stdin read error: {e}");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }

        let decoded = match decoder.decode_line(&line) {
            Ok(d) => d,
            Err(e) => {
                error!(target: "waveshell_agent", "fatal codec error, disconnecting: {e}");
                break;
            }
        };

        let packet = match decoded {
            DecodedLine::Packet(p) => p,
            DecodedLine::UnknownType { raw_type, .. } => {
                debug!(target: "waveshell_agent", "ignoring unknown packet type {raw_type:?}");
                continue;
            }
            DecodedLine::Noise(raw) => {
                debug!(target: "waveshell_agent", "ignoring noise line: {raw:?}");
                continue;
            }
        };

        match packet {
            Packet::Ping => {
                debug!(target: "waveshell_agent", "ping");
            }
            Packet::Run {
                req_id,
                ck,
                command,
                shell_type: _,
                state,
                state_complete: _,
                use_pty,
                timeout_ms,
                return_state,
            } => {
                run_command(req_id, ck, command, state, use_pty, timeout_ms, return_state, &dispatch, &out_tx);
            }
            Packet::ReInit { req_id, shell_type } => {
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = reinit::handle_reinit(req_id, shell_type).await;
                    let _ = out_tx.send(response).await;
                });
            }
            Packet::StreamFile { req_id, path, .. } => {
                let out_tx = out_tx.clone();
                tokio::spawn(fileio::handle_stream_file_request(req_id, path, out_tx));
            }
            Packet::WriteFile { req_id, path, data64, eof } => {
                file_writes
                    .handle_write_file(req_id, path, data64, eof, out_tx.clone())
                    .await;
            }
            Packet::SpecialInput { ck, input } => {
                dispatch.route(&ck, Packet::SpecialInput { ck: ck.clone(), input }).await;
            }
            Packet::DataAck { ck, ack_len, error } => {
                dispatch.route(&ck, Packet::DataAck { ck: ck.clone(), ack_len, error }).await;
            }
            Packet::SudoResponse { ck, encrypted_secret, srv_pub_key } => {
                dispatch
                    .route(&ck, Packet::SudoResponse { ck: ck.clone(), encrypted_secret, srv_pub_key })
                    .await;
            }
            other => {
                debug!(target: "waveshell_agent", "ignoring packet not expected from the core: {other:?}");
            }
        }
    }

    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_command(
    req_id: String,
    ck: waveshell_proto::CmdKey,
    command: String,
    state: ShellState,
    use_pty: bool,
    timeout_ms: Option<u64>,
    return_state: bool,
    dispatch: &Arc<Dispatch>,
    out_tx: &mpsc::Sender<Packet>,
) {
    let inbound = dispatch.register(ck.clone());
    let spec = RunSpec {
        req_id,
        ck: ck.clone(),
        command,
        state,
        use_pty,
        timeout_ms,
        return_state,
    };
    let out_tx = out_tx.clone();
    let dispatch = dispatch.clone();
    tokio::spawn(async move {
        if use_pty {
            command::run_pty(spec, out_tx, inbound).await;
        } else {
            command::run_piped(spec, out_tx, inbound).await;
        }
        dispatch.unregister(&ck);
    });
}
