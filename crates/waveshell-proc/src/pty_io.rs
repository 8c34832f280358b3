//! Bridges the controlling pty's blocking writer and channel-fed reader into the plain
//! `AsyncWrite`/`AsyncRead` halves [`waveshell_transport::ClientProc`] expects, using
//! `tokio::io::duplex` pipes and small forwarding tasks rather than hand-rolled `Future`
//! state machines.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use waveshell_pty::ControllingPty;

const BRIDGE_BUF_SIZE: usize = 8192;

/// Returns an `AsyncWrite` end that forwards everything written to it into `pty`'s stdin,
/// plus the handle of the forwarding task (join it during teardown, or just drop it).
pub fn pty_as_stdin(pty: Arc<ControllingPty>) -> (Box<dyn AsyncWrite + Unpin + Send>, JoinHandle<()>) {
    let (front, mut back) = tokio::io::duplex(BRIDGE_BUF_SIZE);
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; BRIDGE_BUF_SIZE];
        loop {
            match back.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if pty.write_input(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(target: "waveshell_proc", "pty stdin bridge read error: {e}");
                    break;
                }
            }
        }
    });
    (Box::new(front), handle)
}

/// Returns an `AsyncRead` end that yields bytes pulled off `output_rx` (the channel
/// [`ControllingPty::spawn`] streams pty output into), plus the forwarding task's handle.
pub fn pty_output_as_stdout(
    mut output_rx: mpsc::Receiver<Vec<u8>>,
) -> (Box<dyn AsyncRead + Unpin + Send>, JoinHandle<()>) {
    let (mut front, back) = tokio::io::duplex(BRIDGE_BUF_SIZE);
    let handle = tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            if front.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });
    (Box::new(back), handle)
}
