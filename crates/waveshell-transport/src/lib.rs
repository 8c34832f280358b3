//! Duplex packet-RPC transport over an agent's stdin/stdout.
//!
//! Generalizes `slarti_ssh::AgentClient` (which owned a `Child` + buffered reader/writer for
//! a single request/response pair) into the full demultiplexing transport spec.md §4.2 asks
//! for: registered rpc/iter mailboxes keyed by `req_id`, plus a single async main channel for
//! everything else (data, dataack, cmddone, cmdfinal, sudorequest, message, raw, ping).
//!
//! Packets within one `req_id` are delivered in the order the agent emitted them; packets
//! across different `req_id`s may interleave, matching the ordering guarantee in spec.md §4.2.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use waveshell_proto::{codec::PacketDecoder, encode_line, DecodedLine, Packet};

/// Default mailbox capacity for a scalar rpc response.
pub const RPC_CHANNEL_SIZE: usize = 1;
/// Mailbox capacity for an rpc-iter stream (e.g. `ReInit`, `StreamFile`).
pub const RPC_ITER_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("timed out waiting for response to req_id {0}")]
    Timeout(String),
    #[error("rpc mailbox for req_id {0} was not registered")]
    NotRegistered(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] waveshell_proto::CodecError),
}

/// A live demultiplexing connection to one agent process.
pub struct ClientProc {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    mailboxes: StdMutex<HashMap<String, mpsc::Sender<Packet>>>,
    main_tx: mpsc::Sender<Packet>,
    main_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClientProc {
    /// Spawn the reader task over `stdout` and wrap `stdin` for outgoing sends.
    ///
    /// `ignore_until_valid` should be `true` for a freshly dialed agent so SSH banner noise
    /// ahead of the first packet doesn't kill the connection (spec.md §4.1/§4.4).
    pub fn new(
        stdin: Box<dyn AsyncWrite + Unpin + Send>,
        stdout: Box<dyn AsyncRead + Unpin + Send>,
        ignore_until_valid: bool,
    ) -> std::sync::Arc<Self> {
        let (main_tx, main_rx) = mpsc::channel(RPC_ITER_CHANNEL_SIZE);
        let proc = std::sync::Arc::new(ClientProc {
            writer: Mutex::new(stdin),
            mailboxes: StdMutex::new(HashMap::new()),
            main_tx,
            main_rx: Mutex::new(Some(main_rx)),
            reader_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let reader_proc = proc.clone();
        let handle = tokio::spawn(async move {
            reader_proc.read_loop(stdout, ignore_until_valid).await;
        });
        // Best-effort: store the handle for Close() to await. Using try_lock because we're
        // still inside `new`, a context no one else can be contending on yet.
        if let Ok(mut slot) = proc.reader_task.try_lock() {
            *slot = Some(handle);
        }
        proc
    }

    async fn read_loop(&self, stdout: Box<dyn AsyncRead + Unpin + Send>, ignore_until_valid: bool) {
        let mut reader = BufReader::new(stdout).lines();
        let mut decoder = PacketDecoder::new(ignore_until_valid);
        loop {
            let line = match reader.next_line().await {
                Ok(Some(l)) => l,
                Ok(None) => {
                    debug!(target: "waveshell_transport", "agent stdout closed");
                    break;
                }
                Err(e) => {
                    warn!(target: "waveshell_transport", "agent stdout read error: {e}");
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            match decoder.decode_line(&line) {
                Ok(DecodedLine::Packet(packet)) => self.dispatch(packet).await,
                Ok(DecodedLine::UnknownType { raw_type, .. }) => {
                    warn!(target: "waveshell_transport", "unknown packet type {raw_type:?}, ignoring");
                }
                Ok(DecodedLine::Noise(raw)) => {
                    debug!(target: "waveshell_transport", "ignoring pre-handshake noise: {raw}");
                }
                Err(e) => {
                    warn!(target: "waveshell_transport", "packet decode error, dropping connection: {e}");
                    break;
                }
            }
        }
        self.mark_closed();
    }

    async fn dispatch(&self, packet: Packet) {
        if let Some(req_id) = packet.req_id() {
            let sender = self.mailboxes.lock().unwrap().get(req_id).cloned();
            if let Some(sender) = sender {
                let terminal = packet.is_iter_terminal();
                if sender.send(packet).await.is_err() {
                    warn!(target: "waveshell_transport", "rpc mailbox for {req_id} dropped");
                }
                if terminal {
                    self.mailboxes.lock().unwrap().remove(req_id);
                }
                return;
            }
        }
        if self.main_tx.send(packet).await.is_err() {
            warn!(target: "waveshell_transport", "main channel receiver dropped");
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mailboxes = std::mem::take(&mut *self.mailboxes.lock().unwrap());
        drop(mailboxes); // dropping the senders makes pending recv() calls observe closure
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize and write `packet` to the agent's stdin.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let line = encode_line(packet)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Allocate a mailbox for `req_id` with the given capacity (use
    /// [`RPC_ITER_CHANNEL_SIZE`] for multi-packet rpc-iter streams).
    pub fn register_rpc(&self, req_id: impl Into<String>, size: usize) -> RpcMailbox {
        let (tx, rx) = mpsc::channel(size.max(1));
        self.mailboxes.lock().unwrap().insert(req_id.into(), tx);
        RpcMailbox { rx }
    }

    /// Block until the mailbox for `req_id` receives one packet, or the timeout fires.
    pub async fn wait_for_response(
        &self,
        mailbox: &mut RpcMailbox,
        timeout: Duration,
    ) -> Result<Packet, TransportError> {
        match tokio::time::timeout(timeout, mailbox.rx.recv()).await {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(String::new())),
        }
    }

    /// Take ownership of the main channel receiver. Can only be called once; subsequent
    /// calls return `None`, mirroring the single-consumer `MainCh` in spec.md.
    pub fn take_main_channel(&self) -> Option<mpsc::Receiver<Packet>> {
        self.main_rx.try_lock().ok().and_then(|mut g| g.take())
    }

    /// Cancel all open mailboxes, close stdin, and await the reader task with a hard deadline.
    pub async fn close(&self, deadline: Duration) {
        self.mark_closed();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        let handle = self.reader_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(deadline, handle).await;
        }
    }
}

/// A registered rpc or rpc-iter mailbox.
pub struct RpcMailbox {
    rx: mpsc::Receiver<Packet>,
}

impl RpcMailbox {
    /// Pull the next packet in this stream, or `None` once the stream has been removed
    /// (transport closed, or a terminal packet already delivered).
    pub async fn next(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveshell_proto::CmdKey;

    fn duplex_pair() -> (
        (Box<dyn AsyncWrite + Unpin + Send>, Box<dyn AsyncRead + Unpin + Send>),
        (Box<dyn AsyncWrite + Unpin + Send>, Box<dyn AsyncRead + Unpin + Send>),
    ) {
        let (a_write, b_read) = tokio::io::duplex(8192);
        let (b_write, a_read) = tokio::io::duplex(8192);
        (
            (Box::new(a_write), Box::new(a_read)),
            (Box::new(b_write), Box::new(b_read)),
        )
    }

    #[tokio::test]
    async fn rpc_response_routes_to_registered_mailbox() {
        let ((core_w, core_r), (agent_w, agent_r)) = duplex_pair();
        let core = ClientProc::new(core_w, core_r, false);
        let agent = ClientProc::new(agent_w, agent_r, false);

        let mut mailbox = core.register_rpc("req-1", RPC_CHANNEL_SIZE);
        agent
            .send_packet(&Packet::CmdStart {
                req_id: "req-1".into(),
                ck: CmdKey::new("s1", "c1"),
                pid: 123,
                agent_pid: 456,
            })
            .await
            .unwrap();

        let resp = core
            .wait_for_response(&mut mailbox, Duration::from_secs(1))
            .await
            .unwrap();
        match resp {
            Packet::CmdStart { pid, .. } => assert_eq!(pid, 123),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregistered_packets_flow_to_main_channel() {
        let ((core_w, core_r), (agent_w, agent_r)) = duplex_pair();
        let core = ClientProc::new(core_w, core_r, false);
        let agent = ClientProc::new(agent_w, agent_r, false);

        let mut main_rx = core.take_main_channel().unwrap();
        agent.send_packet(&Packet::Ping).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(1), main_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(packet, Packet::Ping));
    }

    #[tokio::test]
    async fn main_channel_can_only_be_taken_once() {
        let ((core_w, core_r), (_agent_w, _agent_r)) = duplex_pair();
        let core = ClientProc::new(core_w, core_r, false);
        assert!(core.take_main_channel().is_some());
        assert!(core.take_main_channel().is_none());
    }

    #[tokio::test]
    async fn close_cancels_pending_mailbox() {
        let ((core_w, core_r), (_agent_w, _agent_r)) = duplex_pair();
        let core = ClientProc::new(core_w, core_r, false);
        let mut mailbox = core.register_rpc("req-1", RPC_CHANNEL_SIZE);
        core.close(Duration::from_millis(200)).await;
        let result = core
            .wait_for_response(&mut mailbox, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(TransportError::Closed) | Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ((core_w, core_r), (_agent_w, _agent_r)) = duplex_pair();
        let core = ClientProc::new(core_w, core_r, false);
        core.close(Duration::from_millis(200)).await;
        let err = core.send_packet(&Packet::Ping).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
