use serde::{Deserialize, Serialize};
use waveshell_state::{ShellState, ShellStateDiff, ShellStatePtr};

/// A command key: `(screenId, lineId)`, split into a group id and a command id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CmdKey {
    pub group_id: String,
    pub cmd_id: String,
}

impl CmdKey {
    pub fn new(group_id: impl Into<String>, cmd_id: impl Into<String>) -> Self {
        CmdKey {
            group_id: group_id.into(),
            cmd_id: cmd_id.into(),
        }
    }
}

/// Resize/signal delivery to a running command's pty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialInput {
    Signal { signum: i32 },
    Winsize { rows: u16, cols: u16 },
}

/// The full packet taxonomy exchanged between the core and a shell agent.
///
/// Every variant carries its own `type` discriminator on the wire (see [`crate::codec`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Agent -> core handshake. `notfound` means the agent binary is absent on this host.
    Init {
        notfound: bool,
        #[serde(default)]
        uname: String,
        #[serde(default)]
        user: String,
        #[serde(default)]
        homedir: String,
        #[serde(default)]
        hostname: String,
        #[serde(default)]
        shell: String,
        #[serde(default)]
        version: String,
    },
    /// Keepalive / parser-sync, either direction.
    Ping,
    /// Core -> agent: run a command.
    Run {
        req_id: String,
        ck: CmdKey,
        command: String,
        shell_type: String,
        state: ShellState,
        state_complete: bool,
        use_pty: bool,
        timeout_ms: Option<u64>,
        return_state: bool,
    },
    /// Agent -> core: rpc response to Run. Command has started.
    CmdStart {
        req_id: String,
        ck: CmdKey,
        pid: i32,
        agent_pid: i32,
    },
    /// Generic rpc response, may carry an error instead of a payload.
    Response {
        req_id: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// Agent -> core: a chunk of stdout/stderr.
    Data {
        ck: CmdKey,
        fd_num: i32,
        /// Base64-encoded payload.
        data64: String,
    },
    /// Core -> agent: ack for a `Data` packet, gating the agent's write buffer.
    DataAck {
        ck: CmdKey,
        ack_len: usize,
        #[serde(default)]
        error: Option<String>,
    },
    /// Agent -> core: command finished normally.
    CmdDone {
        ck: CmdKey,
        exit_code: i32,
        duration_ms: u64,
        #[serde(default)]
        final_state: Option<ShellState>,
        #[serde(default)]
        final_state_diff: Option<ShellStateDiff>,
        #[serde(default)]
        final_state_base_ptr: Option<ShellStatePtr>,
    },
    /// Agent -> core: hang-up notification for an interrupted run (agent died mid-command).
    CmdFinal {
        ck: CmdKey,
        #[serde(default)]
        error: Option<String>,
    },
    /// Agent -> core: informational send-buffer signal for a running command. Currently only
    /// logged (spec.md §4.6/§9 "a future backpressure implementation may consume it").
    CmdData {
        ck: CmdKey,
        #[serde(default)]
        buffered_bytes: usize,
    },
    /// Core -> agent: re-initialize shell state tracking for a shell type.
    ReInit { req_id: String, shell_type: String },
    /// Agent -> core: result of a ReInit rpc-iter.
    ShellState {
        req_id: String,
        state: ShellState,
    },
    /// Either direction: streamed file read, chunked.
    StreamFile {
        req_id: String,
        path: String,
        #[serde(default)]
        data64: Option<String>,
        eof: bool,
    },
    /// Core -> agent: write a file (possibly chunked across multiple packets).
    WriteFile {
        req_id: String,
        path: String,
        data64: String,
        eof: bool,
    },
    /// Core -> agent: signal delivery / window resize for a running command.
    SpecialInput { ck: CmdKey, input: SpecialInput },
    /// Agent -> core: free-form log line.
    Message { ck: Option<CmdKey>, message: String },
    /// Agent -> core: raw bytes not otherwise classified (e.g. forwarded stderr of ssh itself).
    Raw { message: String },
    /// Agent -> core: shell requests a sudo password, ECDH-wrapped.
    SudoRequest {
        ck: CmdKey,
        shell_pub_key: String,
        sudo_status: String,
    },
    /// Core -> agent: encrypted sudo password response.
    SudoResponse {
        ck: CmdKey,
        encrypted_secret: String,
        srv_pub_key: String,
    },
}

/// Which delivery channel a packet belongs to, per spec §4.2: rpc responses are routed to
/// the waiter that registered `req_id`; everything else flows through the async main channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Belongs to a registered rpc/iter mailbox.
    Rpc,
    /// Has no `req_id`, or its `req_id` is unregistered; delivered on the main channel.
    Async,
}

impl Packet {
    /// The `req_id` this packet is addressed to, if it carries one.
    pub fn req_id(&self) -> Option<&str> {
        match self {
            Packet::Run { req_id, .. }
            | Packet::CmdStart { req_id, .. }
            | Packet::Response { req_id, .. }
            | Packet::ReInit { req_id, .. }
            | Packet::ShellState { req_id, .. }
            | Packet::StreamFile { req_id, .. }
            | Packet::WriteFile { req_id, .. } => Some(req_id.as_str()),
            _ => None,
        }
    }

    /// True when this is a response-shaped packet (as opposed to a request core sends out).
    pub fn is_response_shaped(&self) -> bool {
        matches!(
            self,
            Packet::CmdStart { .. }
                | Packet::Response { .. }
                | Packet::ShellState { .. }
                | Packet::StreamFile { .. }
        )
    }

    /// Whether this packet is terminal for an rpc-iter stream (the last packet of it).
    pub fn is_iter_terminal(&self) -> bool {
        match self {
            Packet::StreamFile { eof, .. } => *eof,
            Packet::Response { .. } | Packet::ShellState { .. } | Packet::CmdStart { .. } => true,
            _ => false,
        }
    }
}
