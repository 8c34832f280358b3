use serde::{Deserialize, Serialize};
use waveshell_state::{ShellState, ShellStatePtr};

/// Selects a remote for a given screen scope. `owner_id` non-empty means a foreign remote;
/// the core refuses to run commands against those (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePtr {
    pub remote_id: String,
    pub owner_id: String,
    pub name: String,
}

impl RemotePtr {
    pub fn is_foreign(&self) -> bool {
        !self.owner_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdStatus {
    Running,
    Detached,
    Done,
    Hangup,
}

/// The persistent row for one command invocation (spec.md §4.5 step 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdType {
    pub screen_id: String,
    pub line_id: String,
    pub raw_cmd: String,
    pub remote: RemotePtr,
    pub fe_state: ShellState,
    pub state_ptr: ShellStatePtr,
    pub status: CmdStatus,
    pub pid: i32,
    pub agent_pid: i32,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub rtn_state: bool,
    pub done_ts: Option<u64>,
}

/// Minimal screen row, opaque beyond what the core touches (focus, status indicator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenType {
    pub screen_id: String,
    pub session_id: String,
    pub status_indicator_level: u32,
    pub num_running_cmds: u32,
}

/// Per-screen, per-remote pointer to the "current" shell state, as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub session_id: String,
    pub screen_id: String,
    pub remote: RemotePtr,
    pub fe_state: ShellState,
    pub state_ptr: ShellStatePtr,
}

/// Global client preferences, lazily created on first access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientData {
    pub client_id: String,
    pub hide_shell_prompt: bool,
}

/// Typed updates the core publishes through the external update bus (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Update {
    RemoteRuntimeState {
        remote_id: String,
        status: String,
        install_status: String,
        needs_upgrade: bool,
        err: Option<String>,
    },
    Cmd(CmdType),
    Screen(ScreenType),
    PtyData {
        remote_id: String,
        pty_pos: u64,
        pty_data64: String,
        pty_data_len: usize,
    },
    SessionUpdateForRemote {
        session_id: String,
        remote_id: String,
    },
}

/// A request relayed to the UI asking for a password or passphrase (spec.md §4.8/§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputRequest {
    pub remote_id: String,
    pub query: String,
    pub is_passphrase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputResponse {
    pub text: Option<String>,
    pub timed_out: bool,
}
