use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use waveshell_proto::{CmdKey, Packet};
use waveshell_updates::RemotePtr;

/// Overrides applied by an ephemeral run and the sinks its output flows to instead of the
/// persistent command log (spec.md §3/§4.5 step 6).
pub struct EphemeralOpts {
    pub use_pty: Option<bool>,
    pub override_cwd: Option<String>,
    pub timeout_ms: Option<u64>,
    pub extra_env: BTreeMap<String, String>,
    pub stdout: mpsc::Sender<Vec<u8>>,
    pub stderr: mpsc::Sender<Vec<u8>>,
}

/// Bookkeeping for one in-flight command, from `cmdstart` to `cmddone`/`cmdfinal`
/// (spec.md §3, invariant 3).
pub struct RunCmd {
    pub session_id: String,
    pub screen_id: String,
    pub remote: RemotePtr,
    pub run_packet: Packet,
    pub ephemeral: Option<EphemeralOpts>,
    pub canceled: Arc<AtomicBool>,
    /// Display line number, used in the pending-state collision error message.
    pub line_num: u64,
}

impl RunCmd {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.is_some()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn ck(&self) -> Option<CmdKey> {
        match &self.run_packet {
            Packet::Run { ck, .. } => Some(ck.clone()),
            _ => None,
        }
    }
}
