//! [`CommandPacketSink`] implementation: the far side of spec.md §4.6's `data`/`cmddone`/
//! `cmdfinal` handling, wired into a [`waveshell_proc::WaveshellProc`] via `set_packet_sink`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::Engine;
use tracing::{debug, warn};

use waveshell_proc::{CommandPacketSink, DataAckOutcome, RemoteRegistry, RunCmd};
use waveshell_proto::{CmdKey, Packet};
use waveshell_state::StateStore;
use waveshell_updates::{Store, Update, UpdateBus};

use crate::ordering::CmdWaitGate;
use crate::orchestrator::STATUS_INDICATOR_OUTPUT;

/// Tracks the next write offset into a command's persistent pty-out blob, keyed by
/// `CmdKey`. Data positions only ever move forward and are dropped once the command is
/// done, so a plain map guarded by a std mutex is enough (spec.md §4.6).
#[derive(Default)]
struct DataPosMap {
    positions: StdMutex<HashMap<CmdKey, u64>>,
}

impl DataPosMap {
    fn advance(&self, ck: &CmdKey, len: usize) -> u64 {
        let mut m = self.positions.lock().unwrap();
        let pos = m.entry(ck.clone()).or_insert(0);
        let start = *pos;
        *pos += len as u64;
        start
    }

    fn forget(&self, ck: &CmdKey) {
        self.positions.lock().unwrap().remove(ck);
    }
}

#[cfg(test)]
mod data_pos_tests {
    use super::*;

    #[test]
    fn advance_accumulates_per_key_and_forget_resets_it() {
        let m = DataPosMap::default();
        let a = CmdKey::new("scr", "a");
        let b = CmdKey::new("scr", "b");

        assert_eq!(m.advance(&a, 10), 0);
        assert_eq!(m.advance(&a, 5), 10);
        assert_eq!(m.advance(&b, 3), 0, "distinct keys track independent offsets");

        m.forget(&a);
        assert_eq!(m.advance(&a, 7), 0, "forgetting a key resets its offset");
    }
}

fn unix_ts_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The run-command orchestrator's half of [`CommandPacketSink`] (spec.md §4.6/§4.7, C7).
pub struct RunSink {
    registry: Arc<RemoteRegistry>,
    store: Arc<dyn Store>,
    updates: Arc<UpdateBus>,
    state_store: Arc<StateStore>,
    gate: Arc<CmdWaitGate>,
    data_pos: DataPosMap,
}

impl RunSink {
    pub fn new(
        registry: Arc<RemoteRegistry>,
        store: Arc<dyn Store>,
        updates: Arc<UpdateBus>,
        state_store: Arc<StateStore>,
        gate: Arc<CmdWaitGate>,
    ) -> Self {
        RunSink {
            registry,
            store,
            updates,
            state_store,
            gate,
            data_pos: DataPosMap::default(),
        }
    }

    fn remote_matches(cmd: &RunCmd, remote_id: &str) -> bool {
        cmd.remote.remote_id == remote_id
    }

    /// Resolve the base a `cmddone`'s `final_state_diff` applies against (spec.md §4.6):
    /// prefer the run packet's own state when the agent's declared `final_state_base_ptr`
    /// points at exactly it, otherwise resolve that pointer (or the diff's `base_hash`
    /// directly) through the state store.
    fn resolve_diff_base(
        &self,
        cmd: &RunCmd,
        base_ptr: &Option<waveshell_state::ShellStatePtr>,
        diff: &waveshell_state::ShellStateDiff,
    ) -> Option<waveshell_state::ShellState> {
        let run_state = match &cmd.run_packet {
            Packet::Run { state, .. } => Some(state),
            _ => None,
        };

        if let (Some(ptr), Some(state)) = (base_ptr, run_state) {
            if ptr.is_pure_base() && ptr.base_hash == state.hash_val {
                return Some(state.clone());
            }
        }

        if let Some(ptr) = base_ptr {
            if let Ok(resolved) = self.state_store.resolve(ptr) {
                return Some(resolved);
            }
        }

        self.state_store.get_base(&diff.base_hash)
    }
}

#[async_trait]
impl CommandPacketSink for RunSink {
    async fn on_data(&self, remote_id: &str, packet: Packet) -> DataAckOutcome {
        let Packet::Data { ck, fd_num, data64 } = packet else {
            return DataAckOutcome::Rejected {
                error: "on_data called with a non-data packet".to_string(),
            };
        };

        self.gate.wait_until_open(&ck).await;

        let Some(proc) = self.registry.get_by_id(remote_id) else {
            return DataAckOutcome::Rejected {
                error: format!("unknown remote {remote_id}"),
            };
        };
        let Some(cmd) = proc.get_running_cmd(&ck) else {
            return DataAckOutcome::Rejected {
                error: format!("no running command for {ck:?}"),
            };
        };
        if !Self::remote_matches(&cmd, remote_id) {
            return DataAckOutcome::Rejected {
                error: "ck resolved to a command on a different remote".to_string(),
            };
        }

        let bytes = match base64::engine::general_purpose::STANDARD.decode(&data64) {
            Ok(b) => b,
            Err(e) => {
                return DataAckOutcome::Rejected {
                    error: format!("bad base64 in data packet: {e}"),
                }
            }
        };
        let len = bytes.len();

        if let Some(eph) = &cmd.ephemeral {
            if cmd.is_canceled() {
                // Drained and dropped: the caller already stopped listening, but the
                // agent still needs its ack to keep the write side unblocked.
                return DataAckOutcome::Accepted { len };
            }
            let sender = if fd_num == 2 { &eph.stderr } else { &eph.stdout };
            return match sender.send(bytes).await {
                Ok(()) => DataAckOutcome::Accepted { len },
                Err(_) => DataAckOutcome::Rejected {
                    error: "ephemeral output receiver dropped".to_string(),
                },
            };
        }

        let pos = self.data_pos.advance(&ck, len);
        match self
            .store
            .append_to_cmd_pty_blob(&cmd.screen_id, &ck.cmd_id, &bytes, pos)
            .await
        {
            Ok(update) => {
                self.updates.publish(update);
                if let Err(e) = self
                    .store
                    .set_status_indicator_level(&cmd.screen_id, STATUS_INDICATOR_OUTPUT)
                    .await
                {
                    warn!(target: "waveshell_run", "status indicator update failed for {}: {e}", cmd.screen_id);
                }
                DataAckOutcome::Accepted { len }
            }
            Err(e) => DataAckOutcome::Rejected { error: e.to_string() },
        }
    }

    async fn on_cmd_done(&self, remote_id: &str, packet: Packet) {
        let Packet::CmdDone {
            ck,
            exit_code,
            duration_ms,
            final_state,
            final_state_diff,
            final_state_base_ptr,
        } = packet
        else {
            return;
        };

        self.gate.wait_until_open(&ck).await;
        self.data_pos.forget(&ck);

        let Some(proc) = self.registry.get_by_id(remote_id) else {
            warn!(target: "waveshell_run", "cmddone for unknown remote {remote_id}");
            return;
        };
        let Some(cmd) = proc.remove_running_cmd(&ck) else {
            debug!(target: "waveshell_run", "cmddone for untracked {:?}, ignoring", ck);
            return;
        };
        proc.release_pending_state(&cmd.screen_id, &cmd.remote);

        let new_state = match (final_state, final_state_diff) {
            (Some(state), _) => Some(waveshell_state::strip_env(state)),
            (None, Some(diff)) => match self.resolve_diff_base(&cmd, &final_state_base_ptr, &diff) {
                Some(base) => match waveshell_state::apply_shell_state_diff(&base, &diff) {
                    Ok(applied) => Some(applied),
                    Err(e) => {
                        warn!(target: "waveshell_run", "cmddone {:?}: diff application failed: {e}", ck);
                        None
                    }
                },
                None => {
                    warn!(
                        target: "waveshell_run",
                        "cmddone {:?}: no base state found for diff (base_hash={})", ck, diff.base_hash,
                    );
                    None
                }
            },
            (None, None) => None,
        };

        if !cmd.is_canceled() {
            if let Some(state) = &new_state {
                self.state_store.store_base(state.clone());

                let prev_state = match self
                    .store
                    .get_remote_state_ptr(&cmd.session_id, &cmd.screen_id, &cmd.remote)
                    .await
                {
                    Ok(Some(ptr)) => self.state_store.resolve(&ptr).ok(),
                    _ => None,
                };
                let (full_state, diff) = match &prev_state {
                    Some(prev) => {
                        let diff = waveshell_state::make_shell_state_diff(prev, state);
                        if waveshell_state::should_use_diff(&diff) {
                            (None, Some(diff))
                        } else {
                            (Some(state.clone()), None)
                        }
                    }
                    None => (Some(state.clone()), None),
                };
                if let Some(diff) = &diff {
                    if let Some(hash) = &diff.hash_val {
                        self.state_store.store_diff(hash.clone(), diff.clone());
                    }
                }

                if let Err(e) = self
                    .store
                    .update_remote_state(&cmd.session_id, &cmd.screen_id, &cmd.remote, state.clone(), full_state, diff)
                    .await
                {
                    warn!(target: "waveshell_run", "update_remote_state failed for {:?}: {e}", ck);
                }
            }
        }

        if cmd.is_ephemeral() {
            if let Some(eph) = &cmd.ephemeral {
                if !cmd.is_canceled() && exit_code != 0 {
                    let _ = eph
                        .stderr
                        .send(format!("[exit {exit_code}]\n").into_bytes())
                        .await;
                }
            }
            return;
        }

        let done_ts = unix_ts_ms();
        if let Err(e) = self
            .store
            .update_cmd_done_info(&cmd.screen_id, &ck.cmd_id, exit_code, duration_ms, done_ts)
            .await
        {
            warn!(target: "waveshell_run", "update_cmd_done_info failed for {:?}: {e}", ck);
        }
        if let Err(e) = self.store.increment_num_running_cmds(&cmd.screen_id, -1).await {
            warn!(target: "waveshell_run", "increment_num_running_cmds failed for {}: {e}", cmd.screen_id);
        }
        match self.store.get_cmd(&cmd.screen_id, &ck.cmd_id).await {
            Ok(Some(updated)) => self.updates.publish(Update::Cmd(updated)),
            Ok(None) => warn!(target: "waveshell_run", "cmd row vanished after cmddone: {:?}", ck),
            Err(e) => warn!(target: "waveshell_run", "get_cmd failed after cmddone {:?}: {e}", ck),
        }
    }

    async fn on_cmd_final(&self, remote_id: &str, packet: Packet) {
        let Packet::CmdFinal { ck, error } = packet else {
            return;
        };

        self.gate.wait_until_open(&ck).await;
        self.data_pos.forget(&ck);

        let Some(proc) = self.registry.get_by_id(remote_id) else {
            warn!(target: "waveshell_run", "cmdfinal for unknown remote {remote_id}");
            return;
        };
        let Some(cmd) = proc.remove_running_cmd(&ck) else {
            debug!(target: "waveshell_run", "cmdfinal for untracked {:?}, ignoring", ck);
            return;
        };
        proc.release_pending_state(&cmd.screen_id, &cmd.remote);

        if let Some(err) = &error {
            warn!(target: "waveshell_run", "cmdfinal {:?}: agent reported {err}", ck);
        }

        if cmd.is_ephemeral() {
            if let Some(eph) = &cmd.ephemeral {
                let msg = error.unwrap_or_else(|| "command terminated unexpectedly".to_string());
                let _ = eph.stderr.send(format!("[{msg}]\n").into_bytes()).await;
            }
            return;
        }

        let done_ts = unix_ts_ms();
        if let Err(e) = self.store.hangup_cmd(&cmd.screen_id, &ck.cmd_id, done_ts).await {
            warn!(target: "waveshell_run", "hangup_cmd failed for {:?}: {e}", ck);
        }
        if let Err(e) = self.store.increment_num_running_cmds(&cmd.screen_id, -1).await {
            warn!(target: "waveshell_run", "increment_num_running_cmds failed for {}: {e}", cmd.screen_id);
        }
        match self.store.get_cmd(&cmd.screen_id, &ck.cmd_id).await {
            Ok(Some(updated)) => self.updates.publish(Update::Cmd(updated)),
            Ok(None) => warn!(target: "waveshell_run", "cmd row vanished after cmdfinal: {:?}", ck),
            Err(e) => warn!(target: "waveshell_run", "get_cmd failed after cmdfinal {:?}: {e}", ck),
        }
    }

    async fn on_proc_disconnected(&self, remote_id: &str, hungup: Vec<Arc<RunCmd>>) {
        let done_ts = unix_ts_ms();
        match self.store.hangup_running_cmds_by_remote(remote_id, done_ts).await {
            Ok(rows) => {
                for row in rows {
                    self.updates.publish(Update::Cmd(row));
                }
            }
            Err(e) => warn!(target: "waveshell_run", "hangup_running_cmds_by_remote failed for {remote_id}: {e}"),
        }
        for cmd in hungup {
            if let Some(ck) = cmd.ck() {
                self.data_pos.forget(&ck);
            }
            if let Some(eph) = &cmd.ephemeral {
                let _ = eph.stderr.send(b"[remote disconnected]\n".to_vec()).await;
            }
        }
    }
}
