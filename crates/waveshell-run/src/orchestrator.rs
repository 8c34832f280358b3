//! The run-command orchestrator (spec.md §4.5, C6): resolves a screen+remote's current
//! shell state, reserves the pending-state slot, dials the agent with a `run` packet, and
//! persists the resulting [`CmdType`] row.
//!
//! Generalizes `slarti_ssh::ssh_run_capture`'s one-shot "send a command, wait for its rpc
//! response" shape into the long-running, state-tracking version spec.md asks for: the rpc
//! here only covers the `cmdstart` handshake, with `data`/`cmddone`/`cmdfinal` arriving
//! later on the proc's async channel and handled by [`crate::sink::RunSink`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use waveshell_proc::{EphemeralOpts, RemoteRegistry, RunCmd, Status};
use waveshell_proto::{CmdKey, Packet};
use waveshell_state::{InjectOpts, ShellStatePtr, StateStore};
use waveshell_transport::RPC_CHANNEL_SIZE;
use waveshell_updates::{CmdStatus, CmdType, RemotePtr, Store, Update, UpdateBus};

use crate::error::RunError;
use crate::ordering::CmdWaitGate;

/// How long a `run` packet's rpc waits for the agent's `cmdstart` response.
pub const CMDSTART_TIMEOUT: Duration = Duration::from_secs(5);
/// Default size of the persistent pty-out blob allocated for a non-ephemeral command,
/// mirroring the source's `termOpts.maxPtySize` default.
pub const DEFAULT_MAX_PTY_SIZE: u64 = 1024 * 1024;
/// Status-indicator level set on a screen the moment a command starts producing output.
pub const STATUS_INDICATOR_OUTPUT: u32 = 1;

/// Everything needed to run one command (spec.md §4.5 steps 1-4).
pub struct RunRequest {
    pub session_id: String,
    pub screen_id: String,
    pub remote: RemotePtr,
    pub ck: CmdKey,
    pub raw_cmd: String,
    pub shell_type: String,
    pub use_pty: bool,
    pub timeout_ms: Option<u64>,
    pub return_state: bool,
    /// Line number shown to the user; threaded into the pending-state collision error.
    pub line_num: u64,
    /// `None` for a persistent, logged command. `Some` for a one-off whose output is
    /// redirected to the caller instead of the command log (spec.md §3/§4.5 step 6).
    pub ephemeral: Option<EphemeralOpts>,
}

/// Returned alongside the freshly created [`CmdType`] row; the caller must call
/// [`ReleaseGuard::release`] once it has finished anything that must happen before
/// `data`/`cmddone`/`cmdfinal` handlers for this command are allowed to run (spec.md §4.7).
#[must_use = "dropping this without calling release() leaves the command's handlers gated forever"]
pub struct ReleaseGuard {
    gate: Arc<CmdWaitGate>,
    ck: CmdKey,
}

impl ReleaseGuard {
    pub fn release(self) {
        self.gate.finish_wait(&self.ck);
    }
}

pub struct RunOrchestrator {
    registry: Arc<RemoteRegistry>,
    store: Arc<dyn Store>,
    updates: Arc<UpdateBus>,
    state_store: Arc<StateStore>,
    gate: Arc<CmdWaitGate>,
    inject_opts: InjectOpts,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<RemoteRegistry>,
        store: Arc<dyn Store>,
        updates: Arc<UpdateBus>,
        state_store: Arc<StateStore>,
        gate: Arc<CmdWaitGate>,
        inject_opts: InjectOpts,
    ) -> Self {
        RunOrchestrator {
            registry,
            store,
            updates,
            state_store,
            gate,
            inject_opts,
        }
    }

    /// Run spec.md §4.5's full algorithm. On success the `cmdstart` rpc has already come
    /// back and the command's row is persisted (unless ephemeral); the caller must call
    /// [`ReleaseGuard::release`] to let queued `data`/`cmddone` handlers through.
    pub async fn run_command(&self, req: RunRequest) -> Result<(CmdType, ReleaseGuard), RunError> {
        // Step 1: authorization / addressing invariants.
        if req.remote.is_foreign() {
            return Err(RunError::ForeignRemote {
                owner_id: req.remote.owner_id.clone(),
            });
        }
        if req.ck.group_id != req.screen_id {
            return Err(RunError::GroupScreenMismatch {
                group_id: req.ck.group_id.clone(),
                screen_id: req.screen_id.clone(),
            });
        }

        // Step 2: the remote must have a live, connected proc.
        let proc = self
            .registry
            .get_by_id(&req.remote.remote_id)
            .ok_or_else(|| RunError::RemoteNotFound(req.remote.remote_id.clone()))?;
        if proc.status() != Status::Connected {
            return Err(RunError::NotConnected);
        }

        // Step 3: resolve the screen+remote's current state pointer.
        let ptr = self
            .store
            .get_remote_state_ptr(&req.session_id, &req.screen_id, &req.remote)
            .await?
            .ok_or(RunError::MissingStatePtr)?;

        // Step 4: pending-state reservation. Only a state-returning run occupies the slot;
        // an ephemeral run is allowed to preempt whatever currently occupies it.
        let is_ephemeral = req.ephemeral.is_some();
        let mut reserved = false;
        if req.return_state {
            match proc.reserve_pending_state(&req.screen_id, &req.remote, req.ck.clone()) {
                Ok(()) => reserved = true,
                Err(existing_ck) if is_ephemeral => {
                    if let Some(existing) = proc.get_running_cmd(&existing_ck) {
                        existing.cancel();
                    }
                    proc.reserve_pending_state_preempting(&req.screen_id, &req.remote, req.ck.clone());
                    reserved = true;
                }
                Err(existing_ck) => {
                    let linenum = proc
                        .get_running_cmd(&existing_ck)
                        .map(|c| c.line_num)
                        .unwrap_or(0);
                    return Err(RunError::PendingStateCollision { linenum });
                }
            }
        }

        let screen_id = req.screen_id.clone();
        let remote = req.remote.clone();
        match self.run_command_inner(req, &proc, &ptr).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if reserved {
                    proc.release_pending_state(&screen_id, &remote);
                }
                Err(e)
            }
        }
    }

    async fn run_command_inner(
        &self,
        mut req: RunRequest,
        proc: &Arc<waveshell_proc::WaveshellProc>,
        ptr: &ShellStatePtr,
    ) -> Result<(CmdType, ReleaseGuard), RunError> {
        // Step 5: resolve the pointer to a full state, then strip and reinject the
        // waveterm-identification env vars the agent should see on its side.
        let resolved = self.state_store.resolve(ptr)?;
        let mut state = waveshell_state::inject_waveterm_vars(
            waveshell_state::strip_env(resolved),
            &self.inject_opts,
        );

        // Step 6: ephemeral overrides. `req.ephemeral` is taken here so it can be moved,
        // unchanged, into the `RunCmd` bookkeeping entry in step 9.
        let mut use_pty = req.use_pty;
        let mut timeout_ms = req.timeout_ms;
        let ephemeral = req.ephemeral.take();
        if let Some(eph) = &ephemeral {
            if let Some(up) = eph.use_pty {
                use_pty = up;
            }
            if let Some(t) = eph.timeout_ms {
                timeout_ms = Some(t);
            }
            if let Some(cwd) = &eph.override_cwd {
                let home = proc.init_info().map(|i| i.homedir).unwrap_or_default();
                state.cwd = expand_tilde(cwd, &home);
            }
            for (k, v) in &eph.extra_env {
                state.env.insert(k.clone(), v.clone());
            }
            state.rehash();
        }

        // Step 7: send the run packet and wait for its cmdstart rpc response.
        let req_id = Uuid::new_v4().to_string();
        let run_packet = Packet::Run {
            req_id: req_id.clone(),
            ck: req.ck.clone(),
            command: req.raw_cmd.clone(),
            shell_type: req.shell_type.clone(),
            state,
            state_complete: true,
            use_pty,
            timeout_ms,
            return_state: req.return_state,
        };

        self.gate.start_wait(req.ck.clone());
        let (pid, agent_pid) = match self.dial_cmdstart(proc, &req_id, &run_packet).await {
            Ok(started) => started,
            Err(e) => {
                self.gate.abandon_wait(&req.ck);
                return Err(e);
            }
        };

        // Step 8: persist the command row (skipped for an ephemeral run, whose output goes
        // to the caller's channels instead of the command log).
        let is_ephemeral = ephemeral.is_some();
        let cmd = CmdType {
            screen_id: req.screen_id.clone(),
            line_id: req.ck.cmd_id.clone(),
            raw_cmd: req.raw_cmd.clone(),
            remote: req.remote.clone(),
            fe_state: match &run_packet {
                Packet::Run { state, .. } => state.clone(),
                _ => unreachable!("just constructed as Packet::Run"),
            },
            state_ptr: ptr.clone(),
            status: if is_ephemeral {
                CmdStatus::Detached
            } else {
                CmdStatus::Running
            },
            pid,
            agent_pid,
            exit_code: 0,
            duration_ms: 0,
            rtn_state: req.return_state,
            done_ts: None,
        };

        if !is_ephemeral {
            if let Err(e) = self
                .store
                .create_cmd_pty_file(&req.screen_id, &cmd.line_id, DEFAULT_MAX_PTY_SIZE)
                .await
            {
                self.gate.abandon_wait(&req.ck);
                return Err(e.into());
            }
            if let Err(e) = self.store.create_cmd(cmd.clone()).await {
                self.gate.abandon_wait(&req.ck);
                return Err(e.into());
            }
            if let Err(e) = self
                .store
                .update_cmd_start_info(&req.screen_id, &cmd.line_id, pid, agent_pid)
                .await
            {
                warn!(target: "waveshell_run", "update_cmd_start_info failed for {:?}: {e}", req.ck);
            }
            if let Err(e) = self.store.increment_num_running_cmds(&req.screen_id, 1).await {
                warn!(target: "waveshell_run", "increment_num_running_cmds failed for {}: {e}", req.screen_id);
            }
        }

        // Step 9: register the command as running on the proc and hand back the release guard.
        let run_cmd = Arc::new(RunCmd {
            session_id: req.session_id.clone(),
            screen_id: req.screen_id.clone(),
            remote: req.remote.clone(),
            run_packet,
            ephemeral,
            canceled: Default::default(),
            line_num: req.line_num,
        });
        proc.insert_running_cmd(req.ck.clone(), run_cmd);

        debug!(target: "waveshell_run", "started {:?} pid={pid} agent_pid={agent_pid} ephemeral={is_ephemeral}", req.ck);
        self.updates.publish(Update::Cmd(cmd.clone()));

        Ok((
            cmd,
            ReleaseGuard {
                gate: self.gate.clone(),
                ck: req.ck.clone(),
            },
        ))
    }

    async fn dial_cmdstart(
        &self,
        proc: &Arc<waveshell_proc::WaveshellProc>,
        req_id: &str,
        run_packet: &Packet,
    ) -> Result<(i32, i32), RunError> {
        let transport = proc.transport()?;
        let mut mailbox = transport.register_rpc(req_id, RPC_CHANNEL_SIZE);
        transport.send_packet(run_packet).await?;

        match transport.wait_for_response(&mut mailbox, CMDSTART_TIMEOUT).await {
            Ok(Packet::CmdStart { pid, agent_pid, .. }) => Ok((pid, agent_pid)),
            Ok(Packet::Response { error: Some(err), .. }) => Err(RunError::AgentRejected(err)),
            Ok(_) => Err(RunError::UnexpectedResponse),
            Err(waveshell_transport::TransportError::Timeout(_)) => Err(RunError::CmdStartTimeout),
            Err(e) => Err(e.into()),
        }
    }
}

/// Expand a leading `~` (alone, or `~/...`) to `home`. Anything else passes through
/// unchanged, matching the shell's own tilde-expansion rule.
fn expand_tilde(path: &str, home: &str) -> String {
    if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        if home.is_empty() {
            path.to_string()
        } else {
            format!("{home}/{rest}")
        }
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use waveshell_proc::{ConnectMode, Remote, ShellPref, TransportConfig};
    use waveshell_pty::SecretCache;
    use waveshell_state::InjectOpts;
    use waveshell_updates::{MemoryStore, UserInputBus};

    #[test]
    fn expand_tilde_handles_bare_and_prefixed_forms() {
        assert_eq!(expand_tilde("~", "/home/user"), "/home/user");
        assert_eq!(expand_tilde("~/work", "/home/user"), "/home/user/work");
        assert_eq!(expand_tilde("/tmp", "/home/user"), "/tmp");
        assert_eq!(expand_tilde("~/work", ""), "~/work");
    }

    fn test_orchestrator() -> RunOrchestrator {
        let registry = Arc::new(RemoteRegistry::new(
            Arc::new(SecretCache::new(None)),
            Arc::new(UserInputBus::new()),
        ));
        RunOrchestrator::new(
            registry,
            Arc::new(MemoryStore::new()),
            Arc::new(UpdateBus::new()),
            Arc::new(StateStore::new()),
            Arc::new(CmdWaitGate::new()),
            InjectOpts::default(),
        )
    }

    fn base_request() -> RunRequest {
        RunRequest {
            session_id: "s1".into(),
            screen_id: "scr1".into(),
            remote: RemotePtr {
                remote_id: "r1".into(),
                owner_id: String::new(),
                name: "local".into(),
            },
            ck: CmdKey::new("scr1", "line1"),
            raw_cmd: "echo hi".into(),
            shell_type: "bash".into(),
            use_pty: false,
            timeout_ms: None,
            return_state: true,
            line_num: 1,
            ephemeral: None,
        }
    }

    #[tokio::test]
    async fn foreign_remote_is_rejected_before_any_lookup() {
        let orch = test_orchestrator();
        let mut req = base_request();
        req.remote.owner_id = "someone-else".into();
        let err = orch.run_command(req).await.unwrap_err();
        assert!(matches!(err, RunError::ForeignRemote { .. }));
    }

    #[tokio::test]
    async fn group_id_must_match_screen_id() {
        let orch = test_orchestrator();
        let mut req = base_request();
        req.ck = CmdKey::new("other-screen", "line1");
        let err = orch.run_command(req).await.unwrap_err();
        assert!(matches!(err, RunError::GroupScreenMismatch { .. }));
    }

    #[tokio::test]
    async fn unknown_remote_is_rejected() {
        let orch = test_orchestrator();
        let err = orch.run_command(base_request()).await.unwrap_err();
        assert!(matches!(err, RunError::RemoteNotFound(_)));
    }

    #[tokio::test]
    async fn disconnected_remote_is_rejected() {
        let orch = test_orchestrator();
        let remote = Remote {
            remote_id: "r1".into(),
            canonical_name: "local".into(),
            alias: None,
            transport: TransportConfig::Local {
                shell_path: "/bin/bash".into(),
                sudo: false,
            },
            connect_mode: ConnectMode::Manual,
            auto_install: false,
            archived: false,
            preferred_shell: ShellPref::Detect,
        };
        orch.registry.add_remote(remote).unwrap();
        let err = orch.run_command(base_request()).await.unwrap_err();
        assert!(matches!(err, RunError::NotConnected));
    }
}
