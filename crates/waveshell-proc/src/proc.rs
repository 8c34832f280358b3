//! `WaveshellProc` (spec.md §4.4/§3): the per-remote state machine. Owns the dialed
//! transport and controlling pty, tracks connection/install status, the per-shell-type
//! state map, and the bookkeeping (running commands, pending-state reservations) that
//! `waveshell-run`'s orchestrator drives through it.
//!
//! Generalizes `slarti_ssh::AgentClient`'s dial-then-loop shape (check agent, deploy if
//! missing, hello, then serve requests) into a long-lived, reconnect-capable proc that
//! demultiplexes everything through [`waveshell_transport::ClientProc`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use portable_pty::CommandBuilder;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

use waveshell_proto::{CmdKey, Packet};
use waveshell_pty::{
    build_local_shell_command, build_ssh_command, encrypt_for_shell, ControllingPty, SecretCache,
    Snapshot,
};
use waveshell_state::{strip_env, ShellStatePtr};
use waveshell_transport::{ClientProc, TransportError, RPC_ITER_CHANNEL_SIZE};
use waveshell_updates::{UserInputBus, UserInputRequest, UserInputResponse, UserInputSlot};

use crate::cmd::RunCmd;
use crate::error::ProcError;
use crate::install;
use crate::pty_io;
use crate::remote::{ConnectMode, Remote, TransportConfig};
use crate::sink::CommandPacketSink;
use crate::state::{versions_compatible, InitInfo, ShellStateMap, CORE_PROTOCOL_VERSION};
use crate::status::{InstallStatus, Status};

/// Deadline for the ssh/local dial + `init` handshake, reset whenever the user types into
/// the connecting pty (spec.md §4.4).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for a `reinit` rpc-iter round trip.
pub const REINIT_TIMEOUT: Duration = Duration::from_secs(12);
/// Deadline waiting for a UI to answer a password/passphrase prompt.
pub const USER_INPUT_TIMEOUT: Duration = Duration::from_secs(60);
/// Auto-reconnect gives up after this many consecutive failures.
pub const MAX_AUTO_RETRIES: u32 = 5;

/// Parameters for one `launch` attempt, threaded through to a retry/auto-install redial.
#[derive(Debug, Clone)]
pub struct LaunchOpts {
    /// Where the core's own `waveshell-agent` binary lives on this machine: execed directly
    /// for a local remote, uploaded for an ssh remote that needs installing.
    pub local_agent_path: PathBuf,
    /// The artifact uploaded by the install subroutine; usually equal to `local_agent_path`.
    pub auto_install_artifact: PathBuf,
    pub waveterm_dev: bool,
}

struct Inner {
    status: Status,
    err: Option<String>,
    install_status: InstallStatus,
    install_err: Option<String>,
    needs_upgrade: bool,
    init_pk: Option<InitInfo>,
    shell_state_map: ShellStateMap,
    running_cmds: HashMap<CmdKey, Arc<RunCmd>>,
    pending_state_cmds: HashMap<(String, waveshell_updates::RemotePtr), CmdKey>,
    command_input_sinks: HashMap<CmdKey, mpsc::Sender<Vec<u8>>>,
    transport: Option<Arc<ClientProc>>,
    pty: Option<Arc<ControllingPty>>,
    connect_deadline: Option<Arc<StdMutex<Instant>>>,
    pending_password_slot: Option<UserInputSlot>,
    num_try_connect: u32,
    last_launch_opts: Option<LaunchOpts>,
    /// One slot per shell type with a `reinit` in flight. A racing caller for the same shell
    /// type subscribes here instead of issuing a second `ReInit` rpc (open question #2).
    reinit_inflight: HashMap<String, watch::Receiver<Option<Result<waveshell_state::ShellState, String>>>>,
}

/// Everything dial_and_handshake hands back to `launch` on success.
struct DialSuccess {
    init: InitInfo,
    transport: Arc<ClientProc>,
    pty: Arc<ControllingPty>,
    main_rx: mpsc::Receiver<Packet>,
}

pub struct WaveshellProc {
    pub remote: Remote,
    inner: StdMutex<Inner>,
    packet_sink: StdMutex<Option<Arc<dyn CommandPacketSink>>>,
    secret_cache: Arc<SecretCache>,
    user_input: Arc<UserInputBus>,
}

impl WaveshellProc {
    pub fn new(
        remote: Remote,
        secret_cache: Arc<SecretCache>,
        user_input: Arc<UserInputBus>,
    ) -> Arc<Self> {
        Arc::new(WaveshellProc {
            remote,
            inner: StdMutex::new(Inner {
                status: Status::Disconnected,
                err: None,
                install_status: InstallStatus::Disconnected,
                install_err: None,
                needs_upgrade: false,
                init_pk: None,
                shell_state_map: ShellStateMap::new(),
                running_cmds: HashMap::new(),
                pending_state_cmds: HashMap::new(),
                command_input_sinks: HashMap::new(),
                transport: None,
                pty: None,
                connect_deadline: None,
                pending_password_slot: None,
                num_try_connect: 0,
                last_launch_opts: None,
                reinit_inflight: HashMap::new(),
            }),
            packet_sink: StdMutex::new(None),
            secret_cache,
            user_input,
        })
    }

    pub fn remote_id(&self) -> &str {
        &self.remote.remote_id
    }

    pub fn set_packet_sink(&self, sink: Arc<dyn CommandPacketSink>) {
        *self.packet_sink.lock().unwrap() = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn CommandPacketSink>> {
        self.packet_sink.lock().unwrap().clone()
    }

    // -- status/getters -----------------------------------------------------

    pub fn status(&self) -> Status {
        self.inner.lock().unwrap().status
    }

    pub fn err(&self) -> Option<String> {
        self.inner.lock().unwrap().err.clone()
    }

    pub fn install_status(&self) -> InstallStatus {
        self.inner.lock().unwrap().install_status
    }

    pub fn install_err(&self) -> Option<String> {
        self.inner.lock().unwrap().install_err.clone()
    }

    pub fn needs_upgrade(&self) -> bool {
        self.inner.lock().unwrap().needs_upgrade
    }

    pub fn init_info(&self) -> Option<InitInfo> {
        self.inner.lock().unwrap().init_pk.clone()
    }

    pub fn current_state_ptr(&self, shell_type: &str) -> Option<ShellStatePtr> {
        self.inner.lock().unwrap().shell_state_map.get(shell_type).cloned()
    }

    pub fn set_current_state_ptr(&self, shell_type: &str, ptr: ShellStatePtr) {
        self.inner
            .lock()
            .unwrap()
            .shell_state_map
            .insert(shell_type.to_string(), ptr);
    }

    pub fn transport(&self) -> Result<Arc<ClientProc>, ProcError> {
        self.inner.lock().unwrap().transport.clone().ok_or(ProcError::NotConnected)
    }

    pub fn pty(&self) -> Option<Arc<ControllingPty>> {
        self.inner.lock().unwrap().pty.clone()
    }

    pub fn read_remote_pty(&self) -> Option<Snapshot> {
        self.pty().map(|p| p.log.snapshot())
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<(), ProcError> {
        Ok(self.transport()?.send_packet(packet).await?)
    }

    // -- running-command / pending-state bookkeeping -------------------------

    pub fn insert_running_cmd(&self, ck: CmdKey, cmd: Arc<RunCmd>) {
        self.inner.lock().unwrap().running_cmds.insert(ck, cmd);
    }

    pub fn remove_running_cmd(&self, ck: &CmdKey) -> Option<Arc<RunCmd>> {
        self.inner.lock().unwrap().running_cmds.remove(ck)
    }

    pub fn get_running_cmd(&self, ck: &CmdKey) -> Option<Arc<RunCmd>> {
        self.inner.lock().unwrap().running_cmds.get(ck).cloned()
    }

    pub fn running_cmd_count(&self) -> usize {
        self.inner.lock().unwrap().running_cmds.len()
    }

    /// Reserve the pending-state slot for `(screen_id, remote_ptr)` for a non-ephemeral,
    /// state-mutating command. Fails with the `CmdKey` already occupying it (spec.md
    /// invariant "at most one uncommitted state-changing command per screen+remote").
    pub fn reserve_pending_state(
        &self,
        screen_id: &str,
        remote_ptr: &waveshell_updates::RemotePtr,
        ck: CmdKey,
    ) -> Result<(), CmdKey> {
        let mut inner = self.inner.lock().unwrap();
        let key = (screen_id.to_string(), remote_ptr.clone());
        match inner.pending_state_cmds.get(&key) {
            Some(existing) => Err(existing.clone()),
            None => {
                inner.pending_state_cmds.insert(key, ck);
                Ok(())
            }
        }
    }

    /// Reserve the slot unconditionally, returning whatever `CmdKey` it preempted. Used for
    /// an ephemeral run, which is allowed to cancel-and-take-over an occupied slot
    /// (spec.md §4.5 step 4).
    pub fn reserve_pending_state_preempting(
        &self,
        screen_id: &str,
        remote_ptr: &waveshell_updates::RemotePtr,
        ck: CmdKey,
    ) -> Option<CmdKey> {
        let mut inner = self.inner.lock().unwrap();
        let key = (screen_id.to_string(), remote_ptr.clone());
        inner.pending_state_cmds.insert(key, ck)
    }

    pub fn release_pending_state(&self, screen_id: &str, remote_ptr: &waveshell_updates::RemotePtr) {
        self.inner
            .lock()
            .unwrap()
            .pending_state_cmds
            .remove(&(screen_id.to_string(), remote_ptr.clone()));
    }

    fn drain_running_cmds(&self) -> Vec<Arc<RunCmd>> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_state_cmds.clear();
        inner.command_input_sinks.clear();
        inner.running_cmds.drain().map(|(_, v)| v).collect()
    }

    pub fn register_command_input_sink(&self, ck: CmdKey, tx: mpsc::Sender<Vec<u8>>) {
        self.inner.lock().unwrap().command_input_sinks.insert(ck, tx);
    }

    pub fn remove_command_input_sink(&self, ck: &CmdKey) {
        self.inner.lock().unwrap().command_input_sinks.remove(ck);
    }

    /// Forward raw keystrokes typed into a running command's pty to its stdin sink.
    /// Returns `false` if no sink is registered for `ck` (command already finished).
    pub async fn forward_command_input(&self, ck: &CmdKey, bytes: Vec<u8>) -> bool {
        let tx = self.inner.lock().unwrap().command_input_sinks.get(ck).cloned();
        match tx {
            Some(tx) => tx.send(bytes).await.is_ok(),
            None => false,
        }
    }

    // -- status transitions ---------------------------------------------------

    fn set_status(&self, status: Status) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.status.can_transition_to(status) {
            warn!(target: "waveshell_proc", "illegal status transition {:?} -> {:?}", inner.status, status);
        }
        inner.status = status;
    }

    fn set_error(&self, err: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = Status::Error;
        inner.err = Some(err);
    }

    fn set_install_status(&self, status: InstallStatus) {
        self.inner.lock().unwrap().install_status = status;
    }

    // -- launch / disconnect ----------------------------------------------------

    /// Idempotent: a no-op if already connected or mid-connect. Refuses an archived remote.
    pub async fn launch(self: &Arc<Self>, opts: LaunchOpts) -> Result<(), ProcError> {
        {
            let inner = self.inner.lock().unwrap();
            if matches!(inner.status, Status::Connected | Status::Connecting) {
                return Ok(());
            }
        }
        if self.remote.archived {
            return Err(ProcError::Archived);
        }
        self.inner.lock().unwrap().last_launch_opts = Some(opts.clone());
        self.set_status(Status::Connecting);

        match self.dial_and_handshake(&opts).await {
            Ok(success) => {
                self.finish_connect(success);
                Ok(())
            }
            Err(ProcError::AgentNotFound) if self.remote.auto_install => {
                self.install_then_redial(&opts).await
            }
            Err(ProcError::VersionMismatch { agent, core }) if self.remote.auto_install => {
                warn!(target: "waveshell_proc", "agent {agent} incompatible with core {core}, attempting install");
                self.install_then_redial(&opts).await
            }
            Err(e) => {
                self.set_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn install_then_redial(self: &Arc<Self>, opts: &LaunchOpts) -> Result<(), ProcError> {
        self.set_install_status(InstallStatus::Connecting);
        let result = install::install_agent(
            &self.remote,
            &opts.auto_install_artifact,
            CORE_PROTOCOL_VERSION,
            Duration::from_secs(30),
        )
        .await;
        match result {
            Ok(_) => {
                self.set_install_status(InstallStatus::Disconnected);
                match self.dial_and_handshake(opts).await {
                    Ok(success) => {
                        self.finish_connect(success);
                        Ok(())
                    }
                    Err(e) => {
                        self.set_error(e.to_string());
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.set_install_status(InstallStatus::Error);
                self.inner.lock().unwrap().install_err = Some(e.to_string());
                self.set_error(e.to_string());
                Err(e)
            }
        }
    }

    fn finish_connect(self: &Arc<Self>, success: DialSuccess) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.status = Status::Connected;
            inner.err = None;
            inner.install_err = None;
            inner.needs_upgrade = false;
            inner.init_pk = Some(success.init);
            inner.shell_state_map.clear();
            inner.num_try_connect = 0;
            inner.transport = Some(success.transport);
            inner.pty = Some(success.pty);
        }
        self.spawn_process_packets(success.main_rx);
    }

    fn spawn_process_packets(self: &Arc<Self>, main_rx: mpsc::Receiver<Packet>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.process_packets_loop(main_rx).await;
        });
    }

    /// Refuses if connected with running commands, unless `force`.
    pub async fn disconnect(self: &Arc<Self>, force: bool) -> Result<(), ProcError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.status == Status::Connected && !force && !inner.running_cmds.is_empty() {
                return Err(ProcError::DisconnectRefused {
                    running: inner.running_cmds.len(),
                });
            }
        }
        self.teardown(Status::Disconnected).await;
        Ok(())
    }

    async fn teardown(self: &Arc<Self>, status: Status) {
        let (transport, pty) = {
            let mut inner = self.inner.lock().unwrap();
            inner.status = status;
            (inner.transport.take(), inner.pty.take())
        };
        if let Some(t) = transport {
            t.close(Duration::from_secs(5)).await;
        }
        if let Some(p) = pty {
            let _ = p.kill().await;
        }
        let hungup = self.drain_running_cmds();
        if !hungup.is_empty() {
            if let Some(sink) = self.sink() {
                sink.on_proc_disconnected(&self.remote.remote_id, hungup).await;
            }
        }
    }

    /// Reset the connect deadline, called whenever the user types into the connecting pty
    /// (spec.md §4.4: interactive input keeps a slow ssh login alive past 15s).
    pub async fn send_remote_input(&self, bytes: &[u8]) -> Result<(), ProcError> {
        if let Some(dl) = self.inner.lock().unwrap().connect_deadline.clone() {
            *dl.lock().unwrap() = Instant::now() + CONNECT_TIMEOUT;
        }
        let pty = self.pty().ok_or(ProcError::NotConnected)?;
        pty.write_input(bytes).await.map_err(ProcError::Anyhow)
    }

    // -- dialing --------------------------------------------------------------

    fn build_dial_command(&self, local_agent_path: &str) -> Result<CommandBuilder, ProcError> {
        let script = install::bootstrap_probe_script(local_agent_path);
        if let Some(target) = self.remote.ssh_target() {
            return Ok(build_ssh_command(&target, &script));
        }
        let shell_path = match &self.remote.transport {
            TransportConfig::Local { shell_path, .. } => shell_path.as_str(),
            TransportConfig::Ssh { .. } => unreachable!("ssh_target returned None above"),
        };
        let mut cmd = build_local_shell_command(shell_path).map_err(ProcError::Anyhow)?;
        if self.remote.is_local_sudo() {
            let mut sudo_cmd = CommandBuilder::new("sudo");
            sudo_cmd.args(["-S", shell_path, "-c", &script]);
            return Ok(sudo_cmd);
        }
        cmd.args(["-c", &script]);
        Ok(cmd)
    }

    async fn dial_and_handshake(self: &Arc<Self>, opts: &LaunchOpts) -> Result<DialSuccess, ProcError> {
        let local_agent_path = opts.local_agent_path.to_string_lossy().into_owned();
        let cmd = self.build_dial_command(&local_agent_path)?;

        let (output_tx, output_rx) = mpsc::channel(256);
        let pty = ControllingPty::spawn(cmd, output_tx)?;

        let (stdin, _stdin_task) = pty_io::pty_as_stdin(pty.clone());
        let (stdout, _stdout_task) = pty_io::pty_output_as_stdout(output_rx);
        let transport = ClientProc::new(stdin, stdout, true);
        let mut main_rx = transport.take_main_channel().expect("freshly built transport");

        transport.send_packet(&Packet::Ping).await?;

        let deadline = Arc::new(StdMutex::new(Instant::now() + CONNECT_TIMEOUT));
        self.inner.lock().unwrap().connect_deadline = Some(deadline.clone());

        let relay = self.spawn_password_relay(pty.clone());

        let handshake_result = match &relay {
            Some((_, error_slot, notify)) => {
                tokio::select! {
                    r = self.handshake_loop(&mut main_rx, deadline.clone()) => r,
                    _ = notify.notified() => Err(error_slot
                        .lock()
                        .unwrap()
                        .take()
                        .unwrap_or_else(|| ProcError::Handshake("password relay failed".into()))),
                }
            }
            None => self.handshake_loop(&mut main_rx, deadline.clone()).await,
        };

        if let Some((handle, _, _)) = relay {
            handle.abort();
        }
        self.inner.lock().unwrap().connect_deadline = None;

        match handshake_result {
            Ok(init) => Ok(DialSuccess { init, transport, pty, main_rx }),
            Err(e) => {
                transport.close(Duration::from_secs(2)).await;
                let _ = pty.kill().await;
                Err(e)
            }
        }
    }

    async fn handshake_loop(
        &self,
        main_rx: &mut mpsc::Receiver<Packet>,
        deadline: Arc<StdMutex<Instant>>,
    ) -> Result<InitInfo, ProcError> {
        loop {
            let remaining = {
                let dl = *deadline.lock().unwrap();
                dl.saturating_duration_since(Instant::now())
            };
            if remaining.is_zero() {
                return Err(ProcError::ConnectTimeout(CONNECT_TIMEOUT));
            }
            match tokio::time::timeout(remaining, main_rx.recv()).await {
                Ok(Some(Packet::Init { notfound: true, .. })) => return Err(ProcError::AgentNotFound),
                Ok(Some(Packet::Init {
                    notfound: false,
                    uname,
                    user,
                    homedir,
                    hostname,
                    shell,
                    version,
                })) => {
                    if !versions_compatible(&version, CORE_PROTOCOL_VERSION) {
                        return Err(ProcError::VersionMismatch {
                            agent: version,
                            core: CORE_PROTOCOL_VERSION.to_string(),
                        });
                    }
                    return Ok(InitInfo { uname, user, homedir, hostname, shell, version });
                }
                Ok(Some(_other)) => continue,
                Ok(None) => return Err(ProcError::Handshake("transport closed before init".into())),
                Err(_) => return Err(ProcError::ConnectTimeout(CONNECT_TIMEOUT)),
            }
        }
    }

    // -- interactive password relay (ssh/sudo login prompts on the raw pty) --------

    fn spawn_password_relay(
        self: &Arc<Self>,
        pty: Arc<ControllingPty>,
    ) -> Option<(tokio::task::JoinHandle<()>, Arc<StdMutex<Option<ProcError>>>, Arc<Notify>)> {
        // spec.md §4.4: the pty is attached to "the ssh/local child" — a local remote dialed
        // via `sudo -S` prints the same kind of password prompt an ssh login would, so the
        // relay must watch both, not just ssh targets.
        if self.remote.ssh_target().is_none() && !self.remote.is_local_sudo() {
            return None;
        }
        let error_slot = Arc::new(StdMutex::new(None));
        let notify = Arc::new(Notify::new());
        let this = self.clone();
        let slot = error_slot.clone();
        let ntf = notify.clone();
        let handle = tokio::spawn(async move {
            this.password_relay_loop(pty, slot, ntf).await;
        });
        Some((handle, error_slot, notify))
    }

    async fn password_relay_loop(
        self: Arc<Self>,
        pty: Arc<ControllingPty>,
        error_slot: Arc<StdMutex<Option<ProcError>>>,
        notify: Arc<Notify>,
    ) {
        let mut already_answered = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(150));
        loop {
            ticker.tick().await;
            if !pty.is_alive().await {
                return;
            }
            if !pty.last_line_is_prompt() {
                continue;
            }
            if already_answered {
                *error_slot.lock().unwrap() = Some(ProcError::SudoIncorrectPassword);
                notify.notify_one();
                return;
            }
            let is_passphrase = pty.log.last_line().contains("passphrase");
            let cached = self.secret_cache.get(&self.remote.remote_id).await;
            let password = match cached {
                Some(p) => p,
                None => match self.prompt_for_password(is_passphrase).await {
                    Ok(p) => p,
                    Err(e) => {
                        *error_slot.lock().unwrap() = Some(e);
                        notify.notify_one();
                        return;
                    }
                },
            };
            if pty.write_input(format!("{password}\r").as_bytes()).await.is_err() {
                return;
            }
            self.secret_cache.put(self.remote.remote_id.clone(), password).await;
            already_answered = true;
            // Give the agent a moment to move off the prompt line before polling resumes.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn prompt_for_password(&self, is_passphrase: bool) -> Result<String, ProcError> {
        let (slot, rx) = waveshell_updates::user_input_channel();
        self.inner.lock().unwrap().pending_password_slot = Some(slot);
        self.user_input.publish_request(UserInputRequest {
            remote_id: self.remote.remote_id.clone(),
            query: if is_passphrase {
                "Enter passphrase for key:".to_string()
            } else {
                "password:".to_string()
            },
            is_passphrase,
        });
        match tokio::time::timeout(USER_INPUT_TIMEOUT, rx).await {
            Ok(Ok(resp)) if !resp.timed_out => resp.text.ok_or(ProcError::PasswordPromptTimeout),
            _ => {
                self.inner.lock().unwrap().pending_password_slot = None;
                Err(ProcError::PasswordPromptTimeout)
            }
        }
    }

    /// Fulfil the single outstanding password/passphrase prompt, if any (called by whatever
    /// UI surface is subscribed to the [`UserInputBus`]).
    pub fn respond_user_input(&self, response: UserInputResponse) {
        if let Some(slot) = self.inner.lock().unwrap().pending_password_slot.take() {
            slot.respond(response);
        }
    }

    // -- reinit -----------------------------------------------------------------

    /// `ReInit` rpc-iter: ask the agent to snapshot its current state for `shell_type` and
    /// adopt it as the proc's new base pointer (spec.md §4.4/open question #2: a racing
    /// ReInit while one is already in flight is a benign no-op, enforced by the caller
    /// serializing reinit calls per shell type).
    /// Re-establish a fresh baseline [`ShellState`] for `shell_type`. A caller that races
    /// another in-flight `reinit` for the same shell type does not issue a second rpc: it
    /// subscribes to the first caller's result and returns that instead (open question #2).
    pub async fn reinit(&self, shell_type: &str) -> Result<waveshell_state::ShellState, ProcError> {
        let (tx, rx) = watch::channel(None);
        let existing = {
            let mut inner = self.inner.lock().unwrap();
            match inner.reinit_inflight.get(shell_type) {
                Some(existing) => Some(existing.clone()),
                None => {
                    inner.reinit_inflight.insert(shell_type.to_string(), rx);
                    None
                }
            }
        };
        if let Some(existing) = existing {
            return self.await_reinit_slot(existing).await;
        }

        let result = self.run_reinit_rpc(shell_type).await;
        let cached = result.as_ref().map(|s| s.clone()).map_err(|e| e.to_string());
        let _ = tx.send(Some(cached));
        self.inner.lock().unwrap().reinit_inflight.remove(shell_type);

        if let Ok(state) = &result {
            let ptr = ShellStatePtr::base(state.hash_val.clone());
            self.set_current_state_ptr(shell_type, ptr);
        }
        result
    }

    /// Await a slot another in-flight `reinit` call registered, returning its shared result.
    async fn await_reinit_slot(
        &self,
        mut rx: watch::Receiver<Option<Result<waveshell_state::ShellState, String>>>,
    ) -> Result<waveshell_state::ShellState, ProcError> {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result.map_err(ProcError::Handshake);
            }
            if rx.changed().await.is_err() {
                return Err(ProcError::Handshake("reinit slot closed before completing".into()));
            }
        }
    }

    async fn run_reinit_rpc(&self, shell_type: &str) -> Result<waveshell_state::ShellState, ProcError> {
        let transport = self.transport()?;
        let req_id = uuid::Uuid::new_v4().to_string();
        let mut mailbox = transport.register_rpc(req_id.clone(), RPC_ITER_CHANNEL_SIZE);
        transport
            .send_packet(&Packet::ReInit {
                req_id: req_id.clone(),
                shell_type: shell_type.to_string(),
            })
            .await?;
        loop {
            match tokio::time::timeout(REINIT_TIMEOUT, mailbox.next()).await {
                Ok(Some(Packet::ShellState { state, .. })) => {
                    return Ok(strip_env(state));
                }
                Ok(Some(Packet::Response { error: Some(e), .. })) => {
                    return Err(ProcError::Handshake(e));
                }
                Ok(Some(_other)) => continue,
                Ok(None) => return Err(ProcError::Transport(TransportError::Closed)),
                Err(_) => return Err(ProcError::Handshake("reinit timed out".into())),
            }
        }
    }

    // -- async packet processing --------------------------------------------------

    async fn process_packets_loop(self: Arc<Self>, mut main_rx: mpsc::Receiver<Packet>) {
        while let Some(packet) = main_rx.recv().await {
            self.handle_async_packet(packet).await;
        }
        self.on_transport_closed().await;
    }

    async fn handle_async_packet(&self, packet: Packet) {
        match &packet {
            Packet::Ping => {}
            Packet::Message { message, .. } => {
                debug!(target: "waveshell_proc", remote = %self.remote.remote_id, "agent message: {message}");
            }
            Packet::Raw { message } => {
                debug!(target: "waveshell_proc", remote = %self.remote.remote_id, "agent raw: {message}");
            }
            Packet::SudoRequest { .. } => self.handle_sudo_request(packet).await,
            Packet::Data { ck, .. } => {
                let ck = ck.clone();
                let (ack_len, error) = match self.sink() {
                    Some(sink) => match sink.on_data(&self.remote.remote_id, packet.clone()).await {
                        crate::sink::DataAckOutcome::Accepted { len } => (len, None),
                        crate::sink::DataAckOutcome::Rejected { error } => (0, Some(error)),
                    },
                    None => (0, Some("no command-packet sink registered".to_string())),
                };
                let _ = self.send_packet(&Packet::DataAck { ck, ack_len, error }).await;
            }
            Packet::CmdDone { .. } => {
                if let Some(sink) = self.sink() {
                    sink.on_cmd_done(&self.remote.remote_id, packet.clone()).await;
                }
            }
            Packet::CmdFinal { .. } => {
                if let Some(sink) = self.sink() {
                    sink.on_cmd_final(&self.remote.remote_id, packet.clone()).await;
                }
            }
            Packet::DataAck { .. } => {
                debug!(target: "waveshell_proc", "unexpected dataack from agent, ignoring");
            }
            Packet::CmdData { ck, buffered_bytes } => {
                debug!(target: "waveshell_proc", remote = %self.remote.remote_id, ?ck, buffered_bytes, "cmddata (informational only)");
                if let Some(pty) = self.inner.lock().unwrap().pty.clone() {
                    pty.log.write(format!("cmddata {ck:?} buffered={buffered_bytes}\n").as_bytes());
                }
                if let Some(sink) = self.sink() {
                    sink.on_informational(&self.remote.remote_id, packet.clone()).await;
                }
            }
            other => warn!(target: "waveshell_proc", "unexpected async packet: {other:?}"),
        }
    }

    async fn handle_sudo_request(&self, packet: Packet) {
        let Packet::SudoRequest { ck, shell_pub_key, sudo_status } = packet else {
            return;
        };
        if sudo_status == "failure" {
            self.secret_cache.evict(&self.remote.remote_id).await;
            warn!(target: "waveshell_proc", "sudo failure reported for {ck:?}");
            return;
        }
        let cached = if sudo_status == "first-attempt" {
            self.secret_cache.get(&self.remote.remote_id).await
        } else {
            None
        };
        let password = match cached {
            Some(p) => p,
            None => match self.prompt_for_password(false).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(target: "waveshell_proc", "sudo password prompt failed: {e}");
                    return;
                }
            },
        };
        match encrypt_for_shell(&shell_pub_key, &password) {
            Ok(payload) => {
                self.secret_cache.put(self.remote.remote_id.clone(), password).await;
                let _ = self
                    .send_packet(&Packet::SudoResponse {
                        ck,
                        encrypted_secret: payload.encrypted_secret,
                        srv_pub_key: payload.srv_pub_key,
                    })
                    .await;
            }
            Err(e) => warn!(target: "waveshell_proc", "sudo encrypt failed: {e}"),
        }
    }

    async fn on_transport_closed(self: Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.transport = None;
            inner.pty = None;
            inner.status = Status::Disconnected;
        }
        let hungup = self.drain_running_cmds();
        if let Some(sink) = self.sink() {
            sink.on_proc_disconnected(&self.remote.remote_id, hungup).await;
        }
        if matches!(self.remote.connect_mode, ConnectMode::Auto | ConnectMode::Startup) {
            self.try_auto_reconnect().await;
        }
    }

    async fn try_auto_reconnect(self: Arc<Self>) {
        let opts = {
            let mut inner = self.inner.lock().unwrap();
            if inner.num_try_connect >= MAX_AUTO_RETRIES {
                return;
            }
            inner.num_try_connect += 1;
            inner.last_launch_opts.clone()
        };
        if let Some(opts) = opts {
            let _ = self.launch(opts).await;
        }
    }
}
