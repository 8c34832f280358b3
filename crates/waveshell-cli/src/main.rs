//! Demo binary: dial one remote and run one command to completion, printing its output as
//! it streams in.
//!
//! Generalizes `slarti-ssh`'s thin `main.rs` (check agent presence, run agent, Hello
//! handshake, one sample command) into the full core stack: a [`RemoteRegistry`] dial, a
//! [`RunOrchestrator::run_command`] call, and an [`UpdateBus`] subscription in place of
//! `slarti-ssh`'s single blocking `read_response_line`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use uuid::Uuid;

use waveshell_proc::{
    ConnectMode, LaunchOpts, Remote, RemoteRegistry, ShellPref, TransportConfig,
};
use waveshell_pty::{SecretCache, DEFAULT_SECRET_TIMEOUT};
use waveshell_run::{CmdWaitGate, RunOrchestrator, RunRequest};
use waveshell_state::{InjectOpts, ShellState, ShellStatePtr, ShellType, StateStore};
use waveshell_updates::{MemoryStore, RemotePtr, Store, Update, UpdateBus, UserInputBus};

#[derive(Parser, Debug)]
#[command(about = "Dial a local remote and run one command against it")]
struct Args {
    /// Shell binary to dial (bash, zsh, ...).
    #[arg(long, default_value = "/bin/bash")]
    shell: String,
    /// Run the dialed shell under `sudo -S`.
    #[arg(long)]
    sudo: bool,
    /// Where this core's own waveshell-agent binary lives.
    #[arg(long, env = "WAVESHELL_AGENT_PATH")]
    agent: PathBuf,
    /// The command to run.
    #[arg(default_value = "echo hello from waveshell")]
    command: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let secret_cache = Arc::new(SecretCache::new(Some(DEFAULT_SECRET_TIMEOUT)));
    let user_input = Arc::new(UserInputBus::new());
    let registry = Arc::new(RemoteRegistry::new(secret_cache, user_input));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let updates = Arc::new(UpdateBus::new());
    let state_store = Arc::new(StateStore::new());
    let gate = Arc::new(CmdWaitGate::new());

    let remote = Remote {
        remote_id: Uuid::new_v4().to_string(),
        canonical_name: "cli".to_string(),
        alias: None,
        transport: TransportConfig::Local {
            shell_path: args.shell.clone(),
            sudo: args.sudo,
        },
        connect_mode: ConnectMode::Manual,
        auto_install: true,
        archived: false,
        preferred_shell: ShellPref::Detect,
    };
    let remote_ptr = RemotePtr {
        remote_id: remote.remote_id.clone(),
        owner_id: String::new(),
        name: remote.canonical_name.clone(),
    };

    // 1) Dial the remote, auto-installing our own agent binary if the bootstrap probe
    //    reports it missing or incompatible.
    let proc = registry.add_remote(remote)?;
    println!("dialing {} ({})...", proc.remote_id(), args.shell);
    proc.launch(LaunchOpts {
        local_agent_path: args.agent.clone(),
        auto_install_artifact: args.agent,
        waveterm_dev: false,
    })
    .await
    .context("launch failed")?;
    let init = proc.init_info().context("connected proc has no init info")?;
    println!(
        "connected: user={} host={} shell={} agent={}",
        init.user, init.hostname, init.shell, init.version
    );

    // 2) Seed the one piece of state this demo needs: an empty shell at the agent's home
    //    directory, registered in both the orchestrator's stores (spec.md §4.5 step 3/5).
    let shell_type = if init.shell.contains("zsh") {
        ShellType::Zsh
    } else {
        ShellType::Bash
    };
    let base = ShellState::new(
        shell_type.clone(),
        init.homedir.clone(),
        Default::default(),
        Default::default(),
        Default::default(),
    );
    let ptr = ShellStatePtr::base(base.hash_val.clone());
    state_store.store_base(base.clone());
    store
        .update_remote_state("s1", "scr1", &remote_ptr, base, None, None)
        .await?;
    proc.set_current_state_ptr(shell_type.as_str(), ptr);

    let sink = Arc::new(waveshell_run::RunSink::new(
        registry.clone(),
        store.clone(),
        updates.clone(),
        state_store.clone(),
        gate.clone(),
    ));
    proc.set_packet_sink(sink);

    let orchestrator = RunOrchestrator::new(
        registry.clone(),
        store.clone(),
        updates.clone(),
        state_store.clone(),
        gate.clone(),
        InjectOpts::default(),
    );

    // 3) Run the command and print pty output as it streams in on the update bus.
    let mut sub = updates.subscribe();
    let ck = waveshell_proto::CmdKey::new("scr1", Uuid::new_v4().to_string());
    let (cmd, release) = orchestrator
        .run_command(RunRequest {
            session_id: "s1".to_string(),
            screen_id: "scr1".to_string(),
            remote: remote_ptr,
            ck: ck.clone(),
            raw_cmd: args.command,
            shell_type: shell_type.as_str().to_string(),
            use_pty: false,
            timeout_ms: None,
            return_state: true,
            line_num: 1,
            ephemeral: None,
        })
        .await?;
    release.release();
    println!("started pid={} agent_pid={}", cmd.pid, cmd.agent_pid);

    loop {
        match sub.recv().await {
            Ok(Update::PtyData { pty_data64, .. }) => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD.decode(&pty_data64)?;
                print!("{}", String::from_utf8_lossy(&bytes));
            }
            Ok(Update::Cmd(c)) if c.screen_id == cmd.screen_id && c.line_id == cmd.line_id => {
                if matches!(c.status, waveshell_updates::CmdStatus::Done | waveshell_updates::CmdStatus::Hangup) {
                    println!("exit_code={}", c.exit_code);
                    break;
                }
            }
            Ok(_) => {}
            Err(_) => bail!("update bus closed before the command finished"),
        }
    }

    Ok(())
}
