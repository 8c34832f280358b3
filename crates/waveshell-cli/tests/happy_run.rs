//! Black-box end-to-end exercise of the full stack (registry → orchestrator → transport →
//! the real `waveshell-agent` binary) against spec.md §8's scenarios 1, 2, and 3: a happy
//! local run, a stateful run whose diff commits to the remote-instance pointer, and the
//! pending-state collision between two concurrent `return_state=true` runs.
//!
//! Grounded on `slarti-ssh`'s own demo-binary integration test (spawn the real agent, dial
//! it, run one sample command end to end) generalized to the full run-command protocol.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use uuid::Uuid;

use waveshell_proc::{ConnectMode, LaunchOpts, Remote, RemoteRegistry, ShellPref, TransportConfig};
use waveshell_pty::SecretCache;
use waveshell_run::{CmdWaitGate, RunOrchestrator, RunRequest, RunSink};
use waveshell_state::{InjectOpts, ShellState, ShellStatePtr, ShellType, StateStore};
use waveshell_updates::{CmdStatus, MemoryStore, RemotePtr, Store, Update, UpdateBus, UserInputBus};

struct Harness {
    proc: Arc<waveshell_proc::WaveshellProc>,
    orchestrator: RunOrchestrator,
    updates: Arc<UpdateBus>,
    store: Arc<dyn Store>,
    state_store: Arc<StateStore>,
    remote_ptr: RemotePtr,
    shell_type: ShellType,
}

async fn dial() -> Harness {
    let secret_cache = Arc::new(SecretCache::new(None));
    let user_input = Arc::new(UserInputBus::new());
    let registry = Arc::new(RemoteRegistry::new(secret_cache, user_input));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let updates = Arc::new(UpdateBus::new());
    let state_store = Arc::new(StateStore::new());
    let gate = Arc::new(CmdWaitGate::new());

    let remote = Remote {
        remote_id: Uuid::new_v4().to_string(),
        canonical_name: format!("test-{}", Uuid::new_v4()),
        alias: None,
        transport: TransportConfig::Local {
            shell_path: "/bin/bash".to_string(),
            sudo: false,
        },
        connect_mode: ConnectMode::Manual,
        auto_install: false,
        archived: false,
        preferred_shell: ShellPref::Detect,
    };
    let remote_ptr = RemotePtr {
        remote_id: remote.remote_id.clone(),
        owner_id: String::new(),
        name: remote.canonical_name.clone(),
    };

    let proc = registry.add_remote(remote).expect("add_remote");
    let agent_path = std::path::PathBuf::from(env!("CARGO_BIN_EXE_waveshell-agent"));
    proc.launch(LaunchOpts {
        local_agent_path: agent_path.clone(),
        auto_install_artifact: agent_path,
        waveterm_dev: false,
    })
    .await
    .expect("launch should dial the real agent binary");

    let init = proc.init_info().expect("connected proc has init info");
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
        .update_remote_state("s1", "scr1", &remote_ptr, base.clone(), Some(base), None)
        .await
        .expect("seed remote-instance state");
    proc.set_current_state_ptr(shell_type.as_str(), ptr);

    let sink = Arc::new(RunSink::new(
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

    Harness { proc, orchestrator, updates, store, state_store, remote_ptr, shell_type }
}

/// spec.md §8 scenario 1: "Happy local run" — `echo hi`, expect pty data `"hi\n"` then
/// `cmddone{exitCode:0}`, and the DB row transitions running -> done.
#[tokio::test]
async fn happy_local_run_echoes_and_completes() {
    let h = dial().await;
    let mut sub = h.updates.subscribe();

    let ck = waveshell_proto::CmdKey::new("scr1", Uuid::new_v4().to_string());
    let (cmd, release) = h
        .orchestrator
        .run_command(RunRequest {
            session_id: "s1".to_string(),
            screen_id: "scr1".to_string(),
            remote: h.remote_ptr.clone(),
            ck: ck.clone(),
            raw_cmd: "echo hi".to_string(),
            shell_type: h.shell_type.as_str().to_string(),
            use_pty: false,
            timeout_ms: None,
            return_state: false,
            line_num: 1,
            ephemeral: None,
        })
        .await
        .expect("run_command should succeed against the real agent");
    assert_eq!(cmd.status, CmdStatus::Running);
    release.release();

    let mut saw_output = String::new();
    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match sub.recv().await.expect("update bus open") {
                Update::PtyData { pty_data64, .. } => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(&pty_data64)
                        .unwrap();
                    saw_output.push_str(&String::from_utf8_lossy(&bytes));
                }
                Update::Cmd(c) if c.screen_id == cmd.screen_id && c.line_id == cmd.line_id => {
                    if matches!(c.status, CmdStatus::Done | CmdStatus::Hangup) {
                        return c;
                    }
                }
                _ => {}
            }
        }
    })
    .await
    .expect("command should finish within 10s");

    assert_eq!(done.status, CmdStatus::Done);
    assert_eq!(done.exit_code, 0);
    assert!(saw_output.contains("hi"), "expected \"hi\" in output, got {saw_output:?}");

    let row = h
        .store
        .get_cmd(&cmd.screen_id, &cmd.line_id)
        .await
        .unwrap()
        .expect("row persisted");
    assert_eq!(row.status, CmdStatus::Done);
}

/// spec.md §8 scenario 2: "State-preserving run" — after a stateful run that changes `cwd`
/// and exports a var, the committed remote-instance pointer resolves to a state reflecting
/// both changes.
#[tokio::test]
async fn state_preserving_run_commits_cwd_and_env_diff() {
    let h = dial().await;
    let mut sub = h.updates.subscribe();

    let ck = waveshell_proto::CmdKey::new("scr1", Uuid::new_v4().to_string());
    let (cmd, release) = h
        .orchestrator
        .run_command(RunRequest {
            session_id: "s1".to_string(),
            screen_id: "scr1".to_string(),
            remote: h.remote_ptr.clone(),
            ck: ck.clone(),
            raw_cmd: "cd /tmp; export X=1".to_string(),
            shell_type: h.shell_type.as_str().to_string(),
            use_pty: false,
            timeout_ms: None,
            return_state: true,
            line_num: 1,
            ephemeral: None,
        })
        .await
        .expect("run_command should succeed against the real agent");
    release.release();

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Update::Cmd(c) = sub.recv().await.expect("update bus open") {
                if c.screen_id == cmd.screen_id
                    && c.line_id == cmd.line_id
                    && matches!(c.status, CmdStatus::Done | CmdStatus::Hangup)
                {
                    return c;
                }
            }
        }
    })
    .await
    .expect("command should finish within 10s");
    assert_eq!(done.status, CmdStatus::Done);

    let ptr = h
        .store
        .get_remote_state_ptr("s1", "scr1", &h.remote_ptr)
        .await
        .unwrap()
        .expect("remote-instance state ptr committed after the stateful run");
    let resolved = h
        .state_store
        .resolve(&ptr)
        .expect("committed pointer's base/diff chain resolves through the state store");
    assert_eq!(resolved.cwd, "/tmp");
    assert_eq!(resolved.env.get("X"), Some(&"1".to_string()));
}

/// spec.md §8 scenario 3: two concurrent `return_state=true` runs against the same
/// screen+remote collide on the pending-state slot; exactly one succeeds.
#[tokio::test]
async fn pending_state_collision_rejects_second_stateful_run() {
    let h = dial().await;

    let ck_a = waveshell_proto::CmdKey::new("scr1", Uuid::new_v4().to_string());
    let req_a = RunRequest {
        session_id: "s1".to_string(),
        screen_id: "scr1".to_string(),
        remote: h.remote_ptr.clone(),
        ck: ck_a,
        raw_cmd: "sleep 1".to_string(),
        shell_type: h.shell_type.as_str().to_string(),
        use_pty: false,
        timeout_ms: None,
        return_state: true,
        line_num: 1,
        ephemeral: None,
    };
    let (cmd_a, release_a) = h.orchestrator.run_command(req_a).await.expect("first run starts");
    release_a.release();

    let ck_b = waveshell_proto::CmdKey::new("scr1", Uuid::new_v4().to_string());
    let req_b = RunRequest {
        session_id: "s1".to_string(),
        screen_id: "scr1".to_string(),
        remote: h.remote_ptr.clone(),
        ck: ck_b,
        raw_cmd: "echo collide".to_string(),
        shell_type: h.shell_type.as_str().to_string(),
        use_pty: false,
        timeout_ms: None,
        return_state: true,
        line_num: 2,
        ephemeral: None,
    };
    let err = h
        .orchestrator
        .run_command(req_b)
        .await
        .expect_err("second stateful run on the same screen+remote must be rejected");
    let msg = err.to_string();
    assert!(msg.contains("linenum=1"), "expected linenum=1 in error, got {msg:?}");
    assert_eq!(cmd_a.status, CmdStatus::Running);

    h.proc.disconnect(true).await.expect("force disconnect");
}
