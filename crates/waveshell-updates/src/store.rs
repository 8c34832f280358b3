use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use waveshell_state::{ShellState, ShellStateDiff, ShellStatePtr};

use crate::model::{ClientData, CmdType, RemoteInstance, RemotePtr, ScreenType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote instance not found for screen={screen_id} remote={remote_id}")]
    RemoteInstanceNotFound { screen_id: String, remote_id: String },
    #[error("command not found: screen={screen_id} line={line_id}")]
    CmdNotFound { screen_id: String, line_id: String },
    #[error("state base not found: {0}")]
    StateBaseNotFound(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// The persistence boundary the core consumes (spec.md §6). Implementations own schemas;
/// the core's only contracts are the pointer shape and the method signatures below.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ensure_client_data(&self) -> Result<ClientData, StoreError>;

    async fn get_all_remotes(&self) -> Result<Vec<RemotePtr>, StoreError>;
    async fn upsert_remote(&self, remote: RemotePtr) -> Result<(), StoreError>;

    async fn get_remote_state_ptr(
        &self,
        session_id: &str,
        screen_id: &str,
        remote: &RemotePtr,
    ) -> Result<Option<ShellStatePtr>, StoreError>;

    async fn update_remote_state(
        &self,
        session_id: &str,
        screen_id: &str,
        remote: &RemotePtr,
        fe_state: ShellState,
        full_state: Option<ShellState>,
        diff: Option<ShellStateDiff>,
    ) -> Result<RemoteInstance, StoreError>;

    async fn get_state_base(&self, hash: &str) -> Result<Option<ShellState>, StoreError>;
    async fn store_state_base(&self, state: ShellState) -> Result<(), StoreError>;
    async fn get_full_state(&self, ptr: &ShellStatePtr) -> Result<ShellState, StoreError>;

    async fn create_cmd(&self, cmd: CmdType) -> Result<(), StoreError>;
    async fn get_cmd(&self, screen_id: &str, line_id: &str) -> Result<Option<CmdType>, StoreError>;
    async fn update_cmd_start_info(
        &self,
        screen_id: &str,
        line_id: &str,
        pid: i32,
        agent_pid: i32,
    ) -> Result<(), StoreError>;
    async fn update_cmd_done_info(
        &self,
        screen_id: &str,
        line_id: &str,
        exit_code: i32,
        duration_ms: u64,
        done_ts: u64,
    ) -> Result<(), StoreError>;
    async fn hangup_cmd(&self, screen_id: &str, line_id: &str, done_ts: u64) -> Result<(), StoreError>;
    async fn hangup_running_cmds_by_remote(&self, remote_id: &str, done_ts: u64) -> Result<Vec<CmdType>, StoreError>;

    async fn get_screen(&self, screen_id: &str) -> Result<Option<ScreenType>, StoreError>;
    async fn set_status_indicator_level(&self, screen_id: &str, level: u32) -> Result<(), StoreError>;
    async fn increment_num_running_cmds(&self, screen_id: &str, delta: i32) -> Result<(), StoreError>;

    /// Preallocate the persistent pty-out blob for a non-ephemeral command, sized to
    /// `max_size` bytes (spec.md §4.5 step 8, default 1 MiB per `termOpts.maxPtySize`).
    async fn create_cmd_pty_file(
        &self,
        screen_id: &str,
        line_id: &str,
        max_size: u64,
    ) -> Result<(), StoreError>;

    /// Append a chunk of command output at `pos`, returning the [`crate::model::Update::PtyData`]
    /// update the caller should publish (spec.md §4.6 "data" handling).
    async fn append_to_cmd_pty_blob(
        &self,
        screen_id: &str,
        line_id: &str,
        data: &[u8],
        pos: u64,
    ) -> Result<crate::model::Update, StoreError>;
}

/// In-memory [`Store`] used by the test suite and the `waveshell-cli` demo binary.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    client_data: Option<ClientData>,
    remotes: HashMap<String, RemotePtr>,
    remote_instances: HashMap<(String, String, String), RemoteInstance>,
    state_bases: HashMap<String, ShellState>,
    cmds: HashMap<(String, String), CmdType>,
    screens: HashMap<String, ScreenType>,
    pty_blobs: HashMap<(String, String), (Vec<u8>, u64)>,
}

fn instance_key(session_id: &str, screen_id: &str, remote: &RemotePtr) -> (String, String, String) {
    (session_id.to_string(), screen_id.to_string(), remote.remote_id.clone())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_client_data(&self) -> Result<ClientData, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.client_data.is_none() {
            inner.client_data = Some(ClientData {
                client_id: uuid::Uuid::new_v4().to_string(),
                hide_shell_prompt: false,
            });
        }
        Ok(inner.client_data.clone().unwrap())
    }

    async fn get_all_remotes(&self) -> Result<Vec<RemotePtr>, StoreError> {
        Ok(self.inner.lock().await.remotes.values().cloned().collect())
    }

    async fn upsert_remote(&self, remote: RemotePtr) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .remotes
            .insert(remote.remote_id.clone(), remote);
        Ok(())
    }

    async fn get_remote_state_ptr(
        &self,
        session_id: &str,
        screen_id: &str,
        remote: &RemotePtr,
    ) -> Result<Option<ShellStatePtr>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .remote_instances
            .get(&instance_key(session_id, screen_id, remote))
            .map(|ri| ri.state_ptr.clone()))
    }

    async fn update_remote_state(
        &self,
        session_id: &str,
        screen_id: &str,
        remote: &RemotePtr,
        fe_state: ShellState,
        full_state: Option<ShellState>,
        diff: Option<ShellStateDiff>,
    ) -> Result<RemoteInstance, StoreError> {
        let mut inner = self.inner.lock().await;

        let state_ptr = if let Some(full) = full_state {
            let hash = full.hash_val.clone();
            inner.state_bases.insert(hash.clone(), full);
            ShellStatePtr::base(hash)
        } else if let Some(diff) = diff {
            let prev_ptr = inner
                .remote_instances
                .get(&instance_key(session_id, screen_id, remote))
                .map(|ri| ri.state_ptr.clone())
                .ok_or_else(|| StoreError::RemoteInstanceNotFound {
                    screen_id: screen_id.to_string(),
                    remote_id: remote.remote_id.clone(),
                })?;
            let diff_hash = diff
                .hash_val
                .clone()
                .ok_or_else(|| StoreError::WriteFailed("diff missing hash_val".into()))?;
            let mut diff_hashes = prev_ptr.diff_hashes.clone();
            diff_hashes.push(diff_hash);
            ShellStatePtr {
                base_hash: prev_ptr.base_hash,
                diff_hashes,
            }
        } else {
            return Err(StoreError::WriteFailed(
                "update_remote_state requires either full_state or diff".into(),
            ));
        };

        let instance = RemoteInstance {
            session_id: session_id.to_string(),
            screen_id: screen_id.to_string(),
            remote: remote.clone(),
            fe_state,
            state_ptr,
        };
        inner
            .remote_instances
            .insert(instance_key(session_id, screen_id, remote), instance.clone());
        Ok(instance)
    }

    async fn get_state_base(&self, hash: &str) -> Result<Option<ShellState>, StoreError> {
        Ok(self.inner.lock().await.state_bases.get(hash).cloned())
    }

    async fn store_state_base(&self, state: ShellState) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .state_bases
            .insert(state.hash_val.clone(), state);
        Ok(())
    }

    async fn get_full_state(&self, ptr: &ShellStatePtr) -> Result<ShellState, StoreError> {
        // This in-memory store doesn't hold diffs independently of the merged instance, so
        // pure-base pointers resolve directly; anything else is the caller's job via
        // `waveshell_state::StateStore`, which owns diff application.
        self.inner
            .lock()
            .await
            .state_bases
            .get(&ptr.base_hash)
            .cloned()
            .ok_or_else(|| StoreError::StateBaseNotFound(ptr.base_hash.clone()))
    }

    async fn create_cmd(&self, cmd: CmdType) -> Result<(), StoreError> {
        let key = (cmd.screen_id.clone(), cmd.line_id.clone());
        self.inner.lock().await.cmds.insert(key, cmd);
        Ok(())
    }

    async fn get_cmd(&self, screen_id: &str, line_id: &str) -> Result<Option<CmdType>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .cmds
            .get(&(screen_id.to_string(), line_id.to_string()))
            .cloned())
    }

    async fn update_cmd_start_info(
        &self,
        screen_id: &str,
        line_id: &str,
        pid: i32,
        agent_pid: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (screen_id.to_string(), line_id.to_string());
        let cmd = inner
            .cmds
            .get_mut(&key)
            .ok_or_else(|| StoreError::CmdNotFound {
                screen_id: screen_id.to_string(),
                line_id: line_id.to_string(),
            })?;
        cmd.pid = pid;
        cmd.agent_pid = agent_pid;
        Ok(())
    }

    async fn update_cmd_done_info(
        &self,
        screen_id: &str,
        line_id: &str,
        exit_code: i32,
        duration_ms: u64,
        done_ts: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (screen_id.to_string(), line_id.to_string());
        let cmd = inner
            .cmds
            .get_mut(&key)
            .ok_or_else(|| StoreError::CmdNotFound {
                screen_id: screen_id.to_string(),
                line_id: line_id.to_string(),
            })?;
        cmd.exit_code = exit_code;
        cmd.duration_ms = duration_ms;
        cmd.done_ts = Some(done_ts);
        cmd.status = crate::model::CmdStatus::Done;
        Ok(())
    }

    async fn hangup_cmd(&self, screen_id: &str, line_id: &str, done_ts: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (screen_id.to_string(), line_id.to_string());
        let cmd = inner
            .cmds
            .get_mut(&key)
            .ok_or_else(|| StoreError::CmdNotFound {
                screen_id: screen_id.to_string(),
                line_id: line_id.to_string(),
            })?;
        cmd.status = crate::model::CmdStatus::Hangup;
        cmd.done_ts = Some(done_ts);
        Ok(())
    }

    async fn hangup_running_cmds_by_remote(
        &self,
        remote_id: &str,
        done_ts: u64,
    ) -> Result<Vec<CmdType>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut hungup = Vec::new();
        for cmd in inner.cmds.values_mut() {
            if cmd.remote.remote_id == remote_id && cmd.status == crate::model::CmdStatus::Running {
                cmd.status = crate::model::CmdStatus::Hangup;
                cmd.done_ts = Some(done_ts);
                hungup.push(cmd.clone());
            }
        }
        Ok(hungup)
    }

    async fn get_screen(&self, screen_id: &str) -> Result<Option<ScreenType>, StoreError> {
        Ok(self.inner.lock().await.screens.get(screen_id).cloned())
    }

    async fn set_status_indicator_level(&self, screen_id: &str, level: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let screen = inner
            .screens
            .entry(screen_id.to_string())
            .or_insert_with(|| ScreenType {
                screen_id: screen_id.to_string(),
                session_id: String::new(),
                status_indicator_level: 0,
                num_running_cmds: 0,
            });
        screen.status_indicator_level = level;
        Ok(())
    }

    async fn increment_num_running_cmds(&self, screen_id: &str, delta: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let screen = inner
            .screens
            .entry(screen_id.to_string())
            .or_insert_with(|| ScreenType {
                screen_id: screen_id.to_string(),
                session_id: String::new(),
                status_indicator_level: 0,
                num_running_cmds: 0,
            });
        screen.num_running_cmds = (screen.num_running_cmds as i32 + delta).max(0) as u32;
        Ok(())
    }

    async fn create_cmd_pty_file(
        &self,
        screen_id: &str,
        line_id: &str,
        _max_size: u64,
    ) -> Result<(), StoreError> {
        let key = (screen_id.to_string(), line_id.to_string());
        self.inner.lock().await.pty_blobs.entry(key).or_insert((Vec::new(), 0));
        Ok(())
    }

    async fn append_to_cmd_pty_blob(
        &self,
        screen_id: &str,
        line_id: &str,
        data: &[u8],
        pos: u64,
    ) -> Result<crate::model::Update, StoreError> {
        let key = (screen_id.to_string(), line_id.to_string());
        let mut inner = self.inner.lock().await;
        let cmd = inner.cmds.get(&key).ok_or_else(|| StoreError::CmdNotFound {
            screen_id: screen_id.to_string(),
            line_id: line_id.to_string(),
        })?;
        let remote_id = cmd.remote.remote_id.clone();
        let blob = inner.pty_blobs.entry(key).or_insert((Vec::new(), 0));
        let end = (pos as usize) + data.len();
        if blob.0.len() < end {
            blob.0.resize(end, 0);
        }
        blob.0[pos as usize..end].copy_from_slice(data);
        blob.1 = blob.1.max(end as u64);
        Ok(crate::model::Update::PtyData {
            remote_id,
            pty_pos: pos,
            pty_data64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, data),
            pty_data_len: data.len(),
        })
    }
}
