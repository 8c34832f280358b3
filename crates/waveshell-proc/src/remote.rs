use serde::{Deserialize, Serialize};

/// How a remote is dialed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Local {
        /// Path to the local shell binary (bash/zsh/etc).
        shell_path: String,
        /// Run commands under `sudo` on this local shell.
        sudo: bool,
    },
    Ssh {
        host: String,
        port: u16,
        user: String,
        identity_file: Option<String>,
        password: Option<String>,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    Manual,
    Auto,
    Startup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellPref {
    Detect,
    Bash,
    Zsh,
}

/// A remote's static, persisted configuration (spec.md §3). Runtime state lives in
/// [`crate::proc::WaveshellProc`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub remote_id: String,
    pub canonical_name: String,
    pub alias: Option<String>,
    pub transport: TransportConfig,
    pub connect_mode: ConnectMode,
    pub auto_install: bool,
    pub archived: bool,
    pub preferred_shell: ShellPref,
}

impl Remote {
    pub fn is_local(&self) -> bool {
        matches!(self.transport, TransportConfig::Local { .. })
    }

    pub fn is_local_sudo(&self) -> bool {
        matches!(self.transport, TransportConfig::Local { sudo: true, .. })
    }

    /// The target string ssh needs (`user@host`), or `None` for a local remote.
    pub fn ssh_target(&self) -> Option<String> {
        match &self.transport {
            TransportConfig::Ssh { host, user, .. } => Some(format!("{user}@{host}")),
            TransportConfig::Local { .. } => None,
        }
    }
}
