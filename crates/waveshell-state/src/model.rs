use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Which shell a [`ShellState`] belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellType {
    Bash,
    Zsh,
    /// Reported by an agent whose shell we don't special-case.
    Other(String),
}

impl ShellType {
    pub fn as_str(&self) -> &str {
        match self {
            ShellType::Bash => "bash",
            ShellType::Zsh => "zsh",
            ShellType::Other(s) => s.as_str(),
        }
    }
}

/// A content-addressed shell environment: cwd, env vars, aliases, functions.
///
/// `hash_val` is authoritative and is always recomputed by [`ShellState::rehash`];
/// nothing may construct a `ShellState` with a stale hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellState {
    pub shell_type: ShellType,
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, String>,
    pub funcs: BTreeMap<String, String>,
    pub hash_val: String,
}

impl ShellState {
    /// Construct a new state and fill in its hash.
    pub fn new(
        shell_type: ShellType,
        cwd: impl Into<String>,
        env: BTreeMap<String, String>,
        aliases: BTreeMap<String, String>,
        funcs: BTreeMap<String, String>,
    ) -> Self {
        let mut s = ShellState {
            shell_type,
            cwd: cwd.into(),
            env,
            aliases,
            funcs,
            hash_val: String::new(),
        };
        s.rehash();
        s
    }

    /// Recompute `hash_val` from the canonical (sorted-map) byte encoding of this state.
    pub fn rehash(&mut self) {
        self.hash_val.clear();
        self.hash_val = self.compute_hash();
    }

    /// Hash this state's canonical bytes without mutating it.
    pub fn compute_hash(&self) -> String {
        // BTreeMap serializes keys in sorted order, so this JSON encoding is canonical.
        #[derive(Serialize)]
        struct Canonical<'a> {
            shell_type: &'a str,
            cwd: &'a str,
            env: &'a BTreeMap<String, String>,
            aliases: &'a BTreeMap<String, String>,
            funcs: &'a BTreeMap<String, String>,
        }
        let canon = Canonical {
            shell_type: self.shell_type.as_str(),
            cwd: &self.cwd,
            env: &self.env,
            aliases: &self.aliases,
            funcs: &self.funcs,
        };
        let bytes = serde_json::to_vec(&canon).expect("ShellState canonical encoding");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Approximate encoded size in bytes, used for the diff-vs-full-state threshold.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// A compressed reference to a [`ShellState`]: a base hash plus an ordered diff chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellStatePtr {
    pub base_hash: String,
    #[serde(default)]
    pub diff_hashes: Vec<String>,
}

impl ShellStatePtr {
    pub fn base(base_hash: impl Into<String>) -> Self {
        ShellStatePtr {
            base_hash: base_hash.into(),
            diff_hashes: Vec::new(),
        }
    }

    pub fn is_pure_base(&self) -> bool {
        self.diff_hashes.is_empty()
    }
}

/// Add/remove instructions for a string-keyed map field (env, aliases, funcs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDiff {
    #[serde(default)]
    pub to_add: BTreeMap<String, String>,
    #[serde(default)]
    pub to_remove: Vec<String>,
}

impl MapDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// A diff against a base state (or a prior diff in a chain).
///
/// `hash_val` is filled in by [`crate::diff::apply_diff`] once the diff has been
/// applied and is not meaningful before that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellStateDiff {
    pub base_hash: String,
    /// Hashes of diffs that must be applied, in order, before this one.
    #[serde(default)]
    pub prior_diff_hashes: Vec<String>,
    pub env: MapDiff,
    pub aliases: MapDiff,
    pub funcs: MapDiff,
    pub cwd: Option<String>,
    pub shell_type: Option<ShellType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hash_val: Option<String>,
}

impl ShellStateDiff {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
            && self.aliases.is_empty()
            && self.funcs.is_empty()
            && self.cwd.is_none()
            && self.shell_type.is_none()
    }
}
