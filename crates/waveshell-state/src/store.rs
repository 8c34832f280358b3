use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::diff::{apply_shell_state_diff, DiffError};
use crate::model::{ShellState, ShellStateDiff, ShellStatePtr};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown state base hash: {0}")]
    UnknownBase(String),
    #[error("unknown state diff hash: {0}")]
    UnknownDiff(String),
    #[error(transparent)]
    Diff(#[from] DiffError),
}

/// Content-addressed store of [`ShellState`] bases and [`ShellStateDiff`]s.
///
/// `resolve` walks a [`ShellStatePtr`]'s diff chain in order; a pointer with an empty
/// `diff_hashes` resolves straight to its base.
pub struct StateStore {
    bases: Mutex<HashMap<String, ShellState>>,
    diffs: Mutex<HashMap<String, ShellStateDiff>>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore {
            bases: Mutex::new(HashMap::new()),
            diffs: Mutex::new(HashMap::new()),
        }
    }

    /// Persist `state` under its hash. No-op if already present.
    pub fn store_base(&self, state: ShellState) {
        self.bases
            .lock()
            .unwrap()
            .entry(state.hash_val.clone())
            .or_insert(state);
    }

    /// Persist a diff under the hash it was stamped with by `make_shell_state_diff` + apply.
    pub fn store_diff(&self, hash: String, diff: ShellStateDiff) {
        self.diffs.lock().unwrap().entry(hash).or_insert(diff);
    }

    pub fn get_base(&self, hash: &str) -> Option<ShellState> {
        self.bases.lock().unwrap().get(hash).cloned()
    }

    /// Resolve a pointer to its full state by replaying base + diff chain in order.
    pub fn resolve(&self, ptr: &ShellStatePtr) -> Result<ShellState, StoreError> {
        let base = self
            .get_base(&ptr.base_hash)
            .ok_or_else(|| StoreError::UnknownBase(ptr.base_hash.clone()))?;
        if ptr.diff_hashes.is_empty() {
            return Ok(base);
        }
        let mut state = base;
        for dh in &ptr.diff_hashes {
            let diff = self
                .diffs
                .lock()
                .unwrap()
                .get(dh)
                .cloned()
                .ok_or_else(|| StoreError::UnknownDiff(dh.clone()))?;
            state = apply_shell_state_diff(&state, &diff)?;
        }
        Ok(state)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::make_shell_state_diff;
    use crate::model::ShellType;
    use std::collections::BTreeMap;

    #[test]
    fn resolve_pure_base() {
        let store = StateStore::new();
        let s = ShellState::new(ShellType::Bash, "/", BTreeMap::new(), BTreeMap::new(), BTreeMap::new());
        store.store_base(s.clone());
        let resolved = store.resolve(&ShellStatePtr::base(s.hash_val.clone())).unwrap();
        assert_eq!(resolved, s);
    }

    #[test]
    fn resolve_with_diff_chain() {
        let store = StateStore::new();
        let base = ShellState::new(ShellType::Bash, "/a", BTreeMap::new(), BTreeMap::new(), BTreeMap::new());
        store.store_base(base.clone());

        let mut env1 = BTreeMap::new();
        env1.insert("X".to_string(), "1".to_string());
        let mid = ShellState::new(ShellType::Bash, "/b", env1, BTreeMap::new(), BTreeMap::new());
        let d1 = make_shell_state_diff(&base, &mid);
        store.store_diff(mid.hash_val.clone(), d1);

        let ptr = ShellStatePtr {
            base_hash: base.hash_val.clone(),
            diff_hashes: vec![mid.hash_val.clone()],
        };
        let resolved = store.resolve(&ptr).unwrap();
        assert_eq!(resolved.cwd, "/b");
        assert_eq!(resolved.env.get("X"), Some(&"1".to_string()));
    }

    #[test]
    fn unknown_base_is_an_error() {
        let store = StateStore::new();
        let err = store.resolve(&ShellStatePtr::base("deadbeef")).unwrap_err();
        assert!(matches!(err, StoreError::UnknownBase(_)));
    }
}
