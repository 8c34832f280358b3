use crate::model::{MapDiff, ShellState, ShellStateDiff};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("diff base_hash {diff_base} does not match state hash {state_hash}")]
    BaseMismatch {
        diff_base: String,
        state_hash: String,
    },
}

/// Apply `diff` on top of `base`, returning the resulting state with `hash_val` filled in.
///
/// Per spec: validates `diff.base_hash == base.hash_val`, removes before adding in each
/// of env/aliases/funcs, then overwrites cwd/shell_type if present.
pub fn apply_shell_state_diff(
    base: &ShellState,
    diff: &ShellStateDiff,
) -> Result<ShellState, DiffError> {
    if diff.base_hash != base.hash_val {
        return Err(DiffError::BaseMismatch {
            diff_base: diff.base_hash.clone(),
            state_hash: base.hash_val.clone(),
        });
    }

    let mut next = base.clone();
    apply_map_diff(&mut next.env, &diff.env);
    apply_map_diff(&mut next.aliases, &diff.aliases);
    apply_map_diff(&mut next.funcs, &diff.funcs);
    if let Some(cwd) = &diff.cwd {
        next.cwd = cwd.clone();
    }
    if let Some(shell_type) = &diff.shell_type {
        next.shell_type = shell_type.clone();
    }
    next.rehash();
    Ok(next)
}

fn apply_map_diff(field: &mut std::collections::BTreeMap<String, String>, d: &MapDiff) {
    for k in &d.to_remove {
        field.remove(k);
    }
    for (k, v) in &d.to_add {
        field.insert(k.clone(), v.clone());
    }
}

/// Compute the diff that turns `prev` into `curr`.
///
/// This is the inverse-enough of [`apply_shell_state_diff`]: applying the result to `prev`
/// reproduces `curr`'s hash. `hash_val` on the returned diff is set to `curr.hash_val` so a
/// diff can be self-identifying once it has been applied.
pub fn make_shell_state_diff(prev: &ShellState, curr: &ShellState) -> ShellStateDiff {
    ShellStateDiff {
        base_hash: prev.hash_val.clone(),
        prior_diff_hashes: Vec::new(),
        env: make_map_diff(&prev.env, &curr.env),
        aliases: make_map_diff(&prev.aliases, &curr.aliases),
        funcs: make_map_diff(&prev.funcs, &curr.funcs),
        cwd: if curr.cwd != prev.cwd {
            Some(curr.cwd.clone())
        } else {
            None
        },
        shell_type: if curr.shell_type != prev.shell_type {
            Some(curr.shell_type.clone())
        } else {
            None
        },
        hash_val: Some(curr.hash_val.clone()),
    }
}

fn make_map_diff(
    prev: &std::collections::BTreeMap<String, String>,
    curr: &std::collections::BTreeMap<String, String>,
) -> MapDiff {
    let mut to_add = std::collections::BTreeMap::new();
    let mut to_remove = Vec::new();
    for (k, v) in curr {
        if prev.get(k) != Some(v) {
            to_add.insert(k.clone(), v.clone());
        }
    }
    for k in prev.keys() {
        if !curr.contains_key(k) {
            to_remove.push(k.clone());
        }
    }
    MapDiff { to_add, to_remove }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShellType;
    use std::collections::BTreeMap;

    fn state(cwd: &str, env: &[(&str, &str)]) -> ShellState {
        let mut m = BTreeMap::new();
        for (k, v) in env {
            m.insert(k.to_string(), v.to_string());
        }
        ShellState::new(ShellType::Bash, cwd, m, BTreeMap::new(), BTreeMap::new())
    }

    #[test]
    fn round_trip_diff() {
        let prev = state("/home/user", &[("A", "1")]);
        let curr = state("/tmp", &[("A", "1"), ("B", "2")]);
        let diff = make_shell_state_diff(&prev, &curr);
        let applied = apply_shell_state_diff(&prev, &diff).unwrap();
        assert_eq!(applied.hash_val, curr.hash_val);
        assert_eq!(applied.cwd, "/tmp");
        assert_eq!(applied.env.get("B"), Some(&"2".to_string()));
    }

    #[test]
    fn base_mismatch_is_rejected() {
        let prev = state("/home/user", &[]);
        let mut other = prev.clone();
        other.cwd = "/somewhere-else".into();
        other.rehash();
        let diff = make_shell_state_diff(&prev, &other);
        let wrong_base = state("/not-prev", &[]);
        let err = apply_shell_state_diff(&wrong_base, &diff).unwrap_err();
        assert!(matches!(err, DiffError::BaseMismatch { .. }));
    }

    #[test]
    fn remove_wins_before_add_in_same_diff() {
        let prev = state("/x", &[("A", "old")]);
        let diff = ShellStateDiff {
            base_hash: prev.hash_val.clone(),
            prior_diff_hashes: vec![],
            env: MapDiff {
                to_add: [("A".to_string(), "new".to_string())].into_iter().collect(),
                to_remove: vec!["A".to_string()],
            },
            aliases: MapDiff::default(),
            funcs: MapDiff::default(),
            cwd: None,
            shell_type: None,
            hash_val: None,
        };
        let applied = apply_shell_state_diff(&prev, &diff).unwrap();
        // to_remove runs before to_add, so the add is what survives.
        assert_eq!(applied.env.get("A"), Some(&"new".to_string()));
    }
}
