use crate::model::ShellState;

/// Env key prefixes/names stripped from any incoming state before storage, and
/// reinjected (with fresh values) on the way back out to the agent.
pub const ENV_VARS_TO_STRIP_PREFIXES: &[&str] = &["MSHELL", "WAVETERM", "TERM_PROGRAM"];
pub const ENV_VARS_TO_STRIP_EXACT: &[&str] = &["PROMPT", "PROMPT_VERSION", "TERM_SESSION_ID"];

fn is_stripped_key(key: &str) -> bool {
    ENV_VARS_TO_STRIP_EXACT.contains(&key)
        || ENV_VARS_TO_STRIP_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
}

/// Remove waveterm-internal env vars from `state`'s env map.
pub fn strip_env(mut state: ShellState) -> ShellState {
    state.env.retain(|k, _| !is_stripped_key(k));
    state.rehash();
    state
}

/// Options controlling which waveterm-identification vars get injected into a run.
#[derive(Debug, Clone)]
pub struct InjectOpts {
    pub waveterm_version: String,
    pub waveterm_dev: bool,
    pub default_lang: String,
}

impl Default for InjectOpts {
    fn default() -> Self {
        InjectOpts {
            waveterm_version: env!("CARGO_PKG_VERSION").to_string(),
            waveterm_dev: false,
            default_lang: "en_US.UTF-8".to_string(),
        }
    }
}

/// Inject the fixed set of waveterm-identification env vars into `state`, used right
/// before a run packet is sent to the agent. Existing `LANG` is preserved if already set.
pub fn inject_waveterm_vars(mut state: ShellState, opts: &InjectOpts) -> ShellState {
    state.env.insert("WAVETERM".to_string(), "1".to_string());
    state
        .env
        .insert("WAVETERM_VERSION".to_string(), opts.waveterm_version.clone());
    state
        .env
        .insert("TERM_PROGRAM".to_string(), "waveterm".to_string());
    if opts.waveterm_dev {
        state.env.insert("WAVETERM_DEV".to_string(), "1".to_string());
    }
    state
        .env
        .entry("LANG".to_string())
        .or_insert_with(|| opts.default_lang.clone());
    state.rehash();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShellType;
    use std::collections::BTreeMap;

    fn state_with_env(pairs: &[(&str, &str)]) -> ShellState {
        let mut env = BTreeMap::new();
        for (k, v) in pairs {
            env.insert(k.to_string(), v.to_string());
        }
        ShellState::new(ShellType::Bash, "/", env, BTreeMap::new(), BTreeMap::new())
    }

    #[test]
    fn strip_then_inject_restores_user_env_modulo_strip_set() {
        let original = state_with_env(&[("HOME", "/home/user"), ("PATH", "/usr/bin")]);
        let with_internal = {
            let mut s = original.clone();
            s.env.insert("WAVETERM".to_string(), "1".to_string());
            s.env.insert("PROMPT".to_string(), "x".to_string());
            s.rehash();
            s
        };
        let stripped = strip_env(with_internal);
        assert_eq!(stripped.env.get("HOME"), original.env.get("HOME"));
        assert_eq!(stripped.env.get("PATH"), original.env.get("PATH"));
        assert!(!stripped.env.contains_key("WAVETERM"));
        assert!(!stripped.env.contains_key("PROMPT"));
    }

    #[test]
    fn inject_sets_identification_vars() {
        let s = strip_env(state_with_env(&[]));
        let injected = inject_waveterm_vars(s, &InjectOpts::default());
        assert_eq!(injected.env.get("WAVETERM"), Some(&"1".to_string()));
        assert_eq!(injected.env.get("TERM_PROGRAM"), Some(&"waveterm".to_string()));
        assert!(injected.env.contains_key("LANG"));
    }
}
