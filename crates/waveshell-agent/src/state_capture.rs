//! Turns a [`ShellState`] into shell source text ahead of a command, and turns a probe
//! directory written by that source back into a fresh [`ShellState`] afterward.
//!
//! The core hands the agent a *complete* state on every `Run` packet instead of the agent
//! tracking a persistent shell child, so state capture here is a one-shot script: set up
//! aliases/functions as shell statements (env and cwd are applied directly on the spawned
//! command instead), run the command, then dump `pwd`/`env -0`/`alias -p`/`declare -f` to
//! files for the agent to read back.

use std::collections::BTreeMap;
use std::path::Path;

use waveshell_state::{ShellState, ShellType};

/// Single-quote `s` for safe embedding in a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

fn supports_aliases_and_funcs(shell_type: &ShellType) -> bool {
    matches!(shell_type, ShellType::Bash | ShellType::Zsh)
}

/// The interpreter to invoke for `shell_type`, passed as `argv[0]` to `-c`.
pub fn interpreter_for(shell_type: &ShellType) -> &str {
    match shell_type {
        ShellType::Bash => "bash",
        ShellType::Zsh => "zsh",
        ShellType::Other(s) if !s.is_empty() => s.as_str(),
        ShellType::Other(_) => "sh",
    }
}

/// Shell statements that (re)establish `state`'s aliases and functions.
pub fn preamble_script(state: &ShellState) -> String {
    let mut script = String::new();
    if supports_aliases_and_funcs(&state.shell_type) {
        for (name, value) in &state.aliases {
            script.push_str(&format!("alias {}={}\n", name, shell_quote(value)));
        }
        for body in state.funcs.values() {
            script.push_str(body);
            script.push('\n');
        }
    }
    script
}

/// Shell statements that dump cwd/env/aliases/funcs into `probe_dir` after the command ran.
pub fn probe_script(probe_dir: &Path, shell_type: &ShellType) -> String {
    let dir = shell_quote(&probe_dir.display().to_string());
    let mut script = format!("pwd > {dir}/cwd\nenv -0 > {dir}/env\n");
    if supports_aliases_and_funcs(shell_type) {
        script.push_str(&format!(
            "alias -p > {dir}/aliases 2>/dev/null\ndeclare -f > {dir}/funcs 2>/dev/null\n"
        ));
    }
    script
}

/// Read back a probe directory into a fresh [`ShellState`].
pub fn read_probe(probe_dir: &Path, shell_type: ShellType) -> std::io::Result<ShellState> {
    let cwd = std::fs::read_to_string(probe_dir.join("cwd"))?
        .trim()
        .to_string();
    let env = parse_env_dump(&std::fs::read(probe_dir.join("env"))?);
    let aliases = std::fs::read_to_string(probe_dir.join("aliases"))
        .map(|s| parse_alias_dump(&s))
        .unwrap_or_default();
    let funcs = std::fs::read_to_string(probe_dir.join("funcs"))
        .map(|s| parse_func_dump(&s))
        .unwrap_or_default();
    Ok(ShellState::new(shell_type, cwd, env, aliases, funcs))
}

/// Parse `env -0`'s NUL-separated `KEY=VALUE` records.
fn parse_env_dump(raw: &[u8]) -> BTreeMap<String, String> {
    raw.split(|&b| b == 0)
        .filter(|rec| !rec.is_empty())
        .filter_map(|rec| {
            let s = String::from_utf8_lossy(rec);
            s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Parse `alias -p` output: lines of `alias name='value'`.
fn parse_alias_dump(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let Some(rest) = line.strip_prefix("alias ") else {
            continue;
        };
        let Some((name, quoted)) = rest.split_once('=') else {
            continue;
        };
        out.insert(name.to_string(), unquote_single(quoted));
    }
    out
}

fn unquote_single(s: &str) -> String {
    let s = s.strip_prefix('\'').unwrap_or(s);
    let s = s.strip_suffix('\'').unwrap_or(s);
    s.replace("'\\''", "'")
}

/// Parse `declare -f` output into `name -> full definition text`.
fn parse_func_dump(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut current_name: Option<String> = None;
    let mut current_body = String::new();
    for line in raw.lines() {
        if let Some(name) = function_header_name(line) {
            if let Some(prev) = current_name.take() {
                out.insert(prev, std::mem::take(&mut current_body));
            }
            current_name = Some(name);
        }
        if current_name.is_some() {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    if let Some(name) = current_name {
        out.insert(name, current_body);
    }
    out
}

fn function_header_name(line: &str) -> Option<String> {
    let trimmed = line.trim_end();
    let name = trimmed.strip_suffix("()")?.trim_end();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_embedded_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }

    #[test]
    fn preamble_includes_aliases_and_funcs_for_bash() {
        let mut aliases = BTreeMap::new();
        aliases.insert("ll".to_string(), "ls -la".to_string());
        let mut funcs = BTreeMap::new();
        funcs.insert("greet".to_string(), "greet () \n{ \n    echo hi\n}\n".to_string());
        let state = ShellState::new(ShellType::Bash, "/tmp", BTreeMap::new(), aliases, funcs);
        let script = preamble_script(&state);
        assert!(script.contains("alias ll='ls -la'"));
        assert!(script.contains("greet"));
    }

    #[test]
    fn preamble_skips_aliases_for_other_shells() {
        let mut aliases = BTreeMap::new();
        aliases.insert("ll".to_string(), "ls -la".to_string());
        let state = ShellState::new(
            ShellType::Other("fish".to_string()),
            "/tmp",
            BTreeMap::new(),
            aliases,
            BTreeMap::new(),
        );
        assert!(preamble_script(&state).is_empty());
    }

    #[test]
    fn parse_env_dump_splits_on_nul_and_equals() {
        let raw = b"HOME=/home/user\0PATH=/usr/bin:/bin\0".to_vec();
        let env = parse_env_dump(&raw);
        assert_eq!(env.get("HOME"), Some(&"/home/user".to_string()));
        assert_eq!(env.get("PATH"), Some(&"/usr/bin:/bin".to_string()));
    }

    #[test]
    fn parse_alias_dump_unquotes_single_quotes() {
        let raw = "alias ll='ls -la'\nalias gg='git log --oneline'\n";
        let aliases = parse_alias_dump(raw);
        assert_eq!(aliases.get("ll"), Some(&"ls -la".to_string()));
        assert_eq!(aliases.get("gg"), Some(&"git log --oneline".to_string()));
    }

    #[test]
    fn parse_func_dump_splits_consecutive_functions() {
        let raw = "greet () \n{ \n    echo hi\n}\nfarewell () \n{ \n    echo bye\n}\n";
        let funcs = parse_func_dump(raw);
        assert_eq!(funcs.len(), 2);
        assert!(funcs.get("greet").unwrap().contains("echo hi"));
        assert!(funcs.get("farewell").unwrap().contains("echo bye"));
    }

    #[test]
    fn read_probe_round_trips_a_written_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cwd"), "/tmp/work\n").unwrap();
        std::fs::write(dir.path().join("env"), b"A=1\0B=2\0".to_vec()).unwrap();
        std::fs::write(dir.path().join("aliases"), "alias ll='ls -la'\n").unwrap();
        std::fs::write(dir.path().join("funcs"), "").unwrap();

        let state = read_probe(dir.path(), ShellType::Bash).unwrap();
        assert_eq!(state.cwd, "/tmp/work");
        assert_eq!(state.env.get("A"), Some(&"1".to_string()));
        assert_eq!(state.aliases.get("ll"), Some(&"ls -la".to_string()));
    }
}
