use std::collections::HashMap;

use waveshell_state::ShellStatePtr;

/// The core's own protocol version. An agent's reported `version` must share a major.minor
/// with this for the connection to be accepted (spec.md §4.4).
pub const CORE_PROTOCOL_VERSION: &str = "0.2.0";

/// Parsed `init` handshake payload, as reported by the agent (spec.md §3 data model).
#[derive(Debug, Clone, Default)]
pub struct InitInfo {
    pub uname: String,
    pub user: String,
    pub homedir: String,
    pub hostname: String,
    pub shell: String,
    pub version: String,
}

/// `ShellStateMap`: per-shell-type "current" state pointer tracked on a connected proc
/// (spec.md §3). Cleared on every successful (re)connect.
pub type ShellStateMap = HashMap<String, ShellStatePtr>;

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Whether `agent_version` is compatible with `core_version` — same major.minor, per
/// spec.md §4.4 ("If the reported agent version major/minor does not match the core's...").
pub fn versions_compatible(agent_version: &str, core_version: &str) -> bool {
    match (major_minor(agent_version), major_minor(core_version)) {
        (Some(a), Some(c)) => a == c,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_major_minor_is_compatible() {
        assert!(versions_compatible("0.2.3", "0.2.0"));
        assert!(versions_compatible("v0.2.0", "0.2.9"));
    }

    #[test]
    fn different_minor_is_incompatible() {
        assert!(!versions_compatible("0.1.0", "0.2.0"));
    }

    #[test]
    fn unparseable_version_is_incompatible() {
        assert!(!versions_compatible("garbage", "0.2.0"));
    }
}
