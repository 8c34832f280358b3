use waveshell_proto::Packet;

/// This binary's protocol version. Must share a major.minor with the core's
/// `waveshell_proc::CORE_PROTOCOL_VERSION` for a connection to be accepted.
pub const AGENT_PROTOCOL_VERSION: &str = "0.2.0";

/// Build the `init` handshake packet this agent sends on startup.
pub fn build_init() -> Packet {
    Packet::Init {
        notfound: false,
        uname: uname_string(),
        user: std::env::var("USER").unwrap_or_default(),
        homedir: dirs_next::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        hostname: hostname(),
        shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string()),
        version: AGENT_PROTOCOL_VERSION.to_string(),
    }
}

fn uname_string() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
