//! Entry point for the shell agent binary dialed by the core over ssh or a local sudo shell.
//!
//! Generalizes `slarti-remote`'s single-socket JSON-line loop (read a line, dispatch, write a
//! line) into the full duplex packet protocol implemented in [`waveshell_agent`]; this binary
//! is just the `--version` short-circuit plus a call into the library loop, the same shape as
//! `slarti-ssh`'s thin `main.rs` over its own library crate.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|a| a == "--version" || a == "-V") {
        println!("{}", waveshell_agent::AGENT_PROTOCOL_VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    waveshell_agent::run_agent_main().await
}
