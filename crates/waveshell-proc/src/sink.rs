use std::sync::Arc;

use async_trait::async_trait;

use waveshell_proto::Packet;

use crate::cmd::RunCmd;

/// Result of handing a `data` packet's bytes to whatever consumes them (persistent pty-out
/// file, or an ephemeral caller-supplied writer). Drives the `dataack` the proc sends back
/// to the agent for backpressure (spec.md invariant 4).
pub enum DataAckOutcome {
    Accepted { len: usize },
    Rejected { error: String },
}

/// The boundary between `waveshell-proc` (C4: owns the transport, demuxes packets) and
/// `waveshell-run` (C6/C7: owns command bookkeeping, the DB, and the ordering gate).
///
/// `WaveshellProc` never depends on `waveshell-run` directly — the cyclic relationship is
/// broken the way spec.md §9's design notes prescribe for proc<->registry: the owner wires
/// a trait object in after construction via [`crate::proc::WaveshellProc::set_packet_sink`].
#[async_trait]
pub trait CommandPacketSink: Send + Sync {
    /// A `data` packet arrived for a (possibly unknown) `ck`. Returns how many bytes were
    /// accepted so the proc can send the matching `dataack`.
    async fn on_data(&self, remote_id: &str, packet: Packet) -> DataAckOutcome;

    /// A `cmddone` packet arrived: the agent finished a command normally.
    async fn on_cmd_done(&self, remote_id: &str, packet: Packet);

    /// A `cmdfinal` packet arrived: the agent died mid-command.
    async fn on_cmd_final(&self, remote_id: &str, packet: Packet);

    /// The `cmddata`/`dataack` inbound-from-agent informational packets (spec.md §4.6); logged
    /// only today, per the "Open Questions" note about future backpressure tuning.
    async fn on_informational(&self, _remote_id: &str, _packet: Packet) {}

    /// The proc's transport went away (explicit disconnect or the agent process exiting).
    /// `hungup` is every command that was still tracked as running; the sink is responsible
    /// for marking their rows `Hangup` (spec.md §4.4 "disconnect hangs up running commands").
    async fn on_proc_disconnected(&self, remote_id: &str, hungup: Vec<Arc<RunCmd>>);
}
