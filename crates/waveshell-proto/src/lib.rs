//! Packet types and line codec for the core <-> shell-agent wire protocol.
//!
//! Generalizes `slarti-proto`'s tagged-enum `Command`/`Response` pair into the full packet
//! catalog a long-lived shell agent needs: handshake, per-command run protocol, state
//! diffing, pty signals, and the sudo password relay.

pub mod codec;
pub mod packet;

pub use codec::{encode_line, CodecError, DecodedLine, PacketDecoder, PACKET_MARKER};
pub use packet::{CmdKey, Packet, PacketClass, SpecialInput};
