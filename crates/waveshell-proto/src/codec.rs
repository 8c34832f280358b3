//! Framing for the `##N{json}\n` wire protocol.
//!
//! Every packet is one line: the literal marker `##N`, a JSON object, then `\n`. During the
//! initial handshake the decoder tolerates arbitrary noise (SSH banners, MOTD) before the
//! first valid packet via [`PacketDecoder::ignore_until_valid`] — non-matching lines are
//! reported through [`DecodedLine::Noise`] rather than treated as fatal.

use crate::packet::Packet;
use thiserror::Error;

pub const PACKET_MARKER: &str = "##N";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet line missing ##N marker")]
    MissingMarker,
    #[error("invalid packet json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unknown packet type {0:?}")]
    UnknownType(String),
}

/// The result of decoding one line of input.
#[derive(Debug)]
pub enum DecodedLine {
    Packet(Packet),
    /// A recognized-but-unhandled `type` tag: logged, never fatal (spec §4.1).
    UnknownType { raw_type: String, raw: String },
    /// A line with no `##N` marker, tolerated only while `ignore_until_valid` is set.
    Noise(String),
}

/// Encode a packet as one `##N{json}\n` line.
pub fn encode_line(packet: &Packet) -> Result<String, CodecError> {
    let json = serde_json::to_string(packet)?;
    Ok(format!("{PACKET_MARKER}{json}\n"))
}

/// Decoder state. `ignore_until_valid` starts `true` for a freshly dialed agent (SSH banner
/// noise precedes the first real packet) and is cleared the moment a valid packet decodes.
pub struct PacketDecoder {
    ignore_until_valid: bool,
}

impl PacketDecoder {
    pub fn new(ignore_until_valid: bool) -> Self {
        PacketDecoder { ignore_until_valid }
    }

    pub fn is_ignoring_until_valid(&self) -> bool {
        self.ignore_until_valid
    }

    /// Decode a single line (without its trailing newline).
    ///
    /// Returns `Err` only for a marker-prefixed line with malformed JSON, which is always
    /// fatal to the connection regardless of `ignore_until_valid` — a line that starts with
    /// the marker is asserting it's a real packet.
    pub fn decode_line(&mut self, line: &str) -> Result<DecodedLine, CodecError> {
        let Some(body) = line.strip_prefix(PACKET_MARKER) else {
            if self.ignore_until_valid {
                return Ok(DecodedLine::Noise(line.to_string()));
            }
            return Err(CodecError::MissingMarker);
        };

        let value: serde_json::Value = serde_json::from_str(body)?;
        let raw_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        match serde_json::from_value::<Packet>(value) {
            Ok(packet) => {
                self.ignore_until_valid = false;
                Ok(DecodedLine::Packet(packet))
            }
            Err(_) => Ok(DecodedLine::UnknownType {
                raw_type,
                raw: body.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    #[test]
    fn round_trip_ping() {
        let line = encode_line(&Packet::Ping).unwrap();
        assert!(line.starts_with(PACKET_MARKER));
        let mut dec = PacketDecoder::new(false);
        let decoded = dec.decode_line(line.trim_end()).unwrap();
        assert!(matches!(decoded, DecodedLine::Packet(Packet::Ping)));
    }

    #[test]
    fn round_trip_cmddata() {
        use crate::packet::CmdKey;

        let packet = Packet::CmdData {
            ck: CmdKey::new("screen1", "line1"),
            buffered_bytes: 4096,
        };
        let line = encode_line(&packet).unwrap();
        assert!(line.contains("\"type\":\"cmd_data\""));
        let mut dec = PacketDecoder::new(false);
        match dec.decode_line(line.trim_end()).unwrap() {
            DecodedLine::Packet(Packet::CmdData { buffered_bytes, .. }) => {
                assert_eq!(buffered_bytes, 4096)
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn banner_noise_tolerated_until_first_valid_packet() {
        let mut dec = PacketDecoder::new(true);
        let noise = dec.decode_line("Welcome to Ubuntu 22.04").unwrap();
        assert!(matches!(noise, DecodedLine::Noise(_)));
        assert!(dec.is_ignoring_until_valid());

        let line = encode_line(&Packet::Ping).unwrap();
        let decoded = dec.decode_line(line.trim_end()).unwrap();
        assert!(matches!(decoded, DecodedLine::Packet(Packet::Ping)));
        assert!(!dec.is_ignoring_until_valid());
    }

    #[test]
    fn marker_prefixed_garbage_is_fatal() {
        let mut dec = PacketDecoder::new(false);
        let err = dec.decode_line("##Nnot json at all").unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson(_)));
    }

    #[test]
    fn unknown_type_degrades_to_unknown_not_crash() {
        let mut dec = PacketDecoder::new(false);
        let decoded = dec
            .decode_line(r#"##N{"type":"something_from_the_future","foo":1}"#)
            .unwrap();
        match decoded {
            DecodedLine::UnknownType { raw_type, .. } => {
                assert_eq!(raw_type, "something_from_the_future")
            }
            _ => panic!("expected UnknownType"),
        }
    }
}
