//! Length-prefixed JSON packets

use super::decoder::{Decoded, Decoder};
use crate::FramingError;
use crate::types::Datapoint;

/// Largest payload accepted by default (16 MiB).
pub const DEFAULT_MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// Longest length header, in bytes, that may precede the newline.
pub const MAX_HEADER_LEN: usize = 20;

/// Longest complete packet (header, newline and payload) for a payload limit.
pub const fn max_frame_len(max_packet_len: usize) -> usize {
    max_packet_len.saturating_add(MAX_HEADER_LEN + 1)
}

/// The bell packet grammar: `<len>\n<json>`.
#[derive(Debug, Clone, Copy)]
pub struct BellProtocol {
    max_packet_len: usize,
}

impl Default for BellProtocol {
    fn default() -> Self {
        Self { max_packet_len: DEFAULT_MAX_PACKET_LEN }
    }
}

impl BellProtocol {
    /// Create a protocol that rejects payloads longer than `max_packet_len`.
    pub fn new(max_packet_len: usize) -> Self {
        Self { max_packet_len }
    }

    /// Maximum accepted payload length
    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }

    /// Longest complete packet this protocol accepts
    pub fn max_frame_len(&self) -> usize {
        max_frame_len(self.max_packet_len)
    }

    /// Encode datapoints into a single packet.
    pub fn encode(&self, datapoints: &[Datapoint]) -> Vec<u8> {
        let payload = serde_json::to_vec(datapoints).unwrap_or_else(|_| b"[]".to_vec());
        let mut packet = format!("{}\n", payload.len()).into_bytes();
        packet.extend_from_slice(&payload);
        packet
    }

    fn parse_header(&self, header: &[u8]) -> Result<usize, FramingError> {
        if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
            return Err(FramingError::InvalidHeader {
                details: format!("expected decimal length, got {:?}", lossy_prefix(header)),
            });
        }

        // All-digit headers only fail to parse on overflow.
        let declared = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| FramingError::InvalidHeader {
                details: format!("length {:?} overflows", lossy_prefix(header)),
            })?;

        if declared > self.max_packet_len {
            return Err(FramingError::PacketTooLarge { declared, limit: self.max_packet_len });
        }
        Ok(declared)
    }
}

impl Decoder for BellProtocol {
    fn decode(&self, buf: &[u8]) -> Result<Decoded, FramingError> {
        let mut datapoints = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            let rest = &buf[pos..];
            let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                if rest.len() > MAX_HEADER_LEN {
                    return Err(FramingError::InvalidHeader {
                        details: format!("no newline within {} bytes", MAX_HEADER_LEN),
                    });
                }
                break;
            };

            let declared = self.parse_header(&rest[..newline])?;
            let body_start = newline + 1;
            if rest.len() - body_start < declared {
                break;
            }

            let body = &rest[body_start..body_start + declared];
            let batch: Vec<Datapoint> = serde_json::from_slice(body)
                .map_err(|e| FramingError::InvalidPayload { details: e.to_string() })?;
            datapoints.extend(batch);
            pos += body_start + declared;
        }

        Ok(Decoded { datapoints, consumed: pos })
    }
}

fn lossy_prefix(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_HEADER_LEN)]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Datapoint> {
        vec![Datapoint::new("cpu.load", 0.42, 1000), Datapoint::new("cpu.load", 0.51, 1010)]
    }

    #[test]
    fn encode_prefixes_payload_length() {
        let packet = BellProtocol::default().encode(&[Datapoint::new("a", 1.0, 2)]);
        assert_eq!(packet, b"15\n[[\"a\",[2,1.0]]]".to_vec());
    }

    #[test]
    fn decodes_back_to_back_packets() {
        let protocol = BellProtocol::default();
        let mut bytes = protocol.encode(&sample()[..1]);
        bytes.extend(protocol.encode(&sample()[1..]));

        let decoded = protocol.decode(&bytes).unwrap();
        assert_eq!(decoded.datapoints, sample());
        assert_eq!(decoded.consumed, bytes.len());
        assert!(decoded.remainder(&bytes).is_empty());
    }

    #[test]
    fn incomplete_packet_is_left_as_remainder() {
        let protocol = BellProtocol::default();
        let packet = protocol.encode(&sample());

        for cut in 0..packet.len() {
            let decoded = protocol.decode(&packet[..cut]).unwrap();
            assert!(decoded.datapoints.is_empty(), "cut at {cut}");
            assert_eq!(decoded.consumed, 0);
            assert_eq!(decoded.remainder(&packet[..cut]), &packet[..cut]);
        }
    }

    #[test]
    fn longest_header_and_payload_fill_one_frame() {
        let protocol = BellProtocol::new(13);
        let packet = b"00000000000000000013\n[[\"a\",[1,2]]]";
        assert_eq!(packet.len(), protocol.max_frame_len());

        let decoded = protocol.decode(packet).unwrap();
        assert_eq!(decoded.datapoints, vec![Datapoint::new("a", 2.0, 1)]);
        assert_eq!(decoded.consumed, packet.len());
    }

    #[test]
    fn empty_batch_packet_decodes_to_nothing() {
        let decoded = BellProtocol::default().decode(b"2\n[]").unwrap();
        assert_eq!(decoded, Decoded::default());
    }

    #[test]
    fn non_numeric_header_is_rejected() {
        let err = BellProtocol::default().decode(b"abc\n[]").unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));

        let err = BellProtocol::default().decode(b"\n[]").unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));
    }

    #[test]
    fn runaway_header_is_rejected() {
        let err = BellProtocol::default().decode(&[b'1'; 32]).unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));
    }

    #[test]
    fn oversized_packet_is_rejected_before_buffering() {
        let err = BellProtocol::new(8).decode(b"9\n").unwrap_err();
        assert_eq!(err, FramingError::PacketTooLarge { declared: 9, limit: 8 });
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = BellProtocol::default().decode(b"5\n[1,2]").unwrap_err();
        assert!(matches!(err, FramingError::InvalidPayload { .. }));
    }
}
