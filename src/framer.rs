//! Per-connection incremental decoding.
//!
//! A [`ConnectionFramer`] bridges transport chunking and packet boundaries: it
//! keeps the unresolved suffix of everything seen so far and prepends it to the
//! next chunk. On a decode failure the suffix is discarded, so one bad chunk
//! never poisons the chunks that follow it.

use tracing::{trace, warn};

use crate::protocol::{DEFAULT_MAX_PACKET_LEN, Decoder, max_frame_len};
use crate::types::Datapoint;
use crate::{FramingError, Result};

/// Default cap on the unresolved remainder: one packet of the default size limit.
pub const DEFAULT_MAX_REMAINDER: usize = max_frame_len(DEFAULT_MAX_PACKET_LEN);

/// Incremental decoder state for one connection.
#[derive(Debug)]
pub struct ConnectionFramer<D> {
    decoder: D,
    unresolved: Vec<u8>,
    max_remainder: usize,
}

impl<D: Decoder> ConnectionFramer<D> {
    /// Create a framer with an empty remainder and the default cap.
    pub fn new(decoder: D) -> Self {
        Self::with_max_remainder(decoder, DEFAULT_MAX_REMAINDER)
    }

    /// Create a framer whose remainder may not exceed `max_remainder` bytes.
    ///
    /// The cap must hold the longest packet the decoder accepts, or such
    /// packets can never be reassembled.
    pub fn with_max_remainder(decoder: D, max_remainder: usize) -> Self {
        Self { decoder, unresolved: Vec::new(), max_remainder }
    }

    /// Decode `chunk` together with the remainder of previous chunks.
    ///
    /// Returns the complete datapoints in byte order. On a decode error the
    /// remainder is cleared and the chunk is lost.
    ///
    /// A trailing partial packet longer than the cap is discarded. Datapoints
    /// completed by the same chunk are still returned; only when there are none
    /// is the overflow reported as [`FramingError::RemainderOverflow`].
    pub fn parse(&mut self, chunk: &[u8]) -> Result<Vec<Datapoint>, FramingError> {
        let datapoints = if self.unresolved.is_empty() {
            let decoded = self.decoder.decode(chunk)?;
            self.unresolved.extend_from_slice(decoded.remainder(chunk));
            decoded.datapoints
        } else {
            self.unresolved.extend_from_slice(chunk);
            match self.decoder.decode(&self.unresolved) {
                Ok(decoded) => {
                    let consumed = decoded.consumed.min(self.unresolved.len());
                    self.unresolved.drain(..consumed);
                    if self.unresolved.is_empty() {
                        // Release the capacity of a large reassembled packet.
                        self.unresolved = Vec::new();
                    }
                    decoded.datapoints
                }
                Err(e) => {
                    self.unresolved.clear();
                    return Err(e);
                }
            }
        };

        let pending = self.unresolved.len();
        if pending > self.max_remainder {
            self.unresolved = Vec::new();
            let overflow = FramingError::RemainderOverflow { len: pending, limit: self.max_remainder };
            if datapoints.is_empty() {
                return Err(overflow);
            }
            warn!("{}; keeping {} decoded datapoints", overflow, datapoints.len());
        }

        trace!("Decoded {} datapoints, {} bytes pending", datapoints.len(), self.unresolved.len());
        Ok(datapoints)
    }

    /// Number of buffered bytes not yet resolved into datapoints
    pub fn pending_len(&self) -> usize {
        self.unresolved.len()
    }

    /// Discard any buffered bytes.
    pub fn reset(&mut self) {
        self.unresolved.clear();
    }

    /// Remainder cap in bytes
    pub fn max_remainder(&self) -> usize {
        self.max_remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;
    use crate::protocol::BellProtocol;
    use proptest::prelude::*;

    fn framer() -> ConnectionFramer<BellProtocol> {
        ConnectionFramer::new(BellProtocol::default())
    }

    fn encode(datapoints: &[Datapoint]) -> Vec<u8> {
        BellProtocol::default().encode(datapoints)
    }

    #[test]
    fn two_records_across_three_chunks() {
        let stream = [
            encode(&[Datapoint::new("cpu.load", 0.42, 1000)]),
            encode(&[Datapoint::new("cpu.load", 0.51, 1010)]),
        ]
        .concat();
        let (a, rest) = stream.split_at(5);
        let (b, c) = rest.split_at(23);

        let mut framer = framer();
        let mut received = Vec::new();
        for chunk in [a, b, c] {
            received.extend(framer.parse(chunk).unwrap());
        }

        assert_eq!(
            received,
            vec![Datapoint::new("cpu.load", 0.42, 1000), Datapoint::new("cpu.load", 0.51, 1010)]
        );
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn failed_decode_resets_remainder() {
        let mut framer = framer();
        let packet = encode(&[Datapoint::new("mem.used", 1.0, 1)]);

        // Half a length header is pending when the junk arrives.
        framer.parse(&packet[..1]).unwrap();
        assert_eq!(framer.pending_len(), 1);

        assert!(framer.parse(b"garbage\n").is_err());
        assert_eq!(framer.pending_len(), 0);

        // The next well-formed packet decodes on its own.
        assert_eq!(framer.parse(&packet).unwrap(), vec![Datapoint::new("mem.used", 1.0, 1)]);
    }

    #[test]
    fn remainder_above_cap_is_discarded() {
        let mut framer = ConnectionFramer::with_max_remainder(BellProtocol::default(), 8);
        let packet = encode(&[Datapoint::new("disk.io", 3.0, 7)]);

        let err = framer.parse(&packet[..packet.len() - 1]).unwrap_err();
        assert!(matches!(err, FramingError::RemainderOverflow { limit: 8, .. }));
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn overflow_keeps_datapoints_already_decoded() {
        let mut framer = ConnectionFramer::with_max_remainder(BellProtocol::default(), 8);
        let first = encode(&[Datapoint::new("a", 1.0, 1)]);
        let second = encode(&[Datapoint::new("b", 2.0, 2)]);
        let chunk = [&first[..], &second[..second.len() - 1]].concat();

        assert_eq!(framer.parse(&chunk).unwrap(), vec![Datapoint::new("a", 1.0, 1)]);
        assert_eq!(framer.pending_len(), 0);

        // Nothing of the truncated packet is carried over.
        assert_eq!(framer.parse(&first).unwrap(), vec![Datapoint::new("a", 1.0, 1)]);
    }

    #[test]
    fn default_limits_reassemble_largest_packet() {
        let config = ListenerConfig::default();
        let protocol = BellProtocol::new(config.max_packet_len);
        let mut framer = ConnectionFramer::with_max_remainder(protocol, config.max_remainder);

        // A name that brings the payload to one byte under the packet limit.
        let overhead = serde_json::to_vec(&[Datapoint::new("", 1.5, 7)]).unwrap().len();
        let name = "x".repeat(config.max_packet_len - overhead - 1);
        let expected = Datapoint::new(name, 1.5, 7);
        let packet = protocol.encode(std::slice::from_ref(&expected));

        let mut received = Vec::new();
        for chunk in packet.chunks(config.read_buffer) {
            received.extend(framer.parse(chunk).unwrap());
        }
        assert_eq!(received, vec![expected]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn reset_clears_pending_bytes() {
        let mut framer = framer();
        framer.parse(b"12\n[[").unwrap();
        assert!(framer.pending_len() > 0);
        framer.reset();
        assert_eq!(framer.pending_len(), 0);
    }

    prop_compose! {
        fn arb_datapoint()(
            name in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}",
            cents in -100_000_000i64..100_000_000i64,
            timestamp in 0u64..4_000_000_000u64,
        ) -> Datapoint {
            Datapoint::new(name, cents as f64 / 100.0, timestamp)
        }
    }

    fn arb_stream() -> impl Strategy<Value = (Vec<Datapoint>, Vec<u8>)> {
        prop::collection::vec(prop::collection::vec(arb_datapoint(), 0..4), 1..6).prop_map(
            |batches| {
                let datapoints = batches.iter().flatten().cloned().collect();
                let bytes = batches.iter().flat_map(|b| encode(b)).collect();
                (datapoints, bytes)
            },
        )
    }

    proptest! {
        #[test]
        fn any_chunking_matches_whole_decode(
            (expected, bytes) in arb_stream(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();
            points.dedup();

            let mut framer = framer();
            let mut received = Vec::new();
            for window in points.windows(2) {
                received.extend(framer.parse(&bytes[window[0]..window[1]]).unwrap());
            }

            let whole = framer_decode_once(&bytes);
            prop_assert_eq!(&received, &whole);
            prop_assert_eq!(&received, &expected);
            prop_assert_eq!(framer.pending_len(), 0);
        }

        #[test]
        fn byte_at_a_time_matches_single_chunk((expected, bytes) in arb_stream()) {
            let mut framer = framer();
            let mut received = Vec::new();
            for byte in &bytes {
                received.extend(framer.parse(std::slice::from_ref(byte)).unwrap());
            }
            prop_assert_eq!(received, expected);
        }

        #[test]
        fn malformed_chunk_leaves_no_residue(
            (expected, bytes) in arb_stream(),
            prefix_len in 0usize..16,
            junk in "[a-z ]{1,16}\n",
        ) {
            // Stop inside the first length header so the junk lands mid-packet.
            let header_end = bytes.iter().position(|&b| b == b'\n').unwrap_or(0);
            let mut framer = framer();
            framer.parse(&bytes[..prefix_len.min(header_end)]).unwrap();

            let result = framer.parse(junk.as_bytes());
            prop_assert!(result.is_err());
            prop_assert_eq!(framer.pending_len(), 0);

            prop_assert_eq!(framer.parse(&bytes).unwrap(), expected);
        }
    }

    fn framer_decode_once(bytes: &[u8]) -> Vec<Datapoint> {
        framer().parse(bytes).unwrap()
    }
}
