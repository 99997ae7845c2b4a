//! Wire protocol boundary.
//!
//! The framer treats decoding as a pure function from bytes to datapoints plus
//! leftover bytes. [`Decoder`] is that seam; [`BellProtocol`] is the grammar
//! spoken by bell producers:
//!
//! ```text
//! packet  := length "\n" payload
//! length  := ASCII decimal byte length of payload
//! payload := JSON array of [name, [timestamp, value]]
//! ```
//!
//! ```rust
//! use bell::protocol::{BellProtocol, Decoder};
//! use bell::Datapoint;
//!
//! let protocol = BellProtocol::default();
//! let mut bytes = protocol.encode(&[Datapoint::new("cpu.load", 0.42, 1000)]);
//! bytes.extend_from_slice(b"27\n[[\"cpu");
//!
//! let decoded = protocol.decode(&bytes).unwrap();
//! assert_eq!(decoded.datapoints.len(), 1);
//! assert_eq!(decoded.remainder(&bytes), b"27\n[[\"cpu");
//! ```

mod bell;
mod decoder;

pub use bell::{BellProtocol, DEFAULT_MAX_PACKET_LEN, MAX_HEADER_LEN, max_frame_len};
pub use decoder::{Decoded, Decoder};
