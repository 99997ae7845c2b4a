//! Decoder trait for wire grammars

use crate::FramingError;
use crate::types::Datapoint;

/// Output of a single decode attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    /// Complete records, in byte order
    pub datapoints: Vec<Datapoint>,

    /// Length of the prefix resolved into `datapoints`
    pub consumed: usize,
}

impl Decoded {
    /// Trailing bytes of `buf` that do not yet form a complete record.
    pub fn remainder<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.consumed..).unwrap_or_default()
    }
}

/// Trait for wire grammars the framer can drive.
///
/// Implementations must be pure: the same input always yields the same output,
/// and no state is kept between calls. Incomplete trailing input is left
/// unconsumed (see [`Decoded::remainder`]); malformed input must be reported as
/// a [`FramingError`], never silently skipped.
pub trait Decoder: Send + Sync + 'static {
    /// Decode as many complete records as `buf` holds.
    fn decode(&self, buf: &[u8]) -> Result<Decoded, FramingError>;
}

impl<D: Decoder + ?Sized> Decoder for std::sync::Arc<D> {
    fn decode(&self, buf: &[u8]) -> Result<Decoded, FramingError> {
        (**self).decode(buf)
    }
}
