//! Datapoint record produced by the decoder

use serde::{Deserialize, Serialize};

/// A single decoded measurement.
///
/// On the wire and in queue jobs a datapoint is the JSON tuple
/// `[name, [timestamp, value]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireDatapoint", into = "WireDatapoint")]
pub struct Datapoint {
    /// Metric name, e.g. `cpu.load`
    pub name: String,

    /// Measured value
    pub value: f64,

    /// Unix timestamp in seconds
    pub timestamp: u64,
}

impl Datapoint {
    /// Create a new datapoint
    pub fn new(name: impl Into<String>, value: f64, timestamp: u64) -> Self {
        Self { name: name.into(), value, timestamp }
    }

    /// Serialize to the JSON tuple form used for queue jobs.
    pub fn to_json(&self) -> String {
        // A tuple of string, integer and float always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct WireDatapoint(String, (u64, f64));

impl From<WireDatapoint> for Datapoint {
    fn from(WireDatapoint(name, (timestamp, value)): WireDatapoint) -> Self {
        Datapoint { name, value, timestamp }
    }
}

impl From<Datapoint> for WireDatapoint {
    fn from(dp: Datapoint) -> Self {
        WireDatapoint(dp.name, (dp.timestamp, dp.value))
    }
}
