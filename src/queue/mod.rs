//! Job queue access.
//!
//! [`QueueGateway`] owns the single broker connection of a process. It is
//! connected once, in either producer or consumer mode, and gates every
//! dependant on a one-shot [`Readiness`](crate::Readiness) signal that
//! resolves when the tube handshake completes.
//!
//! Broker transport errors are unrecoverable: they are handed to the
//! gateway's [`FatalPolicy`](crate::FatalPolicy), which by default exits the
//! process.

mod client;
mod gateway;

pub use client::{BeanstalkClient, Job};
pub use gateway::QueueGateway;

use std::fmt;

/// Role of a gateway's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Publishes jobs into the configured tube (`use`)
    Producer,
    /// Reserves jobs from the configured tube (`watch`)
    Consumer,
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueMode::Producer => write!(f, "producer"),
            QueueMode::Consumer => write!(f, "consumer"),
        }
    }
}

/// Lifecycle of a gateway's connection.
///
/// Transitions only move forward: `Disconnected -> Connecting -> Ready`, with
/// `Failed` reachable from `Connecting` and `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueState::Disconnected => "disconnected",
            QueueState::Connecting => "connecting",
            QueueState::Ready => "ready",
            QueueState::Failed => "failed",
        };
        f.write_str(name)
    }
}
