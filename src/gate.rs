//! One-shot readiness signalling.
//!
//! A [`ReadinessGate`] starts pending and resolves exactly once, either to
//! ready or to failed. Waiters that subscribed before or after resolution all
//! observe the same outcome, and further resolution attempts are ignored.

use std::sync::Arc;
use tokio::sync::watch;

use crate::{BellError, Result};

/// Resolution state of a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    /// Not yet resolved
    Pending,
    /// The guarded setup step completed
    Ready,
    /// The guarded setup step failed
    Failed(String),
}

/// Single-resolution readiness primitive.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    /// Create a pending gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve the gate as ready.
    ///
    /// Returns `true` only for the call that resolved it.
    pub fn open(&self) -> bool {
        self.resolve(GateState::Ready)
    }

    /// Resolve the gate as failed.
    ///
    /// Returns `true` only for the call that resolved it.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.resolve(GateState::Failed(reason.into()))
    }

    fn resolve(&self, outcome: GateState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }

    /// Current state
    pub fn state(&self) -> GateState {
        self.tx.borrow().clone()
    }

    /// Whether the gate resolved as ready
    pub fn is_ready(&self) -> bool {
        *self.tx.borrow() == GateState::Ready
    }

    /// Create a waiter for this gate.
    pub fn waiter(&self) -> Readiness {
        Readiness { rx: self.tx.subscribe() }
    }

    /// Suspend until the gate resolves.
    pub async fn wait(&self) -> Result<()> {
        self.waiter().wait().await
    }
}

/// Waiter half of a [`ReadinessGate`].
#[derive(Debug, Clone)]
pub struct Readiness {
    rx: watch::Receiver<GateState>,
}

impl Readiness {
    /// Suspend until the gate resolves.
    ///
    /// Resolves immediately if the gate already resolved.
    pub async fn wait(mut self) -> Result<()> {
        let state = match self.rx.wait_for(|state| *state != GateState::Pending).await {
            Ok(state) => state.clone(),
            Err(_) => {
                return Err(BellError::queue_state("dropped", "gate dropped before resolving"));
            }
        };

        match state {
            GateState::Ready => Ok(()),
            GateState::Failed(reason) => Err(BellError::queue_connection_failed(reason)),
            GateState::Pending => unreachable!("wait_for only returns resolved states"),
        }
    }

    /// Whether the gate resolved as ready
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow() == GateState::Ready
    }
}
