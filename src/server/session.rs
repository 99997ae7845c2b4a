//! Per-connection sessions and the live-session registry

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DatapointHandler;
use crate::framer::ConnectionFramer;
use crate::protocol::Decoder;

/// Bytes of an offending chunk included in framing diagnostics.
pub const DIAGNOSTIC_PREFIX_LEN: usize = 45;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Diagnostics for one live connection.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub bytes_read: u64,
    pub chunks: u64,
    pub datapoints: u64,
    pub framing_errors: u64,
}

/// Map from connection identity to its statistics.
///
/// Entries exist exactly as long as their connection task runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, SessionStats>>>,
}

impl SessionRegistry {
    fn with<R>(&self, f: impl FnOnce(&mut HashMap<ConnectionId, SessionStats>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub(crate) fn insert(&self, id: ConnectionId, peer: SocketAddr) {
        let stats = SessionStats {
            id,
            peer,
            connected_at: Instant::now(),
            bytes_read: 0,
            chunks: 0,
            datapoints: 0,
            framing_errors: 0,
        };
        self.with(|sessions| sessions.insert(id, stats));
    }

    fn record(&self, id: ConnectionId, bytes: usize, datapoints: usize, failed: bool) {
        self.with(|sessions| {
            if let Some(stats) = sessions.get_mut(&id) {
                stats.bytes_read += bytes as u64;
                stats.chunks += 1;
                stats.datapoints += datapoints as u64;
                stats.framing_errors += u64::from(failed);
            }
        });
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<SessionStats> {
        self.with(|sessions| sessions.remove(&id))
    }

    pub(crate) fn len(&self) -> usize {
        self.with(|sessions| sessions.len())
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionStats> {
        let mut all: Vec<_> = self.with(|sessions| sessions.values().cloned().collect());
        all.sort_by_key(|stats| stats.id);
        all
    }
}

/// One accepted connection and its exclusively owned framer.
pub(crate) struct Session<D> {
    pub(crate) id: ConnectionId,
    pub(crate) peer: SocketAddr,
    pub(crate) stream: TcpStream,
    pub(crate) framer: ConnectionFramer<D>,
    pub(crate) registry: SessionRegistry,
    pub(crate) read_buffer: usize,
}

impl<D: Decoder> Session<D> {
    /// Read and decode until the peer closes, a read fails, or `cancel` fires.
    pub(crate) async fn run<H: DatapointHandler>(mut self, handler: Arc<H>, cancel: CancellationToken) {
        info!("New connection established, id: {}, peer: {}", self.id, self.peer);
        let mut buf = vec![0u8; self.read_buffer];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connection {} cancelled", self.id);
                    break;
                }
                read = self.stream.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Read error on connection {}: {}", self.id, e);
                    break;
                }
            };

            let chunk = &buf[..n];
            match self.framer.parse(chunk) {
                Ok(datapoints) => {
                    self.registry.record(self.id, n, datapoints.len(), false);
                    handler.on_datapoints(datapoints);
                }
                Err(e) => {
                    self.registry.record(self.id, n, 0, true);
                    warn!(
                        "Invalid input on connection {}: {}: {:?}",
                        self.id,
                        e,
                        diagnostic_prefix(chunk)
                    );
                }
            }
        }

        let stats = self.registry.remove(self.id);
        if self.framer.pending_len() > 0 {
            debug!(
                "Discarding {} unresolved bytes from connection {}",
                self.framer.pending_len(),
                self.id
            );
        }
        match stats {
            Some(stats) => info!(
                "Client disconnected, id: {}, {} bytes, {} datapoints, {} framing errors",
                self.id, stats.bytes_read, stats.datapoints, stats.framing_errors
            ),
            None => info!("Client disconnected, id: {}", self.id),
        }
    }
}

/// Lossy UTF-8 rendering of at most [`DIAGNOSTIC_PREFIX_LEN`] bytes.
pub(crate) fn diagnostic_prefix(chunk: &[u8]) -> String {
    String::from_utf8_lossy(&chunk[..chunk.len().min(DIAGNOSTIC_PREFIX_LEN)]).into_owned()
}
