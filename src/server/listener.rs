//! Listener and accept loop

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::DatapointHandler;
use super::session::{ConnectionId, Session, SessionRegistry, SessionStats};
use crate::config::ListenerConfig;
use crate::framer::ConnectionFramer;
use crate::protocol::Decoder;
use crate::{BellError, Result};

/// Entry point for starting ingestion listeners
pub struct IngestionServer;

impl IngestionServer {
    /// Bind `config.host:config.port` and start accepting connections.
    ///
    /// A bind failure is logged and returned; it does not affect anything else
    /// in the process. Once running, an accept failure is logged and stops the
    /// listener from taking new connections while existing connections carry on.
    pub async fn start<D, H>(config: &ListenerConfig, decoder: D, handler: H) -> Result<ServerHandle>
    where
        D: Decoder + Clone,
        H: DatapointHandler,
    {
        let addr = config.addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Socket error: failed to bind {}: {}", addr, e);
                return Err(BellError::bind_failed(addr, e));
            }
        };
        let local_addr = listener.local_addr().map_err(|e| BellError::bind_failed(&addr, e))?;
        info!("Listening on {}", local_addr);

        let registry = SessionRegistry::default();
        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();

        let accept = AcceptLoop {
            listener,
            local_addr,
            decoder,
            handler: Arc::new(handler),
            registry: registry.clone(),
            max_remainder: config.max_remainder,
            read_buffer: config.read_buffer,
        };
        let cancel_accept = cancel.clone();
        let stopped_guard = stopped.clone().drop_guard();
        tokio::spawn(async move {
            let _stopped = stopped_guard;
            accept.run(cancel_accept).await;
        });

        Ok(ServerHandle { local_addr, registry, cancel, stopped })
    }
}

struct AcceptLoop<D, H> {
    listener: TcpListener,
    local_addr: SocketAddr,
    decoder: D,
    handler: Arc<H>,
    registry: SessionRegistry,
    max_remainder: usize,
    read_buffer: usize,
}

impl<D, H> AcceptLoop<D, H>
where
    D: Decoder + Clone,
    H: DatapointHandler,
{
    async fn run(self, cancel: CancellationToken) {
        let mut sessions = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Listener on {} shutting down", self.local_addr);
                    break;
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                    continue;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let id = ConnectionId::next();
                    self.registry.insert(id, peer);
                    let session = Session {
                        id,
                        peer,
                        stream,
                        framer: ConnectionFramer::with_max_remainder(
                            self.decoder.clone(),
                            self.max_remainder,
                        ),
                        registry: self.registry.clone(),
                        read_buffer: self.read_buffer,
                    };
                    sessions.spawn(session.run(Arc::clone(&self.handler), cancel.child_token()));
                }
                Err(e) => {
                    let err = BellError::accept_failed(self.local_addr, e);
                    error!("Socket error: {}; no longer accepting connections", err);
                    break;
                }
            }
        }

        drop(self.listener);
        debug!("Waiting for {} connection tasks", sessions.len());
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
        info!("Listener on {} stopped", self.local_addr);
    }
}

/// Handle to a running listener.
///
/// Dropping the handle shuts the listener and its connections down.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: SessionRegistry,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Statistics of live connections, ordered by connection id
    pub fn sessions(&self) -> Vec<SessionStats> {
        self.registry.snapshot()
    }

    /// Whether the accept loop or any connection task is still running
    pub fn is_running(&self) -> bool {
        !self.stopped.is_cancelled()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the listener and all its connections have stopped.
    pub async fn wait(&self) {
        self.stopped.cancelled().await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        debug!("Dropping server handle for {}", self.local_addr);
        self.cancel.cancel();
    }
}
