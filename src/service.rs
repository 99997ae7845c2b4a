//! Composition root.
//!
//! A [`Service`] owns the listener, the queue gateway and the store gateway
//! as independently retrievable resources. It never decodes anything itself;
//! [`Service::start`] only wires the pieces together in dependency order:
//!
//! 1. store client (connections open lazily),
//! 2. queue producer, awaiting the tube handshake,
//! 3. dispatcher feeding the configured routes,
//! 4. listener whose callback hands batches to the dispatcher.

use std::sync::Arc;
use tracing::info;

use crate::config::{BellConfig, RouteKind};
use crate::dispatch::{DispatchHandle, DispatchSender, Dispatcher, QueueRoute, Route, StoreRoute};
use crate::fatal::{ExitProcess, FatalPolicy};
use crate::protocol::BellProtocol;
use crate::queue::{QueueGateway, QueueMode, QueueState};
use crate::server::{DatapointHandler, IngestionServer, ServerHandle};
use crate::store::StoreGateway;
use crate::{BellError, Result};

/// A resource looked up by name.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Listener(&'a ServerHandle),
    Queue(&'a Arc<QueueGateway>),
    Store(&'a Arc<StoreGateway>),
}

/// Holder of the ingestion resources of one process
pub struct Service {
    config: BellConfig,
    fatal: Arc<dyn FatalPolicy>,
    listener: Option<ServerHandle>,
    queue: Option<Arc<QueueGateway>>,
    store: Option<Arc<StoreGateway>>,
    dispatcher: Option<DispatchHandle>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("listener", &self.listener)
            .field("queue", &self.queue)
            .field("store", &self.store)
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}

impl Service {
    /// Create an empty service whose queue errors exit the process.
    pub fn new(config: BellConfig) -> Self {
        Self::with_fatal_policy(config, ExitProcess::default())
    }

    /// Create an empty service with a custom escalation policy for queue errors.
    pub fn with_fatal_policy(config: BellConfig, fatal: impl FatalPolicy) -> Self {
        Self {
            config,
            fatal: Arc::new(fatal),
            listener: None,
            queue: None,
            store: None,
            dispatcher: None,
        }
    }

    /// Create every resource in dependency order and start accepting.
    pub async fn start(config: BellConfig) -> Result<Self> {
        Self::new(config).launch().await
    }

    /// Like [`start`](Self::start), on an already constructed service.
    pub async fn launch(mut self) -> Result<Self> {
        self.create_store_client()?;
        if self.config.dispatch.routes.contains(&RouteKind::Queue) {
            self.connect_queue(QueueMode::Producer).await?;
        }
        let sender = self.create_dispatcher()?;
        self.create_listener(sender).await?;
        Ok(self)
    }

    pub fn config(&self) -> &BellConfig {
        &self.config
    }

    /// Create the store client, or return the existing one.
    pub fn create_store_client(&mut self) -> Result<Arc<StoreGateway>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(StoreGateway::create_client(&self.config.store)?);
        self.store = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Create the queue gateway, or return the existing one. Does not connect.
    pub fn create_queue_gateway(&mut self) -> Arc<QueueGateway> {
        if let Some(queue) = &self.queue {
            return Arc::clone(queue);
        }
        let fatal = Arc::clone(&self.fatal);
        let queue = QueueGateway::with_fatal_policy(self.config.queue.clone(), move |error: BellError| {
            fatal.escalate(error)
        });
        self.queue = Some(Arc::clone(&queue));
        queue
    }

    /// Connect the queue gateway in `mode` and suspend until it is ready.
    pub async fn connect_queue(&mut self, mode: QueueMode) -> Result<Arc<QueueGateway>> {
        let queue = self.create_queue_gateway();
        queue.connect(mode)?.wait().await?;
        Ok(queue)
    }

    /// Spawn the dispatcher for the configured routes.
    ///
    /// The queue route requires a ready queue gateway.
    pub fn create_dispatcher(&mut self) -> Result<DispatchSender> {
        if let Some(dispatcher) = &self.dispatcher {
            return Ok(dispatcher.sender());
        }

        let mut routes: Vec<Arc<dyn Route>> = Vec::new();
        let kinds = self.config.dispatch.routes.clone();
        for kind in kinds {
            match kind {
                RouteKind::Queue => {
                    let state = self.queue.as_ref().map_or(QueueState::Disconnected, |q| q.state());
                    let queue = match &self.queue {
                        Some(queue) if state == QueueState::Ready => queue,
                        _ => {
                            return Err(BellError::queue_state(
                                state,
                                "the queue route needs a connected producer",
                            ));
                        }
                    };
                    routes.push(Arc::new(QueueRoute::new(Arc::clone(queue), &self.config.queue)));
                }
                RouteKind::Store => {
                    let store = self.create_store_client()?;
                    routes.push(Arc::new(StoreRoute::new(store)));
                }
            }
        }

        let dispatcher = Dispatcher::spawn(&self.config.dispatch, routes)?;
        let sender = dispatcher.sender();
        self.dispatcher = Some(dispatcher);
        Ok(sender)
    }

    /// Bind the ingestion listener and deliver decoded batches to `handler`.
    pub async fn create_listener<H: DatapointHandler>(&mut self, handler: H) -> Result<&ServerHandle> {
        if self.listener.is_some() {
            return Err(BellError::bind_failed(
                self.config.listener.addr(),
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "listener already created"),
            ));
        }
        let protocol = BellProtocol::new(self.config.listener.max_packet_len);
        let handle = IngestionServer::start(&self.config.listener, protocol, handler).await?;
        Ok(self.listener.insert(handle))
    }

    pub fn listener(&self) -> Option<&ServerHandle> {
        self.listener.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<QueueGateway>> {
        self.queue.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<StoreGateway>> {
        self.store.as_ref()
    }

    pub fn dispatcher(&self) -> Option<&DispatchHandle> {
        self.dispatcher.as_ref()
    }

    /// Look up a resource by name: `listener` (or `sock`), `queue` (or
    /// `beans`), `store` (or `ssdb`).
    pub fn resource(&self, name: &str) -> Option<Resource<'_>> {
        match name {
            "listener" | "sock" => self.listener().map(Resource::Listener),
            "queue" | "beans" => self.queue().map(Resource::Queue),
            "store" | "ssdb" => self.store().map(Resource::Store),
            _ => None,
        }
    }

    /// Stop the listener and the dispatcher. Gateways stay usable.
    pub fn shutdown(&self) {
        info!("Shutting down");
        if let Some(listener) = &self.listener {
            listener.shutdown();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }
    }

    /// Wait until the listener and the dispatcher have stopped.
    pub async fn wait(&self) {
        if let Some(listener) = &self.listener {
            listener.wait().await;
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.wait().await;
        }
    }
}
