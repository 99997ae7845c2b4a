//! Routing of decoded batches into the queue and the store.
//!
//! Listener callbacks must not block, so they only hand batches to a
//! [`DispatchSender`]. It pushes into a bounded channel and drops the batch
//! (with a warning) when the channel is full. A single dispatcher task drains
//! the channel, filters datapoints by name and delivers what remains to each
//! [`Route`] in order.

use async_trait::async_trait;
use glob::Pattern;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DispatchConfig, QueueConfig};
use crate::queue::QueueGateway;
use crate::server::DatapointHandler;
use crate::store::StoreGateway;
use crate::types::Datapoint;
use crate::{BellError, Result};

/// Destination for filtered batches.
#[async_trait]
pub trait Route: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Deliver a batch. Returns how many datapoints were accepted downstream.
    async fn deliver(&self, datapoints: &[Datapoint]) -> Result<usize>;
}

/// Puts one job per datapoint, with body `[name,[timestamp,value]]`.
#[derive(Debug)]
pub struct QueueRoute {
    gateway: Arc<QueueGateway>,
    priority: u32,
    delay: u32,
    ttr: u32,
}

impl QueueRoute {
    pub fn new(gateway: Arc<QueueGateway>, config: &QueueConfig) -> Self {
        Self { gateway, priority: config.priority, delay: config.delay, ttr: config.ttr }
    }
}

#[async_trait]
impl Route for QueueRoute {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn deliver(&self, datapoints: &[Datapoint]) -> Result<usize> {
        let mut delivered = 0;
        for datapoint in datapoints {
            let body = datapoint.to_json();
            match self.gateway.put_with(self.priority, self.delay, self.ttr, body.as_bytes()).await {
                Ok(id) => {
                    trace!("Queued {} as job {}", datapoint.name, id);
                    delivered += 1;
                }
                // A rejected job does not affect the rest of the batch.
                Err(e @ BellError::QueueProtocol { .. }) => {
                    warn!("Job for {} rejected: {}", datapoint.name, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(delivered)
    }
}

/// Adds each datapoint to the sorted set named after it, scored by timestamp,
/// with member `value:timestamp`.
#[derive(Debug)]
pub struct StoreRoute {
    store: Arc<StoreGateway>,
}

impl StoreRoute {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self { store }
    }

    fn member(datapoint: &Datapoint) -> String {
        format!("{}:{}", datapoint.value, datapoint.timestamp)
    }
}

#[async_trait]
impl Route for StoreRoute {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn deliver(&self, datapoints: &[Datapoint]) -> Result<usize> {
        for datapoint in datapoints {
            let score = i64::try_from(datapoint.timestamp).unwrap_or(i64::MAX);
            self.store.zadd(&datapoint.name, score, &Self::member(datapoint)).await?;
        }
        Ok(datapoints.len())
    }
}

/// Allow/ignore glob filter over datapoint names. Ignore wins.
#[derive(Debug, Clone)]
pub struct NameFilter {
    allow: Vec<Pattern>,
    ignore: Vec<Pattern>,
}

impl NameFilter {
    pub fn new(allow: &[String], ignore: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p).map_err(|e| {
                        BellError::config("dispatch", format!("invalid name pattern {p:?}: {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self { allow: compile(allow)?, ignore: compile(ignore)? })
    }

    pub fn accepts(&self, name: &str) -> bool {
        self.allow.iter().any(|p| p.matches(name)) && !self.ignore.iter().any(|p| p.matches(name))
    }
}

/// Counters of a running dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    forwarded: AtomicU64,
    filtered: AtomicU64,
    dropped_batches: AtomicU64,
    route_failures: AtomicU64,
}

impl DispatchStats {
    /// Datapoints handed to the routes
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Datapoints removed by the name filter
    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Batches dropped because the channel was full
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    /// Route deliveries that returned an error
    pub fn route_failures(&self) -> u64 {
        self.route_failures.load(Ordering::Relaxed)
    }
}

/// Non-blocking entry point into a dispatcher; use it as the listener's handler.
#[derive(Debug, Clone)]
pub struct DispatchSender {
    tx: mpsc::Sender<Vec<Datapoint>>,
    stats: Arc<DispatchStats>,
}

impl DatapointHandler for DispatchSender {
    fn on_datapoints(&self, datapoints: Vec<Datapoint>) {
        if datapoints.is_empty() {
            return;
        }
        match self.tx.try_send(datapoints) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                let dropped = self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Dispatch queue full, dropped batch of {} datapoints ({} batches dropped)",
                    batch.len(),
                    dropped
                );
            }
            Err(TrySendError::Closed(batch)) => {
                debug!("Dispatcher stopped, discarding batch of {} datapoints", batch.len());
            }
        }
    }
}

/// Spawns the dispatcher task
pub struct Dispatcher;

impl Dispatcher {
    /// Spawn a dispatcher for `routes` using the capacity and filter in `config`.
    pub fn spawn(config: &DispatchConfig, routes: Vec<Arc<dyn Route>>) -> Result<DispatchHandle> {
        let filter = NameFilter::new(&config.allow, &config.ignore)?;
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let stats = Arc::new(DispatchStats::default());
        let cancel = CancellationToken::new();
        let stopped = CancellationToken::new();

        let names: Vec<_> = routes.iter().map(|r| r.name()).collect();
        info!("Dispatching to {:?} with capacity {}", names, config.capacity);

        let task = DispatchLoop { rx, filter, routes, stats: Arc::clone(&stats) };
        let cancel_task = cancel.clone();
        let stopped_guard = stopped.clone().drop_guard();
        tokio::spawn(async move {
            let _stopped = stopped_guard;
            task.run(cancel_task).await;
        });

        Ok(DispatchHandle { sender: DispatchSender { tx, stats: Arc::clone(&stats) }, stats, cancel, stopped })
    }
}

struct DispatchLoop {
    rx: mpsc::Receiver<Vec<Datapoint>>,
    filter: NameFilter,
    routes: Vec<Arc<dyn Route>>,
    stats: Arc<DispatchStats>,
}

impl DispatchLoop {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.rx.recv() => batch,
            };
            match batch {
                Some(batch) => self.deliver(batch).await,
                None => break,
            }
        }

        // Deliver what was already accepted before stopping.
        self.rx.close();
        while let Some(batch) = self.rx.recv().await {
            self.deliver(batch).await;
        }
        info!("Dispatcher stopped, {} datapoints forwarded", self.stats.forwarded());
    }

    async fn deliver(&self, batch: Vec<Datapoint>) {
        let total = batch.len();
        let accepted: Vec<Datapoint> =
            batch.into_iter().filter(|dp| self.filter.accepts(&dp.name)).collect();
        self.stats.filtered.fetch_add((total - accepted.len()) as u64, Ordering::Relaxed);
        if accepted.is_empty() {
            return;
        }

        self.stats.forwarded.fetch_add(accepted.len() as u64, Ordering::Relaxed);
        for route in &self.routes {
            match route.deliver(&accepted).await {
                Ok(delivered) => trace!("Route {} took {}/{} datapoints", route.name(), delivered, accepted.len()),
                Err(e) => {
                    self.stats.route_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Route {} failed: {}", route.name(), e);
                }
            }
        }
    }
}

/// Handle to a running dispatcher.
///
/// Dropping the handle stops the dispatcher after it drains buffered batches.
#[derive(Debug)]
pub struct DispatchHandle {
    sender: DispatchSender,
    stats: Arc<DispatchStats>,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl DispatchHandle {
    /// A handler feeding this dispatcher
    pub fn sender(&self) -> DispatchSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the dispatcher task has finished.
    pub async fn wait(&self) {
        self.stopped.cancelled().await;
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
