//! Gateway owning the broker connection and its readiness gate

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::client::{BeanstalkClient, Job};
use super::{QueueMode, QueueState};
use crate::config::QueueConfig;
use crate::fatal::{ExitProcess, FatalPolicy};
use crate::gate::{Readiness, ReadinessGate};
use crate::{BellError, Result};

/// Shared handle to the process's job queue connection.
///
/// Commands are serialized through one connection; a consumer blocked in
/// [`reserve`](Self::reserve) holds it until a job arrives. Between commands
/// a background task watches the idle connection, so a broker that goes away
/// is escalated even when nothing is being sent.
pub struct QueueGateway {
    config: QueueConfig,
    mode: OnceLock<QueueMode>,
    state: watch::Sender<QueueState>,
    gate: ReadinessGate,
    link: Arc<Link>,
    fatal: Arc<dyn FatalPolicy>,
    cancel: CancellationToken,
}

/// Broker connection shared by commands and the idle watch.
#[derive(Default)]
struct Link {
    client: Mutex<Option<BeanstalkClient>>,
    /// Commands waiting for or holding the client
    pending: AtomicUsize,
    /// Signalled when a command wants the client
    wanted: Notify,
    /// Signalled when the last pending command finishes
    released: Notify,
}

impl Link {
    async fn acquire(&self) -> Command<'_> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let pending = Pending(self);
        self.wanted.notify_one();
        Command { slot: self.client.lock().await, _pending: pending }
    }
}

struct Pending<'a>(&'a Link);

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.released.notify_one();
        }
    }
}

/// Exclusive use of the client for one command.
///
/// The lock is released before the pending count drops.
struct Command<'a> {
    slot: MutexGuard<'a, Option<BeanstalkClient>>,
    _pending: Pending<'a>,
}

impl std::fmt::Debug for QueueGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueGateway")
            .field("addr", &self.config.addr())
            .field("tube", &self.config.tube)
            .field("mode", &self.mode.get())
            .field("state", &self.state())
            .finish()
    }
}

impl QueueGateway {
    /// Create a disconnected gateway that exits the process on connection errors.
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Self::with_fatal_policy(config, ExitProcess::default())
    }

    /// Create a disconnected gateway with a custom escalation policy.
    pub fn with_fatal_policy(config: QueueConfig, fatal: impl FatalPolicy) -> Arc<Self> {
        let (state, _) = watch::channel(QueueState::Disconnected);
        Arc::new(Self {
            config,
            mode: OnceLock::new(),
            state,
            gate: ReadinessGate::new(),
            link: Arc::new(Link::default()),
            fatal: Arc::new(fatal),
            cancel: CancellationToken::new(),
        })
    }

    /// Start connecting in `mode` and return the readiness signal.
    ///
    /// The connect and tube handshake run in a spawned task; the returned
    /// [`Readiness`] resolves once they complete. Any failure on the way is
    /// escalated through the fatal policy and also fails the readiness signal.
    /// Only the first call on a gateway is accepted.
    pub fn connect(self: &Arc<Self>, mode: QueueMode) -> Result<Readiness> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == QueueState::Disconnected {
                *state = QueueState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(BellError::queue_state(
                self.state(),
                "connect may only be called once per gateway",
            ));
        }

        let _ = self.mode.set(mode);
        info!("Connecting to beanstalkd at {} as {}", self.config.addr(), mode);

        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.establish(mode).await });

        Ok(self.gate.waiter())
    }

    async fn establish(self: Arc<Self>, mode: QueueMode) {
        let addr = self.config.addr();
        let handshake = handshake(&addr, &self.config.tube, mode);

        let result = match self.config.connect_timeout() {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(result) => result,
                Err(_) => Err(BellError::queue_connection_failed_with_source(
                    format!("connect to {addr}"),
                    BellError::Timeout { duration: limit },
                )),
            },
            None => handshake.await,
        };

        match result {
            Ok(client) => {
                *self.link.client.lock().await = Some(client);
                self.state.send_replace(QueueState::Ready);
                match mode {
                    QueueMode::Producer => {
                        info!("Beanstalkd connected, using tube {}", self.config.tube)
                    }
                    QueueMode::Consumer => {
                        info!("Beanstalkd connected, watching tube {}", self.config.tube)
                    }
                }
                self.gate.open();
                tokio::spawn(watch_idle(
                    Arc::clone(&self.link),
                    Arc::downgrade(&self),
                    self.cancel.clone(),
                ));
            }
            Err(e) if e.is_fatal() => self.fail(e),
            Err(e) => self.fail(BellError::queue_connection_failed_with_source("tube handshake", e)),
        }
    }

    fn fail(&self, error: BellError) {
        self.state.send_replace(QueueState::Failed);
        self.gate.fail(error.to_string());
        error!("Beanstalkd connection error: {}", error);
        self.fatal.escalate(error);
    }

    /// Suspend until the connection is ready.
    ///
    /// Fails if the connection failed, or if the gateway was never connected
    /// and is dropped.
    pub async fn ready(&self) -> Result<()> {
        self.gate.wait().await
    }

    /// Current connection state
    pub fn state(&self) -> QueueState {
        *self.state.borrow()
    }

    /// Stream of connection states, starting with the current one.
    ///
    /// Rapid transitions may be coalesced; the latest state is always seen.
    pub fn state_updates(&self) -> WatchStream<QueueState> {
        WatchStream::new(self.state.subscribe())
    }

    /// Mode passed to [`connect`](Self::connect), if any
    pub fn mode(&self) -> Option<QueueMode> {
        self.mode.get().copied()
    }

    /// Tube used or watched
    pub fn tube(&self) -> &str {
        &self.config.tube
    }

    /// Put a job with the configured priority, delay and ttr.
    pub async fn put(&self, body: &[u8]) -> Result<u64> {
        let QueueConfig { priority, delay, ttr, .. } = self.config;
        self.put_with(priority, delay, ttr, body).await
    }

    /// Put a job with explicit priority, delay and ttr (seconds).
    pub async fn put_with(&self, priority: u32, delay: u32, ttr: u32, body: &[u8]) -> Result<u64> {
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.put(priority, delay, ttr, body).await;
        self.settle(&mut command.slot, result)
    }

    /// Reserve the next job, waiting as long as it takes.
    pub async fn reserve(&self) -> Result<Job> {
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.reserve().await;
        self.settle(&mut command.slot, result)
    }

    /// Reserve the next job, giving up after `timeout` (whole seconds).
    pub async fn reserve_with_timeout(&self, timeout: Duration) -> Result<Option<Job>> {
        let seconds = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.reserve_with_timeout(seconds).await;
        self.settle(&mut command.slot, result)
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.delete(id).await;
        self.settle(&mut command.slot, result)
    }

    pub async fn release(&self, id: u64, priority: u32, delay: u32) -> Result<()> {
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.release(id, priority, delay).await;
        self.settle(&mut command.slot, result)
    }

    pub async fn bury(&self, id: u64, priority: u32) -> Result<()> {
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.bury(id, priority).await;
        self.settle(&mut command.slot, result)
    }

    pub async fn touch(&self, id: u64) -> Result<()> {
        let mut command = self.link.acquire().await;
        let client = self.connected(&mut command.slot)?;
        let result = client.touch(id).await;
        self.settle(&mut command.slot, result)
    }

    fn connected<'a>(&self, slot: &'a mut Option<BeanstalkClient>) -> Result<&'a mut BeanstalkClient> {
        match slot.as_mut() {
            Some(client) => Ok(client),
            None => match self.state() {
                QueueState::Failed => {
                    Err(BellError::queue_state(QueueState::Failed, "broker connection was lost"))
                }
                state => Err(BellError::queue_state(state, "await readiness before issuing commands")),
            },
        }
    }

    /// Escalate connection-level failures and drop the dead client.
    ///
    /// The caller receives a summary of the error; the policy receives the
    /// original.
    fn settle<T>(&self, slot: &mut Option<BeanstalkClient>, result: Result<T>) -> Result<T> {
        match result {
            Err(e) if e.is_fatal() => {
                slot.take();
                let summary = BellError::queue_connection_failed(e.to_string());
                self.fail(e);
                Err(summary)
            }
            Err(e) => {
                debug!("Beanstalkd rejected command: {}", e);
                Err(e)
            }
            ok => ok,
        }
    }
}

impl Drop for QueueGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Hold the client while no command needs it and escalate if the broker
/// drops the connection in the meantime.
async fn watch_idle(link: Arc<Link>, gateway: Weak<QueueGateway>, cancel: CancellationToken) {
    let error = loop {
        while link.pending.load(Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = link.released.notified() => {}
            }
        }

        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return,
            slot = link.client.lock() => slot,
        };
        if link.pending.load(Ordering::SeqCst) > 0 {
            continue;
        }
        // A failed command already dropped the connection.
        let Some(client) = slot.as_mut() else { return };

        let lost = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = link.wanted.notified() => None,
            error = client.lost() => Some(error),
        };
        if let Some(error) = lost {
            slot.take();
            break error;
        }
    };

    if let Some(gateway) = gateway.upgrade() {
        gateway.fail(error);
    }
}

async fn handshake(addr: &str, tube: &str, mode: QueueMode) -> Result<BeanstalkClient> {
    let mut client = BeanstalkClient::connect(addr).await?;
    match mode {
        QueueMode::Producer => {
            client.use_tube(tube).await?;
        }
        QueueMode::Consumer => {
            client.watch(tube).await?;
            if tube != "default" {
                client.ignore("default").await?;
            }
        }
    }
    Ok(client)
}
