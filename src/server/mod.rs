//! TCP ingestion server.
//!
//! [`IngestionServer::start`] binds a listener and spawns one task per
//! accepted connection. Each task owns a fresh
//! [`ConnectionFramer`](crate::framer::ConnectionFramer), decodes every
//! inbound chunk and hands the resulting batch to a [`DatapointHandler`].
//!
//! ```rust,no_run
//! use bell::config::ListenerConfig;
//! use bell::protocol::BellProtocol;
//! use bell::server::IngestionServer;
//!
//! # #[tokio::main]
//! # async fn main() -> bell::Result<()> {
//! let handle = IngestionServer::start(
//!     &ListenerConfig::default(),
//!     BellProtocol::default(),
//!     |datapoints: Vec<bell::Datapoint>| println!("{} datapoints", datapoints.len()),
//! )
//! .await?;
//!
//! println!("listening on {}", handle.local_addr());
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```

mod listener;
mod session;

pub use listener::{IngestionServer, ServerHandle};
pub use session::{ConnectionId, DIAGNOSTIC_PREFIX_LEN, SessionStats};

use crate::types::Datapoint;

/// Receiver of decoded batches.
///
/// Called once per successfully decoded chunk, possibly with an empty batch.
/// Calls for one connection arrive in byte order; calls for different
/// connections may interleave arbitrarily. Implementations must not block.
pub trait DatapointHandler: Send + Sync + 'static {
    fn on_datapoints(&self, datapoints: Vec<Datapoint>);
}

impl<F> DatapointHandler for F
where
    F: Fn(Vec<Datapoint>) + Send + Sync + 'static,
{
    fn on_datapoints(&self, datapoints: Vec<Datapoint>) {
        self(datapoints)
    }
}
