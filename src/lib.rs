//! Datapoint ingestion core for the bell metrics pipeline.
//!
//! Producers stream length-prefixed JSON packets of datapoints over TCP. Bell
//! reassembles packets that fragment arbitrarily across reads, decodes them,
//! and forwards the datapoints into a beanstalkd job queue and/or an
//! SSDB/Redis sorted-set store.
//!
//! # Features
//!
//! - **Stream framing**: One [`ConnectionFramer`] per connection carries the
//!   unresolved remainder between reads; malformed input resets it
//! - **Readiness gating**: Dependants suspend on a one-shot [`Readiness`]
//!   signal until the queue tube handshake completes
//! - **Fatal escalation**: Queue connection errors go to a [`FatalPolicy`]
//!   (process exit by default)
//! - **Pooled store**: Lazily connected, round-robin store connections
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bell::{BellConfig, Service};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     bell::logging::init("info");
//!     let service = Service::start(BellConfig::load("bell.yml")?).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.shutdown();
//!     service.wait().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
pub mod fatal;
pub mod gate;
pub mod types;

// Decoding
pub mod framer;
pub mod protocol;

// Network surfaces
pub mod dispatch;
pub mod queue;
pub mod server;
pub mod store;

// Composition and ambient setup
pub mod config;
pub mod logging;
pub mod service;

#[cfg(test)]
mod test_utils;

// Core exports
pub use error::*;
pub use fatal::{ExitProcess, FatalPolicy};
pub use gate::{Readiness, ReadinessGate};
pub use types::*;

pub use config::BellConfig;
pub use framer::ConnectionFramer;
pub use queue::{QueueGateway, QueueMode, QueueState};
pub use server::{IngestionServer, ServerHandle};
pub use service::{Resource, Service};
pub use store::StoreGateway;
