//! Error types for datapoint ingestion.
//!
//! All errors implement `std::error::Error` and carry enough context to be
//! logged without further decoration.
//!
//! ## Error Categories
//!
//! - **Framing Errors**: A chunk could not be resolved into datapoints. The chunk
//!   is dropped and the connection's framer is reset.
//! - **Listener Errors**: Bind or accept failures. Non-fatal to the process, but
//!   the affected listener stops taking new connections.
//! - **Queue Connection Errors**: Any transport failure on the broker connection.
//!   These are fatal and are handed to a [`FatalPolicy`](crate::FatalPolicy).
//! - **Queue Protocol Errors**: Negative broker responses such as `JOB_TOO_BIG`.
//! - **Store Errors**: Propagated to the caller unchanged.
//!
//! ```rust
//! use bell::BellError;
//!
//! let error = BellError::queue_connection_failed("broker closed the connection");
//! assert!(error.is_fatal());
//! assert!(!error.is_retryable());
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T, E = BellError> = std::result::Result<T, E>;

/// A chunk (plus any buffered remainder) could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FramingError {
    #[error("Invalid packet header: {details}")]
    InvalidHeader { details: String },

    #[error("Packet of {declared} bytes exceeds limit of {limit} bytes")]
    PacketTooLarge { declared: usize, limit: usize },

    #[error("Invalid packet payload: {details}")]
    InvalidPayload { details: String },

    #[error("Unresolved remainder of {len} bytes exceeds limit of {limit} bytes")]
    RemainderOverflow { len: usize, limit: usize },
}

/// Main error type for ingestion, queue and store operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BellError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Listener error on {addr}: {operation}")]
    Listener {
        addr: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue connection failed: {reason}")]
    QueueConnection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Queue command '{command}' rejected: {response}")]
    QueueProtocol { command: String, response: String },

    #[error("Queue gateway is {state}: {details}")]
    QueueState { state: String, details: String },

    #[error("Store operation '{operation}' failed")]
    Store {
        operation: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("Configuration error in {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },
}

impl BellError {
    /// Returns whether the process should stop rather than continue degraded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BellError::QueueConnection { .. })
    }

    /// Returns whether the operation may succeed if simply attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BellError::Framing(_) => false,
            BellError::Listener { .. } => true,
            BellError::QueueConnection { .. } => false,
            BellError::QueueProtocol { .. } => false,
            BellError::QueueState { .. } => false,
            BellError::Store { source, .. } => {
                source.is_io_error() || source.is_timeout() || source.is_connection_dropped()
            }
            BellError::Config { .. } => false,
            BellError::Timeout { .. } => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BellError::Framing(_) => vec![
                "Check that producers emit length-prefixed JSON packets",
                "Inspect the logged chunk prefix for the offending producer",
            ],
            BellError::Listener { .. } => vec![
                "Check that the listen address is not already in use",
                "Verify permissions for binding the configured port",
                "Restart the listener",
            ],
            BellError::QueueConnection { .. } => vec![
                "Ensure beanstalkd is running and reachable",
                "Check the queue host and port in the configuration",
                "Let the process supervisor restart the service",
            ],
            BellError::QueueProtocol { .. } => vec![
                "Check the job size against the broker's max-job-size",
                "Verify the job id is still reserved by this connection",
            ],
            BellError::QueueState { .. } => vec![
                "Await queue readiness before issuing commands",
                "Create a new gateway instead of reconnecting an existing one",
            ],
            BellError::Store { .. } => vec![
                "Ensure ssdb is running and reachable",
                "Check the store host, port and pool size",
                "Retry the operation",
            ],
            BellError::Config { .. } => vec![
                "Check the configuration file exists and is readable",
                "Validate the YAML syntax and field names",
            ],
            BellError::Timeout { .. } => {
                vec!["Increase the configured timeout", "Check network reachability"]
            }
        }
    }

    /// Helper constructor for bind failures.
    pub fn bind_failed(addr: impl Into<String>, source: std::io::Error) -> Self {
        BellError::Listener { addr: addr.into(), operation: "bind", source }
    }

    /// Helper constructor for accept failures.
    pub fn accept_failed(addr: SocketAddr, source: std::io::Error) -> Self {
        BellError::Listener { addr: addr.to_string(), operation: "accept", source }
    }

    /// Helper constructor for queue connection errors.
    pub fn queue_connection_failed(reason: impl Into<String>) -> Self {
        BellError::QueueConnection { reason: reason.into(), source: None }
    }

    /// Helper constructor for queue connection errors with source.
    pub fn queue_connection_failed_with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BellError::QueueConnection { reason: reason.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for negative broker responses.
    pub fn queue_rejected(command: impl Into<String>, response: impl Into<String>) -> Self {
        BellError::QueueProtocol { command: command.into(), response: response.into() }
    }

    /// Helper constructor for gateway misuse.
    pub fn queue_state(state: impl ToString, details: impl Into<String>) -> Self {
        BellError::QueueState { state: state.to_string(), details: details.into() }
    }

    /// Helper constructor for store errors.
    pub fn store(operation: impl Into<String>, source: redis::RedisError) -> Self {
        BellError::Store { operation: operation.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        BellError::Config { path: path.into(), details: details.into() }
    }
}
