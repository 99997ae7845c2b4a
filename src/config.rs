//! Service configuration.
//!
//! Configuration is read from YAML. Every field has a default, so an empty
//! file (or no file) yields a working local setup:
//!
//! ```rust
//! use bell::config::{BellConfig, RouteKind};
//!
//! let config = BellConfig::from_yaml(
//!     r#"
//! listener:
//!   port: 2025
//! queue:
//!   tube: metrics
//! dispatch:
//!   routes: [queue, store]
//!   ignore: ["statsd.*"]
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.listener.port, 2025);
//! assert_eq!(config.listener.host, "0.0.0.0");
//! assert_eq!(config.queue.tube, "metrics");
//! assert_eq!(config.store.pool_size, 10);
//! assert_eq!(config.dispatch.routes, vec![RouteKind::Queue, RouteKind::Store]);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::framer::DEFAULT_MAX_REMAINDER;
use crate::protocol::{DEFAULT_MAX_PACKET_LEN, max_frame_len};
use crate::{BellError, Result};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BellConfig {
    pub listener: ListenerConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub dispatch: DispatchConfig,
}

/// Ingestion listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Cap on a connection's unresolved remainder, in bytes. Must hold one
    /// packet of `max_packet_len` plus its length header.
    pub max_remainder: usize,
    /// Largest packet payload accepted, in bytes
    pub max_packet_len: usize,
    /// Size of each transport read, in bytes
    pub read_buffer: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2024,
            max_remainder: DEFAULT_MAX_REMAINDER,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            read_buffer: 64 * 1024,
        }
    }
}

impl ListenerConfig {
    /// `host:port` string to bind
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Job queue (beanstalkd) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub host: String,
    pub port: u16,
    pub tube: String,
    /// Connect plus handshake deadline; `null` waits forever
    pub connect_timeout_ms: Option<u64>,
    /// Priority for jobs put by the queue route
    pub priority: u32,
    /// Delay in seconds for jobs put by the queue route
    pub delay: u32,
    /// Time-to-run in seconds for jobs put by the queue route
    pub ttr: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11300,
            tube: "bell".to_string(),
            connect_timeout_ms: Some(10_000),
            priority: 0,
            delay: 0,
            ttr: 60,
        }
    }
}

impl QueueConfig {
    /// `host:port` string of the broker
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect deadline, if any
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Key-value store (ssdb) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8888, pool_size: 10 }
    }
}

impl StoreConfig {
    /// Connection URL understood by the store client
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Where decoded datapoints are forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// One beanstalkd job per datapoint
    Queue,
    /// One sorted-set entry per datapoint
    Store,
}

/// Routing of decoded batches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Batches buffered between the listener and the routes
    pub capacity: usize,
    pub routes: Vec<RouteKind>,
    /// Glob patterns a datapoint name must match to be forwarded
    pub allow: Vec<String>,
    /// Glob patterns that exclude a datapoint even if allowed
    pub ignore: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            routes: vec![RouteKind::Queue],
            allow: vec!["*".to_string()],
            ignore: Vec::new(),
        }
    }
}

impl BellConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|e| BellError::config(path, e.to_string()))?;
        Self::parse(&text).map_err(|details| BellError::config(path, details))
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Self::parse(text).map_err(|details| BellError::config("<inline>", details))
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let config: BellConfig = if text.trim().is_empty() {
            BellConfig::default()
        } else {
            serde_yaml_ng::from_str(text).map_err(|e| e.to_string())?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.store.pool_size == 0 {
            return Err("store.pool_size must be at least 1".to_string());
        }
        if self.dispatch.capacity == 0 {
            return Err("dispatch.capacity must be at least 1".to_string());
        }
        if self.listener.read_buffer == 0 {
            return Err("listener.read_buffer must be at least 1".to_string());
        }
        let frame = max_frame_len(self.listener.max_packet_len);
        if self.listener.max_remainder < frame {
            return Err(format!(
                "listener.max_remainder ({}) must be at least {} to hold a packet of listener.max_packet_len ({})",
                self.listener.max_remainder, frame, self.listener.max_packet_len
            ));
        }
        validate_tube(&self.queue.tube)?;
        for pattern in self.dispatch.allow.iter().chain(&self.dispatch.ignore) {
            glob::Pattern::new(pattern)
                .map_err(|e| format!("invalid name pattern {pattern:?}: {e}"))?;
        }
        Ok(())
    }
}

/// Tube names are 1-200 bytes of `A-Za-z0-9-+/;.$_()` and may not start with `-`.
fn validate_tube(tube: &str) -> std::result::Result<(), String> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c);
    if tube.is_empty() || tube.len() > 200 || tube.starts_with('-') || !tube.chars().all(valid_char)
    {
        return Err(format!("invalid tube name {tube:?}"));
    }
    Ok(())
}
