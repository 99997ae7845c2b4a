//! Key-value store access.
//!
//! [`StoreGateway`] wraps a Redis-protocol client (SSDB speaks the same wire
//! format) behind a fixed-size pool of lazily established multiplexed
//! connections. A connection that fails with an I/O error is evicted from its
//! slot and reopened on the next use of that slot. Every store operation is an `async fn` that returns the
//! client's reply, or a [`BellError::Store`] carrying the client error.
//! Store errors are never escalated; the caller decides what to do.
//!
//! ```rust,no_run
//! use bell::config::StoreConfig;
//! use bell::store::StoreGateway;
//!
//! # #[tokio::main]
//! # async fn main() -> bell::Result<()> {
//! let store = StoreGateway::create_client(&StoreConfig::default())?;
//! store.zadd("cpu.load", 1412762335, "0.42:1412762335").await?;
//! let points = store.zrange_by_score("cpu.load", 0, i64::MAX).await?;
//! # Ok(())
//! # }
//! ```

use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, RedisError, RedisResult, ToRedisArgs};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::{BellError, Result};

/// Pooled store client.
pub struct StoreGateway {
    client: Client,
    addr: String,
    pool: Vec<Mutex<Option<MultiplexedConnection>>>,
    next: AtomicUsize,
}

impl std::fmt::Debug for StoreGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGateway")
            .field("addr", &self.addr)
            .field("pool_size", &self.pool.len())
            .field("established", &self.established())
            .finish()
    }
}

impl StoreGateway {
    /// Create a client for `config`. No connection is opened until first use.
    pub fn create_client(config: &StoreConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let client = Client::open(config.url()).map_err(|e| BellError::store("open", e))?;
        let pool = (0..config.pool_size.max(1)).map(|_| Mutex::new(None)).collect();
        debug!("Store client for {} with pool size {}", addr, config.pool_size);
        Ok(Self { client, addr, pool, next: AtomicUsize::new(0) })
    }

    /// Number of pool slots
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Number of pool slots with an open connection
    pub fn established(&self) -> usize {
        self.pool
            .iter()
            .filter(|slot| slot.try_lock().is_ok_and(|connection| connection.is_some()))
            .count()
    }

    async fn connection(&self) -> RedisResult<(usize, MultiplexedConnection)> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let mut slot = self.pool[index].lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok((index, connection.clone()));
        }
        debug!("Opening store connection {} to {}", index, self.addr);
        let connection = self.client.get_multiplexed_async_connection().await?;
        Ok((index, slot.insert(connection).clone()))
    }

    async fn evict(&self, index: usize, error: &RedisError) {
        if error.is_io_error() || error.is_connection_dropped() {
            warn!("Store connection {} to {} lost: {}", index, self.addr, error);
            self.pool[index].lock().await.take();
        }
    }

    async fn run<T: FromRedisValue>(&self, operation: &'static str, cmd: &Cmd) -> Result<T> {
        let (index, mut connection) =
            self.connection().await.map_err(|e| BellError::store(operation, e))?;
        match cmd.query_async(&mut connection).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.evict(index, &e).await;
                Err(BellError::store(operation, e))
            }
        }
    }

    /// Issue any store command and convert its reply.
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        self.run("query", cmd).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.run("get", redis::cmd("GET").arg(key)).await
    }

    pub async fn set<V: ToRedisArgs>(&self, key: &str, value: V) -> Result<()> {
        self.run("set", redis::cmd("SET").arg(key).arg(value)).await
    }

    /// Set `key` with a time-to-live in seconds.
    pub async fn setx<V: ToRedisArgs>(&self, key: &str, value: V, ttl: u64) -> Result<()> {
        self.run("setx", redis::cmd("SETEX").arg(key).arg(ttl).arg(value)).await
    }

    /// Returns whether the key existed.
    pub async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.run("del", redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.run("exists", redis::cmd("EXISTS").arg(key)).await
    }

    /// Add `by` to an integer value. Returns the new value.
    pub async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        self.run("incr", redis::cmd("INCRBY").arg(key).arg(by)).await
    }

    /// Returns whether a ttl was set.
    pub async fn expire(&self, key: &str, ttl: u64) -> Result<bool> {
        self.run("expire", redis::cmd("EXPIRE").arg(key).arg(ttl)).await
    }

    /// Remaining time-to-live in seconds; negative when the key has none.
    pub async fn ttl(&self, key: &str) -> Result<i64> {
        self.run("ttl", redis::cmd("TTL").arg(key)).await
    }

    pub async fn hget(&self, name: &str, key: &str) -> Result<Option<String>> {
        self.run("hget", redis::cmd("HGET").arg(name).arg(key)).await
    }

    pub async fn hset<V: ToRedisArgs>(&self, name: &str, key: &str, value: V) -> Result<()> {
        let _: i64 = self.run("hset", redis::cmd("HSET").arg(name).arg(key).arg(value)).await?;
        Ok(())
    }

    pub async fn hdel(&self, name: &str, key: &str) -> Result<bool> {
        let removed: i64 = self.run("hdel", redis::cmd("HDEL").arg(name).arg(key)).await?;
        Ok(removed > 0)
    }

    pub async fn hgetall(&self, name: &str) -> Result<HashMap<String, String>> {
        self.run("hgetall", redis::cmd("HGETALL").arg(name)).await
    }

    /// Number of fields in a hash
    pub async fn hsize(&self, name: &str) -> Result<u64> {
        self.run("hsize", redis::cmd("HLEN").arg(name)).await
    }

    /// Add or update a sorted-set member. Returns whether it was new.
    pub async fn zadd(&self, name: &str, score: i64, member: &str) -> Result<bool> {
        let added: i64 = self.run("zadd", redis::cmd("ZADD").arg(name).arg(score).arg(member)).await?;
        Ok(added > 0)
    }

    pub async fn zscore(&self, name: &str, member: &str) -> Result<Option<i64>> {
        self.run("zscore", redis::cmd("ZSCORE").arg(name).arg(member)).await
    }

    pub async fn zrem(&self, name: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.run("zrem", redis::cmd("ZREM").arg(name).arg(member)).await?;
        Ok(removed > 0)
    }

    /// Number of members in a sorted set
    pub async fn zsize(&self, name: &str) -> Result<u64> {
        self.run("zsize", redis::cmd("ZCARD").arg(name)).await
    }

    /// Members with `min <= score <= max`, lowest score first.
    pub async fn zrange_by_score(&self, name: &str, min: i64, max: i64) -> Result<Vec<String>> {
        self.run("zrange_by_score", redis::cmd("ZRANGEBYSCORE").arg(name).arg(min).arg(max)).await
    }

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    pub async fn zrem_range_by_score(&self, name: &str, min: i64, max: i64) -> Result<u64> {
        self.run("zrem_range_by_score", redis::cmd("ZREMRANGEBYSCORE").arg(name).arg(min).arg(max))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeStore, unused_addr};
    use std::net::SocketAddr;

    fn config_for(store: &FakeStore, pool_size: usize) -> StoreConfig {
        StoreConfig { host: store.host(), port: store.port(), pool_size }
    }

    #[tokio::test]
    async fn connections_open_lazily_and_rotate() {
        let store = FakeStore::start().await;
        let gateway = StoreGateway::create_client(&config_for(&store, 2)).unwrap();
        assert_eq!(gateway.pool_size(), 2);
        assert_eq!(gateway.established(), 0);
        assert_eq!(store.connections(), 0);

        for i in 0..4 {
            gateway.set(&format!("key.{i}"), i).await.unwrap();
        }
        assert_eq!(gateway.established(), 2);
        assert_eq!(store.connections(), 2);
    }

    #[tokio::test]
    async fn operations_return_replies() {
        let store = FakeStore::start().await;
        let gateway = StoreGateway::create_client(&config_for(&store, 1)).unwrap();

        assert_eq!(gateway.get("missing").await.unwrap(), None);
        gateway.set("greeting", "hello").await.unwrap();
        assert_eq!(gateway.get("greeting").await.unwrap(), Some("hello".to_string()));

        assert!(gateway.zadd("cpu.load", 1000, "0.42:1000").await.unwrap());
        let zadd = store.commands().into_iter().find(|c| c[0] == "ZADD").unwrap();
        assert_eq!(zadd, vec!["ZADD", "cpu.load", "1000", "0.42:1000"]);
    }

    #[tokio::test]
    async fn unreachable_store_is_a_propagated_store_error() {
        let addr: SocketAddr = unused_addr().parse().unwrap();
        let config = StoreConfig { host: addr.ip().to_string(), port: addr.port(), pool_size: 1 };
        let gateway = StoreGateway::create_client(&config).unwrap();

        let err = gateway.get("anything").await.unwrap_err();
        assert!(matches!(err, BellError::Store { ref operation, .. } if operation == "get"));
        assert!(!err.is_fatal());
        assert_eq!(gateway.established(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_is_reopened() {
        let store = FakeStore::closing_first_connection_after(1).await;
        let gateway = StoreGateway::create_client(&config_for(&store, 1)).unwrap();
        gateway.set("first", 1).await.unwrap();

        // The call that finds the connection closed fails; a later one reconnects.
        let mut recovered = false;
        for i in 0..5 {
            match gateway.set(&format!("retry.{i}"), i).await {
                Ok(()) => {
                    recovered = true;
                    break;
                }
                Err(e) => assert!(matches!(e, BellError::Store { .. })),
            }
        }
        assert!(recovered);
        assert_eq!(store.connections(), 2);
        assert_eq!(gateway.established(), 1);
    }

    #[test]
    fn zero_pool_size_still_has_one_slot() {
        let config = StoreConfig { pool_size: 0, ..StoreConfig::default() };
        assert_eq!(StoreGateway::create_client(&config).unwrap().pool_size(), 1);
    }
}
