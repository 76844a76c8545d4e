//! Thin wrapper around a pooled async Redis connection, the single shared
//! store that Queue Fabric, Lock Service, and the cache helpers all sit on
//! top of (§5: "the only globally mutable surface").

use redis::aio::ConnectionManager;

use crate::error::Result;

#[derive(Clone)]
pub struct RedisStore {
  manager: ConnectionManager,
}

impl RedisStore {
  pub async fn connect(url: &str) -> Result<Self> {
    let client = redis::Client::open(url)?;
    let manager = client.get_connection_manager().await?;
    return Ok(Self { manager });
  }

  /// `ConnectionManager` is itself cheaply cloneable and multiplexes
  /// concurrent requests over one connection, reconnecting transparently.
  pub async fn connection(&self) -> Result<ConnectionManager> {
    return Ok(self.manager.clone());
  }

  /// Flushes every key in the connected Redis database: queues, delay sets,
  /// locks, the shared cache, and heartbeats alike. Used only by the
  /// `admin-tool clear-redis` maintenance command (§6) — nothing in the
  /// scheduling/execution engine itself ever calls this.
  pub async fn flush_all(&self) -> Result<()> {
    let mut conn = self.connection().await?;
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
    return Ok(());
  }
}
