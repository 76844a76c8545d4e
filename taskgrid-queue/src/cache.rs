//! Shared-cache helpers layered on the Redis store: the MD5 index mirror
//! consulted by the Script Loader (§4.E), dynamic cron-expression overrides
//! and pause flags consulted by the Cron Job Starter (§4.J), and the
//! per-queue admission limits published by `UpdateWorkerQueueLimit` (§4.K,
//! §10.E).

use redis::AsyncCommands;

use crate::error::Result;
use crate::keys::Keys;
use crate::store::RedisStore;

#[derive(Clone)]
pub struct SharedCache {
  store: RedisStore,
  keys: std::sync::Arc<Keys>,
}

impl SharedCache {
  pub fn new(store: RedisStore, keys: std::sync::Arc<Keys>) -> Self {
    return Self { store, keys };
  }

  // --- MD5 index (script/connector/envVariable content hashes) -----------------------------------------------------------

  pub async fn get_md5(&self, data_type: &str, entity_id: &str) -> Result<Option<String>> {
    let mut conn = self.store.connection().await?;
    let value: Option<String> = conn
      .hget(self.keys.md5_index(data_type), entity_id)
      .await?;
    return Ok(value);
  }

  pub async fn set_md5(&self, data_type: &str, entity_id: &str, md5: &str) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let _: () = conn
      .hset(self.keys.md5_index(data_type), entity_id, md5)
      .await?;
    return Ok(());
  }

  pub async fn replace_all_md5(&self, data_type: &str, entries: &[(String, String)]) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let key = self.keys.md5_index(data_type);
    let _: () = conn.del(&key).await?;
    if !entries.is_empty() {
      let _: () = conn.hset_multiple(&key, entries).await?;
    }
    return Ok(());
  }

  // --- Pause flags -----------------------------------------------------------

  pub async fn pause_all_cron_jobs(&self) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let set: bool = conn.exists(self.keys.pause_all_cron_jobs()).await?;
    return Ok(set);
  }

  pub async fn set_pause_all_cron_jobs(&self, paused: bool) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let key = self.keys.pause_all_cron_jobs();
    if paused {
      let _: () = conn.set(key, 1).await?;
    } else {
      let _: () = conn.del(key).await?;
    }
    return Ok(());
  }

  /// `None` means not paused. `expire_time` (if any) is honored by the store
  /// itself via `EXPIREAT`; callers don't need to check it separately.
  pub async fn cron_job_paused(&self, cron_job_id: &str) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let set: bool = conn.exists(self.keys.cron_job_pause(cron_job_id)).await?;
    return Ok(set);
  }

  pub async fn set_cron_job_pause(&self, cron_job_id: &str, expire_at: Option<i64>) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let key = self.keys.cron_job_pause(cron_job_id);
    let _: () = conn.set(&key, 1).await?;
    if let Some(expire_at) = expire_at {
      let _: () = conn.expire_at(&key, expire_at).await?;
    }
    return Ok(());
  }

  pub async fn clear_cron_job_pause(&self, cron_job_id: &str) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let _: () = conn.del(self.keys.cron_job_pause(cron_job_id)).await?;
    return Ok(());
  }

  // --- Dynamic cron expression override -----------------------------------------------------------

  pub async fn dynamic_cron_expr(&self, cron_job_id: &str) -> Result<Option<String>> {
    let mut conn = self.store.connection().await?;
    let value: Option<String> = conn.get(self.keys.cron_job_dynamic_expr(cron_job_id)).await?;
    return Ok(value);
  }

  pub async fn set_dynamic_cron_expr(
    &self,
    cron_job_id: &str,
    expr: &str,
    expire_at: Option<i64>,
  ) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let key = self.keys.cron_job_dynamic_expr(cron_job_id);
    let _: () = conn.set(&key, expr).await?;
    if let Some(expire_at) = expire_at {
      let _: () = conn.expire_at(&key, expire_at).await?;
    }
    return Ok(());
  }

  // --- Restart-all-workers flag (§4.H) -----------------------------------------------------------

  /// Set by an operator action (e.g. publishing a new build) to tell every
  /// Worker supervisor to recycle its pool on its next idle check.
  pub async fn restart_all_workers(&self) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let set: bool = conn.exists(self.keys.restart_all_workers()).await?;
    return Ok(set);
  }

  pub async fn set_restart_all_workers(&self, set: bool) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let key = self.keys.restart_all_workers();
    if set {
      let _: () = conn.set(key, 1).await?;
    } else {
      let _: () = conn.del(key).await?;
    }
    return Ok(());
  }

  // --- Heartbeats (§4.L) -----------------------------------------------------------

  pub async fn set_heartbeat(&self, field: &str, payload_json: &str) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let _: () = conn.hset(self.keys.heartbeats_hash(), field, payload_json).await?;
    return Ok(());
  }

  pub async fn list_heartbeats(&self) -> Result<Vec<(String, String)>> {
    let mut conn = self.store.connection().await?;
    let entries: Vec<(String, String)> = conn.hgetall(self.keys.heartbeats_hash()).await?;
    return Ok(entries);
  }

  pub async fn remove_heartbeat(&self, field: &str) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let _: () = conn.hdel(self.keys.heartbeats_hash(), field).await?;
    return Ok(());
  }

  // --- Store-wide stats (SystemMetric, §4.K) -----------------------------------------------------------

  /// `(used_memory_bytes, key_count)` of the shared store, for `SystemMetric`.
  pub async fn store_stats(&self) -> Result<(i64, i64)> {
    let mut conn = self.store.connection().await?;
    let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
    let used_memory = info
      .lines()
      .find_map(|line| line.strip_prefix("used_memory:"))
      .and_then(|v| v.trim().parse::<i64>().ok())
      .unwrap_or(0);
    let key_count: i64 = conn.dbsize().await?;
    return Ok((used_memory, key_count));
  }

  // --- Generic user cache (Function Runtime's CACHE capability) -----------------------------------------------------------

  pub async fn user_cache_get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
    let mut conn = self.store.connection().await?;
    let value: Option<String> = conn
      .get(self.keys.cache_key(crate::keys::Scope::Global, "user_cache", namespace, &[("key", key)]))
      .await?;
    return Ok(value);
  }

  pub async fn user_cache_set(
    &self,
    namespace: &str,
    key: &str,
    value: &str,
    ttl: Option<std::time::Duration>,
  ) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let cache_key = self.keys.cache_key(crate::keys::Scope::Global, "user_cache", namespace, &[("key", key)]);
    match ttl {
      Some(ttl) => {
        let _: () = conn.set_ex(&cache_key, value, ttl.as_secs().max(1)).await?;
      }
      None => {
        let _: () = conn.set(&cache_key, value).await?;
      }
    }
    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_url() -> String {
    return std::env::var("TASKGRID_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
  }

  #[tokio::test]
  #[ignore]
  async fn test_md5_roundtrip() {
    let store = RedisStore::connect(&test_url()).await.unwrap();
    let keys = std::sync::Arc::new(Keys::new(format!("test-{}", uuid::Uuid::new_v4())));
    let cache = SharedCache::new(store, keys);

    cache.set_md5("script", "s__foo", "abc123").await.unwrap();
    assert_eq!(cache.get_md5("script", "s__foo").await.unwrap().as_deref(), Some("abc123"));
    assert_eq!(cache.get_md5("script", "missing").await.unwrap(), None);
  }

  #[tokio::test]
  #[ignore]
  async fn test_pause_flag() {
    let store = RedisStore::connect(&test_url()).await.unwrap();
    let keys = std::sync::Arc::new(Keys::new(format!("test-{}", uuid::Uuid::new_v4())));
    let cache = SharedCache::new(store, keys);

    assert!(!cache.cron_job_paused("c1").await.unwrap());
    cache.set_cron_job_pause("c1", None).await.unwrap();
    assert!(cache.cron_job_paused("c1").await.unwrap());
    cache.clear_cron_job_pause("c1").await.unwrap();
    assert!(!cache.cron_job_paused("c1").await.unwrap());
  }
}
