//! Named mutual-exclusion locks with expiry, renewal, and owner-tagged
//! release (§4.C). `value` is an opaque owner token; only the holder who set
//! `value` may renew or release.

use redis::AsyncCommands;

use crate::error::Result;
use crate::store::RedisStore;

const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("expire", KEYS[1], ARGV[2])
else
  return 0
end
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

#[derive(Clone)]
pub struct LockService {
  store: RedisStore,
}

impl LockService {
  pub fn new(store: RedisStore) -> Self {
    return Self { store };
  }

  /// Succeeds only if `key` is unset; stores `value` with `ttl`.
  pub async fn lock(&self, key: &str, value: &str, ttl: std::time::Duration) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let result: Option<String> = redis::cmd("SET")
      .arg(key)
      .arg(value)
      .arg("NX")
      .arg("EX")
      .arg(ttl.as_secs().max(1))
      .query_async(&mut conn)
      .await?;

    return Ok(result.is_some());
  }

  /// Refreshes `ttl` only if the current value equals `value`.
  pub async fn renew(&self, key: &str, value: &str, ttl: std::time::Duration) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
      .key(key)
      .arg(value)
      .arg(ttl.as_secs().max(1))
      .invoke_async(&mut conn)
      .await?;

    return Ok(renewed == 1);
  }

  /// Deletes `key` only if the current value equals `value`.
  pub async fn unlock(&self, key: &str, value: &str) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
      .key(key)
      .arg(value)
      .invoke_async(&mut conn)
      .await?;

    return Ok(deleted == 1);
  }

  pub async fn get_owner(&self, key: &str) -> Result<Option<String>> {
    let mut conn = self.store.connection().await?;
    let value: Option<String> = conn.get(key).await?;
    return Ok(value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_url() -> String {
    return std::env::var("TASKGRID_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
  }

  // These tests require a live Redis reachable at TASKGRID_TEST_REDIS_URL and
  // are marked `ignore` so the default test run doesn't depend on one.
  #[tokio::test]
  #[ignore]
  async fn test_mutually_exclusive_lock() {
    let store = RedisStore::connect(&test_url()).await.unwrap();
    let locks = LockService::new(store);

    let key = format!("test-lock:{}", uuid::Uuid::new_v4());
    let ttl = std::time::Duration::from_secs(5);

    assert!(locks.lock(&key, "owner-a", ttl).await.unwrap());
    assert!(!locks.lock(&key, "owner-b", ttl).await.unwrap());

    // Loser's unlock is a no-op.
    assert!(!locks.unlock(&key, "owner-b").await.unwrap());
    assert!(locks.unlock(&key, "owner-a").await.unwrap());

    assert!(locks.lock(&key, "owner-b", ttl).await.unwrap());
    assert!(locks.unlock(&key, "owner-b").await.unwrap());
  }

  #[tokio::test]
  #[ignore]
  async fn test_renew_requires_ownership() {
    let store = RedisStore::connect(&test_url()).await.unwrap();
    let locks = LockService::new(store);

    let key = format!("test-lock:{}", uuid::Uuid::new_v4());
    let ttl = std::time::Duration::from_secs(5);

    assert!(locks.lock(&key, "owner-a", ttl).await.unwrap());
    assert!(!locks.renew(&key, "owner-b", ttl).await.unwrap());
    assert!(locks.renew(&key, "owner-a", ttl).await.unwrap());

    locks.unlock(&key, "owner-a").await.unwrap();
  }
}
