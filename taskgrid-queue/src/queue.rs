//! Named FIFO worker queues and ordered delay queues atop the shared store
//! (§4.B).

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keys::Keys;
use crate::store::RedisStore;

/// Wire shape placed on the shared store (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
  pub name: String,
  pub id: String,
  pub kwargs: serde_json::Value,
  pub trigger_time: f64,
  pub queue: i64,
  pub eta: Option<f64>,
  #[serde(default)]
  pub delay: f64,
  pub timeout: f64,
  pub expires: f64,
  #[serde(default)]
  pub ignore_result: bool,
  pub task_record_limit: Option<i64>,
  /// Call-chain tracking, carried end-to-end through `FUNC` sub-task calls
  /// (§10.E) so invariant 8 of §8 is mechanically checkable.
  #[serde(default)]
  pub call_chain: Vec<String>,
  /// Set by the Cron Job Starter when the request carries a Cron Job lock
  /// the Function Runtime must acquire at run start and release at run end.
  pub cron_job_lock: Option<(String, String)>,
}

// Moves every delay-queue member with score <= ARGV[1] to the worker
// queue, atomically, in eta order. `push()` enqueues with LPUSH and
// `bpop()` serves from the opposite (right) end, so the head is the
// "insert next" slot and the tail is "serve next" — promoted members must
// go in with the same LPUSH every other enqueue uses. ZRANGEBYSCORE
// returns members ascending by score (earliest eta first); LPUSHing each
// in that order pushes later ones progressively further from the tail, so
// the earliest-eta member ends up served first and none of them jump
// ahead of whatever was already waiting at the tail.
const PROMOTE_SCRIPT: &str = r#"
local members = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
if #members == 0 then
  return 0
end
for _, member in ipairs(members) do
  redis.call("LPUSH", KEYS[2], member)
end
redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
return #members
"#;

#[derive(Clone)]
pub struct QueueFabric {
  store: RedisStore,
  keys: std::sync::Arc<Keys>,
}

impl QueueFabric {
  pub fn new(store: RedisStore, keys: std::sync::Arc<Keys>) -> Self {
    return Self { store, keys };
  }

  /// The underlying shared store, for maintenance operations (e.g.
  /// `admin-tool clear-redis`, §6) that operate below the queue/cache
  /// abstractions.
  pub fn store(&self) -> &RedisStore {
    return &self.store;
  }

  /// Appends to the worker queue (left-push).
  pub async fn push(&self, queue: i64, task: &TaskRequest) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let payload = serde_json::to_string(task)?;
    let _: i64 = conn.lpush(self.keys.worker_queue(queue), payload).await?;
    return Ok(());
  }

  /// Blocks up to `timeout` waiting for any of `queues` to become
  /// non-empty; returns `(queue, task)` or `None` on timeout.
  pub async fn bpop(&self, queues: &[i64], timeout: std::time::Duration) -> Result<Option<(i64, TaskRequest)>> {
    let mut conn = self.store.connection().await?;
    let keys: Vec<String> = queues.iter().map(|q| self.keys.worker_queue(*q)).collect();

    let result: Option<(String, String)> = conn.brpop(keys, timeout.as_secs_f64()).await?;
    let Some((key, payload)) = result else {
      return Ok(None);
    };

    let queue = queues
      .iter()
      .copied()
      .find(|q| self.keys.worker_queue(*q) == key)
      .unwrap_or(queues[0]);
    let task: TaskRequest = serde_json::from_str(&payload)?;

    return Ok(Some((queue, task)));
  }

  /// Inserts into the delay queue ordered by `eta_seconds`.
  pub async fn zadd_delay(&self, queue: i64, task: &TaskRequest, eta_seconds: f64) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let payload = serde_json::to_string(task)?;
    let _: i64 = conn.zadd(self.keys.delay_queue(queue), payload, eta_seconds).await?;
    return Ok(());
  }

  /// Atomically moves all delay-queue members with score <= `up_to_t` to the
  /// tail of the worker queue; returns the number moved. Non-blocking,
  /// idempotent under concurrent calls since it executes as one Lua script.
  pub async fn promote(&self, queue: i64, up_to_t: f64) -> Result<i64> {
    let mut conn = self.store.connection().await?;
    let moved: i64 = redis::Script::new(PROMOTE_SCRIPT)
      .key(self.keys.delay_queue(queue))
      .key(self.keys.worker_queue(queue))
      .arg(up_to_t)
      .invoke_async(&mut conn)
      .await?;
    return Ok(moved);
  }

  pub async fn worker_queue_len(&self, queue: i64) -> Result<i64> {
    let mut conn = self.store.connection().await?;
    let len: i64 = conn.llen(self.keys.worker_queue(queue)).await?;
    return Ok(len);
  }

  pub async fn delay_queue_len(&self, queue: i64) -> Result<i64> {
    let mut conn = self.store.connection().await?;
    let len: i64 = conn.zcard(self.keys.delay_queue(queue)).await?;
    return Ok(len);
  }

  /// True iff the worker-queue length is below the configured per-queue
  /// limit, or no limit is configured (§4.B admission control).
  pub async fn is_available(&self, queue: i64) -> Result<bool> {
    let mut conn = self.store.connection().await?;
    let limit: Option<i64> = conn.get(self.keys.queue_limit(queue)).await?;
    let Some(limit) = limit else {
      return Ok(true);
    };

    let len = self.worker_queue_len(queue).await?;
    return Ok(len < limit);
  }

  pub async fn publish_queue_limit(&self, queue: i64, limit: i64) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let _: () = conn.set(self.keys.queue_limit(queue), limit).await?;
    return Ok(());
  }

  /// Publishes `payload` on `channel`, e.g. the global Task Response
  /// channel (§6). Fire-and-forget: a channel with no subscribers is not
  /// an error.
  pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
    let mut conn = self.store.connection().await?;
    let _: i64 = conn.publish(channel, payload).await?;
    return Ok(());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_url() -> String {
    return std::env::var("TASKGRID_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
  }

  fn sample_task(id: &str, queue: i64) -> TaskRequest {
    return TaskRequest {
      name: "demo.task".to_string(),
      id: id.to_string(),
      kwargs: serde_json::json!({}),
      trigger_time: 0.0,
      queue,
      eta: None,
      delay: 0.0,
      timeout: 30.0,
      expires: 60.0,
      ignore_result: false,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };
  }

  #[tokio::test]
  #[ignore]
  async fn test_push_and_bpop_single_consumer() {
    let store = RedisStore::connect(&test_url()).await.unwrap();
    let keys = std::sync::Arc::new(Keys::new(format!("test-{}", uuid::Uuid::new_v4())));
    let fabric = QueueFabric::new(store, keys);

    let task = sample_task("t1", 1);
    fabric.push(1, &task).await.unwrap();

    let (queue, popped) = fabric
      .bpop(&[1], std::time::Duration::from_secs(1))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(queue, 1);
    assert_eq!(popped.id, "t1");

    assert!(fabric
      .bpop(&[1], std::time::Duration::from_millis(100))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  #[ignore]
  async fn test_promote_moves_due_members_only() {
    let store = RedisStore::connect(&test_url()).await.unwrap();
    let keys = std::sync::Arc::new(Keys::new(format!("test-{}", uuid::Uuid::new_v4())));
    let fabric = QueueFabric::new(store, keys);

    fabric.zadd_delay(2, &sample_task("due", 2), 10.0).await.unwrap();
    fabric.zadd_delay(2, &sample_task("not-due", 2), 100.0).await.unwrap();

    let moved = fabric.promote(2, 50.0).await.unwrap();
    assert_eq!(moved, 1);

    let (_, popped) = fabric
      .bpop(&[2], std::time::Duration::from_secs(1))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(popped.id, "due");

    // Second promote call at the same cutoff is a no-op.
    assert_eq!(fabric.promote(2, 50.0).await.unwrap(), 0);
  }
}
