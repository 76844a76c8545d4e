#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("redis: {0}")]
  Redis(#[from] redis::RedisError),

  #[error("serde_json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid cron expression: {0}")]
  InvalidCron(String),

  #[error("lock not held")]
  LockNotHeld,
}

pub type Result<T> = std::result::Result<T, QueueError>;
