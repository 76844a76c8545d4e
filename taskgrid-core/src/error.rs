//! Crate-wide error aggregation (§10.B). Component-level errors are defined
//! next to the component they belong to and flow into this enum via `#[from]`,
//! the same aggregation shape as the reference workspace's top-level error
//! types.

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),

  #[error("metadata: {0}")]
  Metadata(#[from] taskgrid_schema::MetadataError),

  #[error("cipher: {0}")]
  Cipher(#[from] taskgrid_extension::CipherError),

  #[error("config: {0}")]
  Config(#[from] crate::config::ConfigError),

  #[error("script: {0}")]
  Script(#[from] crate::script_loader::ScriptError),

  #[error("runtime: {0}")]
  Runtime(#[from] crate::runtime::RuntimeError),

  #[error("task: {0}")]
  Task(#[from] crate::task::TaskError),

  #[error("beat: {0}")]
  Beat(#[from] crate::beat::BeatError),

  #[error("worker: {0}")]
  Worker(#[from] crate::worker::WorkerError),

  #[error("cron job starter: {0}")]
  CronJobStarter(#[from] crate::cron_job_starter::CronStarterError),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
