//! Layered configuration: `Default` impls, merged with a TOML file under the
//! data directory, merged with environment variables. The env-var layer
//! mirrors the reference workspace's `parse_env_var`/`apply_parsed_env_var`
//! helpers: values are parsed with `FromStr` into the type of the field
//! they're overriding, rather than deserialized generically, so a bad value
//! in the environment fails loudly instead of silently falling back.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{ENV_CUSTOM_PREFIX, ENV_PREFIX};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("toml decode error: {0}")]
  Decode(#[from] toml::de::Error),
  #[error("toml encode error: {0}")]
  Encode(#[from] toml::ser::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("invalid value for {name}: {source}")]
  InvalidEnvVar {
    name: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

#[cfg(not(test))]
fn parse_env_var<T: std::str::FromStr>(
  name: &str,
) -> Result<Option<T>, <T as std::str::FromStr>::Err> {
  if let Ok(value) = std::env::var(name) {
    return Ok(Some(value.parse::<T>()?));
  }
  Ok(None)
}

#[cfg(test)]
pub(crate) mod test_env {
  use lazy_static::lazy_static;
  use parking_lot::Mutex;
  use std::collections::HashMap;

  lazy_static! {
    pub static ref ENV: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
  }

  pub(super) fn parse_env_var<T: std::str::FromStr>(
    name: &str,
  ) -> Result<Option<T>, <T as std::str::FromStr>::Err> {
    if let Some(value) = ENV.lock().get(name) {
      return Ok(Some(value.parse::<T>()?));
    }
    Ok(None)
  }

  pub fn set(name: &str, value: Option<&str>) {
    match value {
      None => ENV.lock().remove(name),
      Some(v) => ENV.lock().insert(name.to_string(), v.to_string()),
    };
  }

  pub fn clear() {
    ENV.lock().clear();
  }
}

#[cfg(test)]
use test_env::parse_env_var;

/// Applies `f` to the parsed value of env var `name` iff it is set; a no-op
/// otherwise. `name` must already carry the full prefix.
fn apply_env_var<T: std::str::FromStr>(name: &str, mut f: impl FnMut(T)) -> Result<(), ConfigError>
where
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match parse_env_var::<T>(name) {
    Ok(Some(v)) => {
      f(v);
      Ok(())
    }
    Ok(None) => Ok(()),
    Err(source) => Err(ConfigError::InvalidEnvVar {
      name: name.to_string(),
      source: Box::new(source),
    }),
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
  pub url: String,
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self { url: "redis://127.0.0.1/".to_string() }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
  /// Process auto-recycles after this many ticks (§4.I), bounding long-run
  /// memory growth.
  pub recycle_after_ticks: u64,
}

impl Default for BeatConfig {
  fn default() -> Self {
    Self { recycle_after_ticks: 86_400 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// `C`: task-runner sub-loops per worker parent process (§5). `K`, the
  /// process count per node, is a deployment concern outside this struct.
  pub concurrency: u32,
  pub fetch_timeout_secs: f64,
  pub max_tasks_per_process: u64,
  pub default_timeout_secs: f64,
  pub default_expires_secs: f64,
  pub listening_queues: Vec<i64>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      concurrency: 4,
      fetch_timeout_secs: 5.0,
      max_tasks_per_process: 10_000,
      default_timeout_secs: 60.0,
      default_expires_secs: 300.0,
      listening_queues: vec![1, 2, 3],
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueAdmissionConfig {
  /// `UpdateWorkerQueueLimit` computes `max(activeCronJobCount * scale, min)`
  /// per queue (§4.K, §10.E).
  pub scale: f64,
  pub min: i64,
}

impl Default for QueueAdmissionConfig {
  fn default() -> Self {
    Self { scale: 2.0, min: 16 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
  pub enabled: bool,
  /// Hour of day (0-23, server time) the daily `AutoBackupDB` task runs.
  pub hour_of_day: u32,
  pub keep_last: u32,
}

impl Default for BackupConfig {
  fn default() -> Self {
    Self { enabled: true, hour_of_day: 3, keep_last: 7 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
  /// Rows kept in `task_records`/`task_record_funcs` after `AutoClean` rolls
  /// them by count (§4.D, §4.K).
  pub task_records_limit: i64,
  pub task_record_funcs_limit: i64,
  /// Rows older than this are rolled regardless of count.
  pub task_records_max_age_secs: i64,
}

impl Default for RetentionConfig {
  fn default() -> Self {
    Self {
      task_records_limit: 1_000_000,
      task_record_funcs_limit: 1_000_000,
      task_records_max_age_secs: 30 * 24 * 3600,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
  /// `FlushDataBuffer` stops aggregating further rows once this many have
  /// been read in one tick, picking the rest up next tick (§4.K).
  pub max_rows_per_tick: i64,
}

impl Default for FlushConfig {
  fn default() -> Self {
    Self { max_rows_per_tick: 5_000 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
  pub thread_pool_size: usize,
  pub max_call_chain_depth: usize,
  pub script_cache_ttl_secs: u64,
  pub connector_pool_size: usize,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      thread_pool_size: 4,
      max_call_chain_depth: crate::constants::MAX_CALL_CHAIN_DEPTH,
      script_cache_ttl_secs: crate::constants::SCRIPT_CACHE_TTL.as_secs(),
      connector_pool_size: 4,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub app_name: String,
  pub timezone: String,
  pub num_queues: i64,
  pub redis: RedisConfig,
  pub beat: BeatConfig,
  pub worker: WorkerConfig,
  pub queue_admission: QueueAdmissionConfig,
  pub backup: BackupConfig,
  pub runtime: RuntimeConfig,
  pub retention: RetentionConfig,
  pub flush: FlushConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: "taskgrid".to_string(),
      timezone: "UTC".to_string(),
      num_queues: 4,
      redis: RedisConfig::default(),
      beat: BeatConfig::default(),
      worker: WorkerConfig::default(),
      queue_admission: QueueAdmissionConfig::default(),
      backup: BackupConfig::default(),
      runtime: RuntimeConfig::default(),
      retention: RetentionConfig::default(),
      flush: FlushConfig::default(),
    }
  }
}

impl Config {
  /// Loads defaults, merges a TOML file if present, then merges
  /// environment-variable overrides. Mirrors the reference workspace's
  /// layering order: defaults < file < env.
  pub fn load(toml_path: &std::path::Path) -> Result<Self, ConfigError> {
    let mut config = if toml_path.exists() {
      let text = std::fs::read_to_string(toml_path)?;
      Self::from_text(&text)?
    } else {
      Self::default()
    };
    config.apply_env_overrides()?;
    Ok(config)
  }

  pub fn from_text(text: &str) -> Result<Self, ConfigError> {
    return Ok(toml::from_str(text)?);
  }

  pub fn to_text(&self) -> Result<String, ConfigError> {
    return Ok(toml::to_string_pretty(self)?);
  }

  /// Field-by-field override from `TASKGRID_*` environment variables,
  /// coerced to the type of the existing (default-or-file) value.
  pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
    apply_env_var(&format!("{ENV_PREFIX}APP_NAME"), |v| self.app_name = v)?;
    apply_env_var(&format!("{ENV_PREFIX}TIMEZONE"), |v| self.timezone = v)?;
    apply_env_var(&format!("{ENV_PREFIX}NUM_QUEUES"), |v| self.num_queues = v)?;
    apply_env_var(&format!("{ENV_PREFIX}REDIS_URL"), |v| self.redis.url = v)?;
    apply_env_var(&format!("{ENV_PREFIX}BEAT_RECYCLE_AFTER_TICKS"), |v| {
      self.beat.recycle_after_ticks = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}WORKER_CONCURRENCY"), |v| {
      self.worker.concurrency = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}WORKER_FETCH_TIMEOUT_SECS"), |v| {
      self.worker.fetch_timeout_secs = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}WORKER_MAX_TASKS_PER_PROCESS"), |v| {
      self.worker.max_tasks_per_process = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}QUEUE_ADMISSION_SCALE"), |v| {
      self.queue_admission.scale = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}QUEUE_ADMISSION_MIN"), |v| {
      self.queue_admission.min = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}BACKUP_ENABLED"), |v| self.backup.enabled = v)?;
    apply_env_var(&format!("{ENV_PREFIX}BACKUP_HOUR_OF_DAY"), |v| {
      self.backup.hour_of_day = v
    })?;
    apply_env_var(&format!("{ENV_PREFIX}RUNTIME_THREAD_POOL_SIZE"), |v| {
      self.runtime.thread_pool_size = v
    })?;
    return Ok(());
  }

  /// Reads arbitrary `TASKGRID_CUSTOM_*` keys, stripped of the prefix and
  /// lower-cased, surfaced verbatim to the Function Runtime's `CONFIG`
  /// helper. Kept disjoint from system config (§10.C).
  pub fn custom_config_from_env() -> std::collections::HashMap<String, String> {
    let mut out = std::collections::HashMap::new();
    for (key, value) in std::env::vars() {
      if let Some(stripped) = key.strip_prefix(ENV_CUSTOM_PREFIX) {
        out.insert(stripped.to_lowercase(), value);
      }
    }
    return out;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_round_trips_through_toml() {
    let config = Config::default();
    let text = config.to_text().unwrap();
    let parsed = Config::from_text(&text).unwrap();
    assert_eq!(parsed.app_name, config.app_name);
    assert_eq!(parsed.num_queues, config.num_queues);
  }

  #[test]
  fn test_env_override_coerces_to_field_type() {
    test_env::clear();
    test_env::set("TASKGRID_NUM_QUEUES", Some("8"));
    test_env::set("TASKGRID_REDIS_URL", Some("redis://example/"));
    test_env::set("TASKGRID_BACKUP_ENABLED", Some("false"));

    let mut config = Config::default();
    config.apply_env_overrides().unwrap();

    assert_eq!(config.num_queues, 8);
    assert_eq!(config.redis.url, "redis://example/");
    assert!(!config.backup.enabled);

    test_env::clear();
  }

  #[test]
  fn test_invalid_env_var_is_an_error_not_a_silent_default() {
    test_env::clear();
    test_env::set("TASKGRID_NUM_QUEUES", Some("not-a-number"));

    let mut config = Config::default();
    assert!(config.apply_env_overrides().is_err());

    test_env::clear();
  }

  #[test]
  fn test_custom_config_prefix_is_disjoint_from_system_prefix() {
    test_env::clear();
    test_env::set("TASKGRID_CUSTOM_RETRY_LIMIT", Some("3"));
    test_env::set("TASKGRID_NUM_QUEUES", Some("2"));

    let custom = Config::custom_config_from_env();
    assert_eq!(custom.get("retry_limit").map(String::as_str), Some("3"));
    assert!(!custom.contains_key("num_queues"));

    test_env::clear();
  }
}
