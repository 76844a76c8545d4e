//! Shared process state: every component (Beat, Worker, Cron Job Starter,
//! Internal Tasks, Function Runtime) is constructed from one `AppState`
//! handle. Cheap to clone — every field is itself a cheaply-cloneable
//! handle (a connection manager, a background-thread connection, or an
//! `Arc`).

use std::sync::Arc;

use taskgrid_extension::CipherKey;
use taskgrid_queue::{Keys, LockService, QueueFabric, RedisStore, SharedCache, TimeSource};
use taskgrid_schema::MetadataStore;

use crate::config::Config;
use crate::data_dir::DataDir;

#[derive(Clone)]
pub struct AppState {
  config: Arc<Config>,
  data_dir: DataDir,
  metadata: MetadataStore,
  queue: QueueFabric,
  locks: LockService,
  cache: SharedCache,
  time: TimeSource,
  keys: Arc<Keys>,
  cipher_key: Arc<CipherKey>,
}

impl AppState {
  pub async fn build(config: Config, data_dir: DataDir) -> crate::error::Result<Self> {
    data_dir.ensure_directory_structure().await?;

    let metadata = MetadataStore::open(Some(data_dir.main_db_path())).await?;
    let store = RedisStore::connect(&config.redis.url).await?;
    let keys = Arc::new(Keys::new(config.app_name.clone()));

    let queue = QueueFabric::new(store.clone(), keys.clone());
    let locks = LockService::new(store.clone());
    let cache = SharedCache::new(store.clone(), keys.clone());
    let time = TimeSource::new(store);

    let cipher_key = Arc::new(load_or_create_cipher_key(&data_dir).await?);

    return Ok(Self {
      config: Arc::new(config),
      data_dir,
      metadata,
      queue,
      locks,
      cache,
      time,
      keys,
      cipher_key,
    });
  }

  pub fn config(&self) -> &Config {
    return &self.config;
  }

  pub fn data_dir(&self) -> &DataDir {
    return &self.data_dir;
  }

  pub fn metadata(&self) -> &MetadataStore {
    return &self.metadata;
  }

  pub fn queue(&self) -> &QueueFabric {
    return &self.queue;
  }

  pub fn locks(&self) -> &LockService {
    return &self.locks;
  }

  pub fn cache(&self) -> &SharedCache {
    return &self.cache;
  }

  pub fn time(&self) -> &TimeSource {
    return &self.time;
  }

  pub fn keys(&self) -> &Keys {
    return &self.keys;
  }

  pub fn cipher_key(&self) -> &CipherKey {
    return &self.cipher_key;
  }
}

/// The cipher key used to encrypt Connector/EnvVariable secret fields is
/// generated once and persisted under the data dir's secrets path; every
/// process reads the same key back on startup.
async fn load_or_create_cipher_key(data_dir: &DataDir) -> crate::error::Result<CipherKey> {
  let path = data_dir.key_path();

  if let Ok(bytes) = tokio::fs::read(&path).await {
    if bytes.len() == 32 {
      return Ok(*CipherKey::from_slice(&bytes));
    }
  }

  let key = taskgrid_extension::generate_random_key();
  tokio::fs::write(&path, key.as_slice()).await?;
  return Ok(key);
}

/// Builds an `AppState` against a real but disposable SQLite file and
/// whatever Redis `TASKGRID_TEST_REDIS_URL` points at. Callers that exercise
/// Redis-backed behavior (locks, queues, the shared cache) must mark their
/// test `#[ignore]`, same convention as `taskgrid_queue`.
#[cfg(test)]
pub(crate) async fn test_state() -> AppState {
  let dir = tempfile::tempdir().unwrap();
  let data_dir = DataDir(dir.path().to_path_buf());
  let mut config = Config::default();
  if let Ok(url) = std::env::var("TASKGRID_TEST_REDIS_URL") {
    config.redis.url = url;
  }
  let state = AppState::build(config, data_dir).await.unwrap();
  // Tests that don't have a live Redis never exercise `queue`/`locks`/`cache`/`time`.
  std::mem::forget(dir);
  return state;
}
