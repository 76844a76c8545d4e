//! Key-naming conventions for the shared in-memory store (§6).
//!
//! Queue naming: worker queue key = `<appName>-worker#worker_queue:<N>`;
//! delay queue key = `<appName>-worker#delay_queue:<N>`.
//!
//! Cache key convention: `<appName>-<scope>#<topic>:<name>[:tag=value[...]]`
//! where `<scope>` ∈ {server, worker, monitor, global}.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  Server,
  Worker,
  Monitor,
  Global,
}

impl Scope {
  fn as_str(&self) -> &'static str {
    return match self {
      Scope::Server => "server",
      Scope::Worker => "worker",
      Scope::Monitor => "monitor",
      Scope::Global => "global",
    };
  }
}

pub struct Keys {
  app_name: String,
}

impl Keys {
  pub fn new(app_name: impl Into<String>) -> Self {
    return Self { app_name: app_name.into() };
  }

  pub fn worker_queue(&self, queue: i64) -> String {
    return format!("{}-worker#worker_queue:{queue}", self.app_name);
  }

  pub fn delay_queue(&self, queue: i64) -> String {
    return format!("{}-worker#delay_queue:{queue}", self.app_name);
  }

  /// `<appName>-<scope>#<topic>:<name>[:tag=value[...]]`
  pub fn cache_key(&self, scope: Scope, topic: &str, name: &str, tags: &[(&str, &str)]) -> String {
    let mut key = format!("{}-{}#{}:{}", self.app_name, scope.as_str(), topic, name);
    for (k, v) in tags {
      key.push_str(&format!(":{k}={v}"));
    }
    return key;
  }

  pub fn master_lock(&self) -> String {
    return self.cache_key(Scope::Global, "lock", "beat_master", &[]);
  }

  pub fn cron_job_starter_lock(&self) -> String {
    return self.cache_key(Scope::Global, "lock", "cron_job_starter", &[]);
  }

  pub fn task_class_lock(&self, task_name: &str) -> String {
    return self.cache_key(Scope::Global, "lock", "task_class", &[("name", task_name)]);
  }

  pub fn cron_job_lock(&self, cron_job_id: &str, func_id: &str, exec_mode: &str) -> String {
    return self.cache_key(
      Scope::Global,
      "lock",
      "cron_job",
      &[("cronJobId", cron_job_id), ("funcId", func_id), ("execMode", exec_mode)],
    );
  }

  pub fn pause_all_cron_jobs(&self) -> String {
    return self.cache_key(Scope::Global, "flag", "pause_all_cron_jobs", &[]);
  }

  pub fn cron_job_pause(&self, cron_job_id: &str) -> String {
    return self.cache_key(Scope::Global, "flag", "cron_job_pause", &[("id", cron_job_id)]);
  }

  pub fn cron_job_dynamic_expr(&self, cron_job_id: &str) -> String {
    return self.cache_key(Scope::Global, "override", "cron_job_expr", &[("id", cron_job_id)]);
  }

  pub fn queue_limit(&self, queue: i64) -> String {
    return self.cache_key(Scope::Global, "limit", "worker_queue", &[("queue", &queue.to_string())]);
  }

  pub fn md5_index(&self, data_type: &str) -> String {
    return self.cache_key(Scope::Global, "md5", data_type, &[]);
  }

  pub fn worker_heartbeat(&self, hostname: &str, pid: u32) -> String {
    return self.cache_key(
      Scope::Worker,
      "heartbeat",
      hostname,
      &[("pid", &pid.to_string())],
    );
  }

  /// One hash shared by every process's Heartbeat (§4.L): field =
  /// `worker_heartbeat`/`beat_heartbeat`-style key, value = the heartbeat's
  /// JSON payload. A hash (rather than per-process keys) lets `AutoClean`
  /// sweep stale entries by reading the whole map instead of scanning key
  /// patterns.
  pub fn heartbeats_hash(&self) -> String {
    return self.cache_key(Scope::Global, "hash", "heartbeats", &[]);
  }

  pub fn task_response_channel(&self) -> String {
    return format!("{}-global#task_response", self.app_name);
  }

  pub fn restart_all_workers(&self) -> String {
    return self.cache_key(Scope::Global, "flag", "restart_all_workers", &[]);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_queue_keys() {
    let keys = Keys::new("app");
    assert_eq!(keys.worker_queue(3), "app-worker#worker_queue:3");
    assert_eq!(keys.delay_queue(3), "app-worker#delay_queue:3");
  }

  #[test]
  fn test_cache_key_with_tags() {
    let keys = Keys::new("app");
    assert_eq!(
      keys.cron_job_lock("cj1", "fs__s.plus", "cron"),
      "app-global#lock:cron_job:cronJobId=cj1:funcId=fs__s.plus:execMode=cron"
    );
  }
}
