//! Internal Tasks (§4.K): ordinary Task Runners dispatched by name, same as
//! any user Function — the only difference is Beat enqueues them on a fixed
//! schedule instead of the Cron Job Starter. `dispatch_table` is what the
//! Worker consults before falling back to the Function Runtime for a task
//! name it doesn't recognize as an internal one.

pub mod auto_backup_db;
pub mod auto_clean;
pub mod auto_run;
pub mod connector_tasks;
pub mod flush_data_buffer;
pub mod reload_md5_cache;
pub mod system_metric;
pub mod update_worker_queue_limit;

use std::collections::HashMap;
use std::sync::Arc;

use crate::cron_job_starter::CronJobStarterTask;
use crate::task::TaskRunner;

/// Every built-in task name mapped to its runner, keyed by
/// [`TaskRunner::name`]. Built fresh per process; cheap, called once at
/// worker startup.
pub fn dispatch_table() -> HashMap<String, Arc<dyn TaskRunner>> {
  let runners: Vec<Arc<dyn TaskRunner>> = vec![
    Arc::new(CronJobStarterTask),
    Arc::new(system_metric::SystemMetricTask),
    Arc::new(flush_data_buffer::FlushDataBufferTask),
    Arc::new(auto_clean::AutoCleanTask),
    Arc::new(reload_md5_cache::ReloadDataMd5CacheTask),
    Arc::new(connector_tasks::CheckConnectorTask),
    Arc::new(connector_tasks::QueryConnectorTask),
    Arc::new(auto_run::AutoRunTask),
    Arc::new(update_worker_queue_limit::UpdateWorkerQueueLimitTask),
    Arc::new(auto_backup_db::AutoBackupDbTask),
  ];

  let mut table = HashMap::with_capacity(runners.len());
  for runner in runners {
    table.insert(runner.name().to_string(), runner);
  }
  return table;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dispatch_table_has_every_system_task_meta() {
    let table = dispatch_table();
    for name in [
      "Internal.CronJobStarter",
      "Internal.SystemMetric",
      "Internal.FlushDataBuffer",
      "Internal.AutoClean",
      "Internal.ReloadDataMD5Cache",
      "Internal.UpdateWorkerQueueLimit",
      "Internal.AutoRun",
      "Internal.AutoBackupDB",
    ] {
      assert!(table.contains_key(name), "missing dispatch entry for {name}");
    }
  }
}
