//! `AutoBackupDB` (§4.K): daily online backup of the metadata store to
//! `DataDir::backup_path()`, pruned to `config.backup.keep_last` files.
//! Runs with `exclusive()` so a slow backup never overlaps a second one;
//! a failed backup is logged and returned as a task Failure, not escalated
//! to anything paging an operator — the next day's run tries again.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::task::{TaskContext, TaskError, TaskRunner};

const BACKUP_FILE_PREFIX: &str = "backup-";

pub struct AutoBackupDbTask;

#[async_trait]
impl TaskRunner for AutoBackupDbTask {
  fn name(&self) -> &str {
    return "Internal.AutoBackupDB";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time as i64;

    if !state.config().backup.enabled {
      ctx.log(ctx.start_time, "auto backup skipped: disabled in config".to_string());
      return Ok(json!({"skipped": true}));
    }

    let dest = state.data_dir().backup_path().join(format!("{BACKUP_FILE_PREFIX}{now}.db"));
    state.metadata().backup_to(dest.clone()).await.map_err(to_failure)?;

    let pruned = prune_old_backups(ctx, state.config().backup.keep_last as usize).await?;

    ctx.log(ctx.start_time, format!("backed up metadata store to {dest:?}, pruned {pruned} old backups"));
    return Ok(json!({"path": dest.to_string_lossy(), "pruned": pruned}));
  }
}

async fn prune_old_backups(ctx: &TaskContext<'_>, keep_last: usize) -> Result<usize, TaskError> {
  let dir = ctx.state.data_dir().backup_path();
  let mut entries = match tokio::fs::read_dir(&dir).await {
    Ok(entries) => entries,
    Err(_) => return Ok(0),
  };

  let mut backups = Vec::new();
  while let Ok(Some(entry)) = entries.next_entry().await {
    let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
    if name.starts_with(BACKUP_FILE_PREFIX) {
      backups.push(entry.path());
    }
  }
  backups.sort();

  let mut pruned = 0usize;
  if backups.len() > keep_last {
    for path in &backups[..backups.len() - keep_last] {
      if tokio::fs::remove_file(path).await.is_ok() {
        pruned += 1;
      }
    }
  }
  return Ok(pruned);
}

fn to_failure(e: impl std::fmt::Display) -> TaskError {
  return TaskError::Failure(e.to_string());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;
  use crate::task::execute;
  use taskgrid_schema::entities::TaskStatus;

  #[tokio::test]
  #[ignore]
  async fn test_auto_backup_writes_a_backup_file() {
    let state = test_state().await;
    let request = taskgrid_queue::TaskRequest {
      name: "Internal.AutoBackupDB".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 1_000.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 120.0,
      expires: 3600.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &AutoBackupDbTask).await;
    assert_eq!(instance.status, TaskStatus::Success);

    let expected = state.data_dir().backup_path().join("backup-1000.db");
    assert!(tokio::fs::try_exists(expected).await.unwrap());
  }
}
