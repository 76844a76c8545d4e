//! `AutoClean` (§4.K): the daily housekeeping pass. Pause flags, the cron
//! dynamic-expression override, and the per-Cron-Job pause flag all carry
//! their own Redis `EXPIRE`/`EXPIREAT`, so they need no explicit sweep here;
//! this task handles everything that outlives a TTL-bearing key — rolled
//! history tables, expired Func Store rows, orphaned task records, stale
//! heartbeats, and swept temp files.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::task::{TaskContext, TaskError, TaskRunner};

pub struct AutoCleanTask;

#[async_trait]
impl TaskRunner for AutoCleanTask {
  fn name(&self) -> &str {
    return "Internal.AutoClean";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time as i64;
    let retention = &state.config().retention;

    let rolled_by_limit = state
      .metadata()
      .roll_task_records_by_limit(retention.task_records_limit)
      .await
      .map_err(to_failure)?;
    let rolled_by_age = state
      .metadata()
      .roll_task_records_by_expires(now, retention.task_records_max_age_secs)
      .await
      .map_err(to_failure)?;
    let rolled_funcs = state
      .metadata()
      .roll_task_record_funcs_by_limit(retention.task_record_funcs_limit)
      .await
      .map_err(to_failure)?;
    let expired_store = state.metadata().store_delete_expired(now).await.map_err(to_failure)?;
    let orphaned = state.metadata().delete_orphaned_task_records().await.map_err(to_failure)?;
    let stale_heartbeats = clean_stale_heartbeats(ctx, now).await?;
    let swept_temp_files = sweep_temp_files(ctx, now).await?;

    let summary = json!({
      "rolledTaskRecordsByLimit": rolled_by_limit,
      "rolledTaskRecordsByAge": rolled_by_age,
      "rolledTaskRecordFuncs": rolled_funcs,
      "expiredFuncStoreRows": expired_store,
      "orphanedTaskRecords": orphaned,
      "staleHeartbeats": stale_heartbeats,
      "sweptTempFiles": swept_temp_files,
    });
    ctx.log(ctx.start_time, format!("auto clean: {summary}"));
    return Ok(summary);
  }
}

async fn clean_stale_heartbeats(ctx: &TaskContext<'_>, now: i64) -> Result<usize, TaskError> {
  let state = ctx.state;
  let max_age = crate::constants::HEARTBEAT_MAX_AGE.as_secs() as i64;

  let entries = state.cache().list_heartbeats().await.map_err(to_failure)?;
  let mut removed = 0usize;
  for (field, payload) in entries {
    let stale = serde_json::from_str::<Value>(&payload)
      .ok()
      .and_then(|v| v.get("updateTime").and_then(Value::as_i64))
      .is_none_or(|update_time| now - update_time > max_age);

    if stale {
      state.cache().remove_heartbeat(&field).await.map_err(to_failure)?;
      removed += 1;
    }
  }
  return Ok(removed);
}

/// Temp files are named `<unix_ts>-<suffix>`; anything whose timestamp
/// prefix has already passed is swept.
async fn sweep_temp_files(ctx: &TaskContext<'_>, now: i64) -> Result<usize, TaskError> {
  let temp_dir = ctx.state.data_dir().temp_path();
  let mut removed = 0usize;

  let mut entries = match tokio::fs::read_dir(&temp_dir).await {
    Ok(entries) => entries,
    Err(_) => return Ok(0),
  };

  while let Ok(Some(entry)) = entries.next_entry().await {
    let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
    let Some((prefix, _)) = name.split_once('-') else { continue };
    let Ok(ts) = prefix.parse::<i64>() else { continue };
    if ts <= now {
      if tokio::fs::remove_file(entry.path()).await.is_ok() {
        removed += 1;
      }
    }
  }
  return Ok(removed);
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
  async fn test_auto_clean_runs_without_error_on_empty_store() {
    let state = test_state().await;
    let request = taskgrid_queue::TaskRequest {
      name: "Internal.AutoClean".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 300.0,
      expires: 3600.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &AutoCleanTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
  }
}
