//! `FlushDataBuffer` (§4.K): rolls committed `task_record_funcs` rows up
//! into minute-aligned per-Function call counts. Task Records themselves are
//! written synchronously by `task::execute` (§4.G) rather than buffered —
//! the metadata store's writer thread already absorbs that cost, so the only
//! remaining "buffer" to drain is the function-call-count aggregate.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::task::{TaskContext, TaskError, TaskRunner};

const CURSOR_SCOPE: &str = "flush_cursor";
const CURSOR_KEY: &str = "task_record_funcs_seq";
const MINUTE: i64 = 60;

pub struct FlushDataBufferTask;

#[async_trait]
impl TaskRunner for FlushDataBufferTask {
  fn name(&self) -> &str {
    return "Internal.FlushDataBuffer";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time as i64;

    let cursor = state
      .metadata()
      .store_get(CURSOR_SCOPE, CURSOR_KEY, now)
      .await
      .map_err(to_failure)?
      .and_then(|v| v.parse::<i64>().ok())
      .unwrap_or(0);

    let rows = state
      .metadata()
      .list_task_record_funcs_after(cursor, state.config().flush.max_rows_per_tick)
      .await
      .map_err(to_failure)?;

    let mut last_seq = cursor;
    let mut flushed = 0usize;
    for row in &rows {
      let minute_boundary = row.create_time - (row.create_time.rem_euclid(MINUTE));
      state
        .metadata()
        .increment_function_call_count(&row.func_id, minute_boundary, 1)
        .await
        .map_err(to_failure)?;
      last_seq = row.seq;
      flushed += 1;
    }

    if last_seq != cursor {
      state
        .metadata()
        .store_set(CURSOR_SCOPE, CURSOR_KEY, &last_seq.to_string(), None, now)
        .await
        .map_err(to_failure)?;
    }

    ctx.log(ctx.start_time, format!("flushed {flushed} function-call-count rows"));
    return Ok(json!({"flushed": flushed, "cursor": last_seq}));
  }
}

fn to_failure(e: impl std::fmt::Display) -> TaskError {
  return TaskError::Failure(e.to_string());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;
  use crate::task::execute;
  use taskgrid_schema::entities::{TaskRecordFunc, TaskStatus};

  #[tokio::test]
  #[ignore]
  async fn test_flush_aggregates_rows_into_minute_buckets() {
    let state = test_state().await;
    for i in 0..3 {
      state
        .metadata()
        .insert_task_record_func(&TaskRecordFunc {
          seq: 0,
          task_id: format!("t{i}"),
          func_id: "fs__s.plus".to_string(),
          cost_ms: 5,
          status: "success".to_string(),
          create_time: 65,
        })
        .await
        .unwrap();
    }

    let request = taskgrid_queue::TaskRequest {
      name: "Internal.FlushDataBuffer".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 70.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 30.0,
      expires: 9.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &FlushDataBufferTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    assert_eq!(instance.result.unwrap()["flushed"], 3);

    let counts = state.metadata().function_call_counts_since(0).await.unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].count, 3);
    assert_eq!(counts[0].minute_ts, 60);
  }
}
