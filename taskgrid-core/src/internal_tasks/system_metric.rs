//! `SystemMetric` (§4.K): samples queue depths, shared-store memory/key
//! counts, metadata-store table sizes, and a 24h Cron Job trigger forecast,
//! writing each as a time-series point via the Func Store (§10.E) so the
//! points expire on their own instead of needing a separate sweep.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::task::{TaskContext, TaskError, TaskRunner};

const METRIC_SCOPE: &str = "system_metric";
const METRIC_MAX_AGE_SECS: i64 = 6 * 3600;

pub struct SystemMetricTask;

#[async_trait]
impl TaskRunner for SystemMetricTask {
  fn name(&self) -> &str {
    return "Internal.SystemMetric";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time as i64;
    let expire_at = Some(now + METRIC_MAX_AGE_SECS);

    let mut queues = Vec::new();
    for queue in 0..state.config().num_queues {
      let worker_len = state.queue().worker_queue_len(queue).await.map_err(to_failure)?;
      let delay_len = state.queue().delay_queue_len(queue).await.map_err(to_failure)?;
      queues.push(json!({"queue": queue, "workerLen": worker_len, "delayLen": delay_len}));
    }

    let (used_memory, key_count) = state.cache().store_stats().await.map_err(to_failure)?;
    let table_rows = state.metadata().table_row_counts().await.map_err(to_failure)?;
    let db_size = state.metadata().db_size_bytes().await.map_err(to_failure)?;
    let forecast = forecast_cron_triggers_next_24h(state, now).await?;

    let metric = json!({
      "sampledAt": now,
      "queues": queues,
      "store": {"usedMemoryBytes": used_memory, "keyCount": key_count},
      "db": {"sizeBytes": db_size, "tableRows": table_rows.into_iter().map(|(t, c)| json!({"table": t, "rows": c})).collect::<Vec<_>>()},
      "cronTriggerForecastNext24h": forecast,
    });

    let payload = serde_json::to_string(&metric).map_err(|e| TaskError::Failure(e.to_string()))?;
    state
      .metadata()
      .store_set(METRIC_SCOPE, "latest", &payload, expire_at, now)
      .await
      .map_err(to_failure)?;

    ctx.log(ctx.start_time, format!("sampled {} queues, db size {db_size}b", state.config().num_queues));
    return Ok(metric);
  }
}

/// Counts, per minute bucket over the next 24h, how many enabled Cron Jobs'
/// effective expression would fire, walking every minute boundary once per
/// job rather than re-evaluating every job every second.
async fn forecast_cron_triggers_next_24h(state: &crate::app_state::AppState, now: i64) -> Result<i64, TaskError> {
  let mut after_seq = 0i64;
  let mut total = 0i64;
  loop {
    let page = state.metadata().list_cron_jobs_page(after_seq, 500).await.map_err(to_failure)?;
    if page.is_empty() {
      break;
    }
    let page_len = page.len();
    for job in &page {
      after_seq = job.seq;
      if job.is_disabled {
        continue;
      }
      if !taskgrid_queue::CronMatcher::is_valid(&job.cron_expr) {
        continue;
      }
      for minute in 0..(24 * 60) {
        let t = (now + minute * 60) as f64;
        if taskgrid_queue::CronMatcher::utc_matches(&job.cron_expr, t).unwrap_or(false) {
          total += 1;
        }
      }
    }
    if (page_len as i64) < 500 {
      break;
    }
  }
  return Ok(total);
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

  // Requires a live Redis + the in-process SQLite metadata store.
  #[tokio::test]
  #[ignore]
  async fn test_system_metric_produces_one_queue_entry_per_queue() {
    let state = test_state().await;
    let num_queues = state.config().num_queues;

    let request = taskgrid_queue::TaskRequest {
      name: "Internal.SystemMetric".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 30.0,
      expires: 55.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &SystemMetricTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    let value = instance.result.unwrap();
    assert_eq!(value["queues"].as_array().unwrap().len(), num_queues as usize);
  }
}
