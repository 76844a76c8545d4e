//! `UpdateWorkerQueueLimit` (§4.K, §10.E): recomputes each queue's admission
//! ceiling from how many enabled Cron Jobs currently target it —
//! `max(activeCronJobCount * scale, min)` — and republishes it so
//! `QueueFabric::is_available` picks up the new limit on the next push.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::task::{TaskContext, TaskError, TaskRunner};

const PAGE_SIZE: i64 = 500;

pub struct UpdateWorkerQueueLimitTask;

#[async_trait]
impl TaskRunner for UpdateWorkerQueueLimitTask {
  fn name(&self) -> &str {
    return "Internal.UpdateWorkerQueueLimit";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time as i64;

    let mut counts: HashMap<i64, i64> = HashMap::new();
    let mut after_seq = 0i64;
    loop {
      let page = state.metadata().list_cron_jobs_page(after_seq, PAGE_SIZE).await.map_err(to_failure)?;
      if page.is_empty() {
        break;
      }
      after_seq = page.last().map(|j| j.seq).unwrap_or(after_seq);

      for job in &page {
        if job.is_disabled {
          continue;
        }
        if job.expire_time.is_some_and(|t| t <= now) {
          continue;
        }
        let Some(function) = state.metadata().get_function(&job.func_id).await.map_err(to_failure)? else {
          continue;
        };
        let queue = function.extra_config().unwrap_or_default().queue.unwrap_or(1);
        *counts.entry(queue).or_insert(0) += 1;
      }

      if (page.len() as i64) < PAGE_SIZE {
        break;
      }
    }

    let admission = &state.config().queue_admission;
    let mut published = serde_json::Map::with_capacity(counts.len());
    for (queue, count) in &counts {
      let limit = ((*count as f64) * admission.scale).round() as i64;
      let limit = limit.max(admission.min);
      state.queue().publish_queue_limit(*queue, limit).await.map_err(to_failure)?;
      published.insert(queue.to_string(), json!(limit));
    }

    ctx.log(ctx.start_time, format!("updated queue limits for {} queues", published.len()));
    return Ok(Value::Object(published));
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
  use taskgrid_schema::entities::TaskStatus;

  #[tokio::test]
  #[ignore]
  async fn test_update_queue_limit_uses_configured_minimum_when_no_jobs() {
    let state = test_state().await;
    let request = taskgrid_queue::TaskRequest {
      name: "Internal.UpdateWorkerQueueLimit".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 60.0,
      expires: 300.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &UpdateWorkerQueueLimitTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    assert_eq!(instance.result.unwrap(), json!({}));
  }
}
