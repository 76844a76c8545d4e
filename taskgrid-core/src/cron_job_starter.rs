//! Cron Job Starter (§4.J): one execution scans integration Cron Jobs
//! (Functions with `integration = autoRun` and an `integrationConfig.cronExpr`)
//! and user Cron Jobs (paged by SEQ), matches each against its effective cron
//! expression, and enqueues a Task Request per element of `delayedCronJob`
//! (or one, when absent), subject to admission control and a per-(cronJob,
//! func, execMode) lock carried on the request for the Function Runtime to
//! hold across the run.
//!
//! Runs as an ordinary Task Runner (dispatched via the `Internal.CronJobStarter`
//! name Beat enqueues every second, §4.I) — it is not a separate process.

use async_trait::async_trait;
use serde_json::{json, Value};
use taskgrid_queue::{CronMatcher, TaskRequest};
use uuid::Uuid;

/// Parses a Cron Job's `timezone` column, defaulting to UTC for an absent
/// or unrecognized value rather than failing the whole run.
fn job_timezone(timezone: Option<&str>) -> chrono_tz::Tz {
  return timezone.and_then(|tz| tz.parse().ok()).unwrap_or(chrono_tz::UTC);
}

use crate::app_state::AppState;
use crate::constants::{CRON_STARTER_LOCK_TTL, DISTRIBUTION_RANGE};
use crate::task::{TaskContext, TaskError, TaskRunner};

#[derive(Debug, thiserror::Error)]
pub enum CronStarterError {
  #[error("metadata: {0}")]
  Metadata(#[from] taskgrid_schema::MetadataError),

  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),
}

pub type Result<T> = std::result::Result<T, CronStarterError>;

const PAGE_SIZE: i64 = 500;

pub struct CronJobStarterTask;

#[async_trait]
impl TaskRunner for CronJobStarterTask {
  fn name(&self) -> &str {
    return "Internal.CronJobStarter";
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> std::result::Result<Value, TaskError> {
    let enqueued = run_once(ctx.state, ctx.start_time)
      .await
      .map_err(|e| TaskError::Failure(e.to_string()))?;
    return Ok(json!({ "enqueued": enqueued }));
  }
}

/// One execution of the starter at instant `now`. Returns the number of
/// task requests enqueued, or `0` without error if paused or if another
/// process already holds the starter lock.
pub async fn run_once(state: &AppState, now: f64) -> Result<u32> {
  if state.cache().pause_all_cron_jobs().await? {
    return Ok(0);
  }

  let lock_key = state.keys().cron_job_starter_lock();
  let lock_value = Uuid::new_v4().to_string();
  if !state.locks().lock(&lock_key, &lock_value, CRON_STARTER_LOCK_TTL).await? {
    return Ok(0);
  }

  let result = run_locked(state, now).await;
  let _ = state.locks().unlock(&lock_key, &lock_value).await;
  return result;
}

async fn run_locked(state: &AppState, now: f64) -> Result<u32> {
  let mut enqueued = 0u32;

  // Integration Cron Jobs: Functions with integration=autoRun and a
  // configured integrationConfig.cronExpr, originId "autoRun.cronJob-<funcId>".
  for function in state.metadata().list_functions_by_integration("autoRun").await? {
    let Ok(extra) = function.extra_config() else { continue };
    let Some(integration) = &extra.integration_config else { continue };
    let Some(cron_expr) = &integration.cron_expr else { continue };
    if !CronMatcher::utc_matches(cron_expr, now).unwrap_or(false) {
      continue;
    }

    let origin_id = format!("autoRun.cronJob-{}", function.id);
    enqueue_function_runs(state, &origin_id, &function.id, &extra, json!({}), now, "integration", 0, None).await?;
    enqueued += 1;
  }

  // User Cron Jobs, paged by SEQ.
  let mut after_seq = 0i64;
  loop {
    let page = state.metadata().list_cron_jobs_page(after_seq, PAGE_SIZE).await?;
    if page.is_empty() {
      break;
    }
    let page_len = page.len();

    for job in &page {
      after_seq = job.seq;

      if job.is_disabled {
        continue;
      }
      if job.expire_time.is_some_and(|expire| now as i64 > expire) {
        continue;
      }
      if state.cache().cron_job_paused(&job.id).await? {
        continue;
      }

      let Some(function) = state.metadata().get_function(&job.func_id).await? else {
        continue;
      };
      let Ok(extra) = function.extra_config() else { continue };

      // Effective expression = dynamic override > Function.fixedCronExpr > row cron.
      let dynamic = state.cache().dynamic_cron_expr(&job.id).await?;
      let effective = dynamic.or_else(|| extra.fixed_cron_expr.clone()).unwrap_or_else(|| job.cron_expr.clone());

      if !CronMatcher::is_valid(&effective) {
        continue;
      }
      let tz = job_timezone(job.timezone.as_deref());
      if !CronMatcher::matches(&effective, now, tz).unwrap_or(false) {
        continue;
      }

      let kwargs: Value = serde_json::from_str(&job.func_call_kwargs_json).unwrap_or(json!({}));
      let base_delay = job.seq.rem_euclid(DISTRIBUTION_RANGE);

      enqueue_function_runs(
        state,
        &job.id,
        &job.func_id,
        &extra,
        kwargs,
        now,
        "cron",
        base_delay,
        job.task_record_limit,
      )
      .await?;
      enqueued += 1;
    }

    if (page_len as i64) < PAGE_SIZE {
      break;
    }
  }

  return Ok(enqueued);
}

/// Builds and submits one Task Request per element of `delayedCronJob` (or
/// `[0]` when absent), dropping the enqueue entirely when the target queue
/// is over its admission ceiling (it will simply re-trigger on the next
/// matching tick).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn enqueue_function_runs(
  state: &AppState,
  cron_job_id: &str,
  func_id: &str,
  extra: &taskgrid_schema::entities::FunctionExtraConfig,
  kwargs: Value,
  now: f64,
  exec_mode: &str,
  base_delay: i64,
  task_record_limit: Option<i64>,
) -> Result<()> {
  let queue = extra.queue.unwrap_or(1);
  if !state.queue().is_available(queue).await? {
    return Ok(());
  }

  let delays = extra.delayed_cron_job.clone().unwrap_or_else(|| vec![0]);
  for extra_delay in delays {
    let delay = base_delay as f64 + extra_delay as f64;
    let lock_value = format!("{}:{}", now as i64, Uuid::new_v4());
    let lock_key = state.keys().cron_job_lock(cron_job_id, func_id, exec_mode);

    let request = TaskRequest {
      name: func_id.to_string(),
      id: Uuid::new_v4().to_string(),
      kwargs: kwargs.clone(),
      trigger_time: now,
      queue,
      eta: if delay > 0.0 { Some(now + delay) } else { None },
      delay,
      timeout: extra.timeout.unwrap_or(60) as f64,
      expires: extra.expires.unwrap_or(300) as f64,
      ignore_result: true,
      task_record_limit,
      call_chain: vec![func_id.to_string()],
      cron_job_lock: Some((lock_key, lock_value)),
    };

    if delay > 0.0 {
      state.queue().zadd_delay(queue, &request, now + delay).await?;
    } else {
      state.queue().push(queue, &request).await?;
    }
  }

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;
  use taskgrid_schema::entities::{CronJob, FunctionExtraConfig};

  // Requires a live Redis + the in-process SQLite metadata store; exercises
  // S1 in §8 end to end (modulo the live clock — `run_once` takes `now`
  // explicitly so the scenario is deterministic).
  #[tokio::test]
  #[ignore]
  async fn test_matching_cron_job_enqueues_exactly_one_run() {
    let state = test_state().await;
    let now = 0i64;

    state
      .metadata()
      .upsert_script("fs__s", "fs", "export function plus(a,b){return a+b}", now)
      .await
      .unwrap();

    let extra = FunctionExtraConfig { queue: Some(1), timeout: Some(30), expires: Some(300), ..Default::default() };
    state
      .metadata()
      .connection()
      .execute(
        "INSERT INTO functions (id, title, extra_config_json, create_time, update_time) VALUES ($1, $2, $3, $4, $4)",
        ("fs__s.plus".to_string(), "Plus".to_string(), serde_json::to_string(&extra).unwrap(), now),
      )
      .await
      .unwrap();

    let job = CronJob {
      id: "c1".to_string(),
      seq: 0,
      func_id: "fs__s.plus".to_string(),
      func_call_kwargs_json: r#"{"x":10,"y":20}"#.to_string(),
      cron_expr: "*/2 * * * * *".to_string(),
      timezone: None,
      task_record_limit: None,
      is_disabled: false,
      expire_time: None,
      create_time: now,
      update_time: now,
    };
    state.metadata().upsert_cron_job(&job).await.unwrap();

    assert_eq!(run_once(&state, 10.0).await.unwrap(), 1);
    assert_eq!(run_once(&state, 11.0).await.unwrap(), 0);
    assert_eq!(run_once(&state, 12.0).await.unwrap(), 1);
  }
}
