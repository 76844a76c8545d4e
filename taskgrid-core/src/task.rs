//! Task Base (§4.G): the lifecycle envelope common to every task class —
//! Cron Job Starter runs, Internal Tasks, and Function runs alike. `execute`
//! drives one Task Request through `start()`/`finally` exactly once; the
//! task classes themselves only implement [`TaskRunner::run`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use taskgrid_queue::TaskRequest;
use taskgrid_schema::entities::{TaskRecord, TaskStatus};

use crate::app_state::AppState;
use crate::logging::TaskLogBuffer;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
  #[error("previous run of this task class has not finished")]
  PreviousTaskNotFinished,

  #[error("task wait budget exceeded: waited {wait_cost:.3}s > expires {expires:.3}s")]
  Expired { wait_cost: f64, expires: f64 },

  /// Never produced by [`TaskRunner::run`] directly — `execute` raises this
  /// itself when the wall-clock deadline elapses. Kept as a variant (rather
  /// than folded into `Failure`) so it is never caught by the generic
  /// failure arm (§10.B).
  #[error("task timed out after {0:.3}s")]
  Timeout(f64),

  /// Warning-like user error: completes the task with status `skip`,
  /// logged at warning, never surfaced as a failure.
  #[error("warning: {0}")]
  Warning(String),

  #[error("{0}")]
  Failure(String),
}

/// Handle passed to [`TaskRunner::run`]; the only way task-class code
/// touches shared state, breaking the cyclic Task ↔ helpers ↔ Task
/// relationship the original implementation has (§9).
pub struct TaskContext<'a> {
  pub state: &'a AppState,
  pub request: &'a TaskRequest,
  pub start_time: f64,
  log_buffer: &'a mut TaskLogBuffer,
  secrets: &'a [String],
}

impl<'a> TaskContext<'a> {
  /// Appends a timestamped, secret-masked line to the task's print/log
  /// capture (§4.F), persisted into the Task Record, never routed through
  /// the process-wide `tracing` sinks.
  pub fn log(&mut self, now: f64, message: impl Into<String>) {
    self.log_buffer.push(now, &message.into(), self.secrets);
  }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
  fn name(&self) -> &str;

  /// Task classes that must not run two instances concurrently (Cron Job
  /// Starter itself, several Internal Tasks) return `true`; Task Base then
  /// enforces mutual exclusion via the shared task-class lock (§4.C).
  fn exclusive(&self) -> bool {
    return false;
  }

  /// Env-variable values of kind `password` observed while constructing
  /// this run, so `ctx.log` can mask them (invariant 7). Empty by default.
  fn secrets(&self) -> Vec<String> {
    return vec![];
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, kwargs: serde_json::Value) -> Result<serde_json::Value, TaskError>;
}

/// Wire shape published to the global Task Response channel (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
  pub name: String,
  pub id: String,
  pub trigger_time: f64,
  pub start_time: f64,
  pub end_time: f64,
  /// `"IGNORED"` is never actually sent — a response is only published
  /// when `ignore_result` is false, so `result` is always the real value.
  pub result: serde_json::Value,
  pub status: String,
  pub exception: Option<String>,
  pub exception_type: Option<String>,
  pub traceback: Option<String>,
}

pub struct TaskInstance {
  pub request: TaskRequest,
  pub start_time: f64,
  pub end_time: f64,
  pub status: TaskStatus,
  pub result: Option<serde_json::Value>,
  pub exception: Option<String>,
  pub traceback: Option<String>,
}

/// Drives one Task Request through the full lifecycle: wait-budget check,
/// optional task-class lock, timeout-bounded `run()`, status mapping,
/// finally-block cleanup (record buffering, response publication, lock
/// release). Never panics on a `runner.run()` error — every `TaskError`
/// variant maps to a terminal status.
pub async fn execute(state: &AppState, request: TaskRequest, runner: &dyn TaskRunner) -> TaskInstance {
  let now = state.time().now().await.unwrap_or_else(|_| unix_now());
  let mut log_buffer = TaskLogBuffer::new(now);
  let secrets = runner.secrets();

  let wait_cost = now - request.trigger_time;
  if wait_cost > request.expires {
    return finish(
      state,
      request,
      now,
      now,
      TaskStatus::Expire,
      None,
      Some(TaskError::Expired { wait_cost, expires: request.expires }.to_string()),
      None,
      log_buffer,
    )
    .await;
  }

  let mut held_lock: Option<(String, String)> = None;
  if runner.exclusive() {
    let key = state.keys().task_class_lock(&request.name);
    let value = uuid::Uuid::new_v4().to_string();
    let ttl = Duration::from_secs_f64(request.timeout.max(1.0));

    match state.locks().lock(&key, &value, ttl).await {
      Ok(true) => held_lock = Some((key, value)),
      Ok(false) => {
        return finish(
          state,
          request,
          now,
          now,
          TaskStatus::Skip,
          None,
          Some(TaskError::PreviousTaskNotFinished.to_string()),
          None,
          log_buffer,
        )
        .await;
      }
      Err(e) => {
        return finish(
          state,
          request,
          now,
          now,
          TaskStatus::Failure,
          None,
          Some(format!("task-class lock unavailable: {e}")),
          None,
          log_buffer,
        )
        .await;
      }
    }
  }

  // The Cron Job lock (§4.J), if this request carries one, must be released
  // at the end of the run *including on timeout* — so it is acquired and
  // released here, around the same `tokio::time::timeout` that bounds
  // `runner.run`, rather than inside the runner itself. A release sequenced
  // after a cancellable `.await` would never run when that await is the one
  // `timeout` drops.
  let mut held_cron_lock: Option<(String, String)> = None;
  if let Some((key, value)) = &request.cron_job_lock {
    let ttl = Duration::from_secs_f64(request.timeout.max(1.0));
    match state.locks().lock(key, value, ttl).await {
      Ok(true) => held_cron_lock = Some((key.clone(), value.clone())),
      Ok(false) => {
        if let Some((key, value)) = held_lock {
          let _ = state.locks().unlock(&key, &value).await;
        }
        return finish(
          state,
          request,
          now,
          now,
          TaskStatus::Skip,
          None,
          Some(TaskError::Warning(format!("cron job lock {key} already held")).to_string()),
          None,
          log_buffer,
        )
        .await;
      }
      Err(e) => {
        if let Some((key, value)) = held_lock {
          let _ = state.locks().unlock(&key, &value).await;
        }
        return finish(
          state,
          request,
          now,
          now,
          TaskStatus::Failure,
          None,
          Some(format!("cron job lock unavailable: {e}")),
          None,
          log_buffer,
        )
        .await;
      }
    }
  }

  let timeout = Duration::from_secs_f64(request.timeout.max(0.0));
  let kwargs = request.kwargs.clone();

  let outcome = {
    let mut ctx = TaskContext {
      state,
      request: &request,
      start_time: now,
      log_buffer: &mut log_buffer,
      secrets: &secrets,
    };
    tokio::time::timeout(timeout, runner.run(&mut ctx, kwargs)).await
  };

  let end_time = state.time().now().await.unwrap_or_else(|_| unix_now());

  if let Some((key, value)) = &held_cron_lock {
    let _ = state.locks().unlock(key, value).await;
  }

  let (status, result, exception, traceback) = match outcome {
    Err(_elapsed) => (
      TaskStatus::Timeout,
      None,
      Some(TaskError::Timeout(request.timeout).to_string()),
      Some(format!("task {} exceeded its {:.3}s timeout", request.name, request.timeout)),
    ),
    Ok(Ok(value)) => (TaskStatus::Success, Some(value), None, None),
    Ok(Err(TaskError::PreviousTaskNotFinished)) => {
      (TaskStatus::Skip, None, Some(TaskError::PreviousTaskNotFinished.to_string()), None)
    }
    Ok(Err(e @ TaskError::Expired { .. })) => (TaskStatus::Expire, None, Some(e.to_string()), None),
    Ok(Err(e @ TaskError::Timeout(_))) => (TaskStatus::Timeout, None, Some(e.to_string()), Some(e.to_string())),
    Ok(Err(e @ TaskError::Warning(_))) => (TaskStatus::Skip, None, Some(e.to_string()), None),
    Ok(Err(e @ TaskError::Failure(_))) => (TaskStatus::Failure, None, Some(e.to_string()), Some(e.to_string())),
  };

  if let Some((key, value)) = held_lock {
    let _ = state.locks().unlock(&key, &value).await;
  }

  return finish(state, request, now, end_time, status, result, exception, traceback, log_buffer).await;
}

#[allow(clippy::too_many_arguments)]
async fn finish(
  state: &AppState,
  request: TaskRequest,
  start_time: f64,
  end_time: f64,
  status: TaskStatus,
  result: Option<serde_json::Value>,
  exception: Option<String>,
  traceback: Option<String>,
  log_buffer: TaskLogBuffer,
) -> TaskInstance {
  let record = TaskRecord {
    seq: 0,
    id: request.id.clone(),
    origin_id: request.id.clone(),
    name: request.name.clone(),
    trigger_time: request.trigger_time as i64,
    start_time: Some(start_time as i64),
    end_time: Some(end_time as i64),
    status: status.as_str().to_string(),
    result_json: result.as_ref().map(|v| v.to_string()),
    exception: exception.clone(),
    traceback: traceback.clone().or_else(|| {
      let rendered = log_buffer.render();
      if rendered.is_empty() {
        None
      } else {
        Some(rendered)
      }
    }),
  };

  if let Err(e) = state.metadata().insert_task_record(&record).await {
    tracing::warn!(task_id = %request.id, error = %e, "failed to buffer task record");
  }

  if !request.ignore_result {
    let response = TaskResponse {
      name: request.name.clone(),
      id: request.id.clone(),
      trigger_time: request.trigger_time,
      start_time,
      end_time,
      result: result.clone().unwrap_or(serde_json::Value::Null),
      status: status.as_str().to_string(),
      exception: exception.clone(),
      exception_type: exception.as_ref().map(|_| "TaskError".to_string()),
      traceback: traceback.clone(),
    };

    if let Ok(payload) = serde_json::to_string(&response) {
      let channel = state.keys().task_response_channel();
      if let Err(e) = state.queue().publish(&channel, &payload).await {
        tracing::warn!(task_id = %request.id, error = %e, "failed to publish task response");
      }
    }
  }

  return TaskInstance { request, start_time, end_time, status, result, exception, traceback };
}

fn unix_now() -> f64 {
  return std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs_f64();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;

  struct EchoTask;

  #[async_trait]
  impl TaskRunner for EchoTask {
    fn name(&self) -> &str {
      return "test.echo";
    }

    async fn run(&self, ctx: &mut TaskContext<'_>, kwargs: serde_json::Value) -> Result<serde_json::Value, TaskError> {
      ctx.log(ctx.start_time, "running echo");
      return Ok(kwargs);
    }
  }

  struct SleepTask(Duration);

  #[async_trait]
  impl TaskRunner for SleepTask {
    fn name(&self) -> &str {
      return "test.sleep";
    }

    async fn run(&self, _ctx: &mut TaskContext<'_>, _kwargs: serde_json::Value) -> Result<serde_json::Value, TaskError> {
      tokio::time::sleep(self.0).await;
      return Ok(serde_json::Value::Null);
    }
  }

  fn sample_request(name: &str, timeout: f64, expires: f64) -> TaskRequest {
    return TaskRequest {
      name: name.to_string(),
      id: uuid::Uuid::new_v4().to_string(),
      kwargs: serde_json::json!({"x": 1}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout,
      expires,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };
  }

  // These exercise `execute`, which sources `now()` from the shared store;
  // they require a live Redis reachable at TASKGRID_TEST_REDIS_URL.
  #[tokio::test]
  #[ignore]
  async fn test_expired_wait_never_invokes_run() {
    let state = test_state().await;
    let request = sample_request("test.echo", 5.0, 0.0);
    let instance = execute(&state, request, &EchoTask).await;
    assert_eq!(instance.status, TaskStatus::Expire);
    assert!(instance.result.is_none());
  }

  #[tokio::test]
  #[ignore]
  async fn test_success_returns_run_value() {
    let state = test_state().await;
    let request = sample_request("test.echo", 5.0, 300.0);
    let instance = execute(&state, request, &EchoTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    assert_eq!(instance.result, Some(serde_json::json!({"x": 1})));
  }

  #[tokio::test]
  #[ignore]
  async fn test_timeout_maps_to_timeout_status() {
    let state = test_state().await;
    let request = sample_request("test.sleep", 0.05, 300.0);
    let instance = execute(&state, request, &SleepTask(Duration::from_millis(500))).await;
    assert_eq!(instance.status, TaskStatus::Timeout);
    assert!(instance.traceback.is_some());
  }
}
