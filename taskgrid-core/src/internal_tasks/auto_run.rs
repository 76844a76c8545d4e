//! `AutoRun` (§4.K): enqueues every Function with
//! `integrationConfig.onSystemLaunch` set. The reference scheduler fires
//! this once per process boot; Beat is a stateless pool of equally eligible
//! leader candidates with no single "boot" moment to hook, so this is
//! re-asserted on a daily cron instead (`beat.rs`'s `system_task_metas`) —
//! idempotent because each run's origin id is fixed per Function, so the
//! usual Cron-Job-lock machinery still dedupes concurrent executions.

use async_trait::async_trait;
use serde_json::{json, Value};

use taskgrid_schema::entities::{FunctionExtraConfig, IntegrationConfig};

use crate::cron_job_starter::enqueue_function_runs;
use crate::task::{TaskContext, TaskError, TaskRunner};

pub struct AutoRunTask;

#[async_trait]
impl TaskRunner for AutoRunTask {
  fn name(&self) -> &str {
    return "Internal.AutoRun";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time;

    let mut enqueued = 0u32;
    for function in state.metadata().list_all_functions().await.map_err(to_failure)? {
      let Ok(extra) = function.extra_config() else { continue };
      let wants_launch = extra.integration_config.as_ref().is_some_and(|c| c.on_system_launch);
      if !wants_launch {
        continue;
      }

      let origin_id = format!("autoRun.onSystemLaunch-{}", function.id);
      enqueue_function_runs(state, &origin_id, &function.id, &extra, json!({}), now, "launch", 0, None)
        .await
        .map_err(to_failure)?;
      enqueued += 1;
    }

    ctx.log(ctx.start_time, format!("auto run enqueued {enqueued} functions"));
    return Ok(json!({"enqueued": enqueued}));
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
  async fn test_auto_run_enqueues_only_launch_functions() {
    let state = test_state().await;
    state.metadata().upsert_script("fs__s", "fs", "export function boot(){}\nexport function plain(){}", 0).await.unwrap();

    let launch_extra = FunctionExtraConfig {
      integration_config: Some(IntegrationConfig { on_system_launch: true, ..Default::default() }),
      ..Default::default()
    };
    state
      .metadata()
      .connection()
      .execute(
        "INSERT INTO functions (id, title, extra_config_json, create_time, update_time) VALUES ($1, $2, $3, 0, 0)",
        ("fs__s.boot".to_string(), "boot".to_string(), serde_json::to_string(&launch_extra).unwrap()),
      )
      .await
      .unwrap();
    state
      .metadata()
      .connection()
      .execute(
        "INSERT INTO functions (id, title, extra_config_json, create_time, update_time) VALUES ($1, $2, $3, 0, 0)",
        ("fs__s.plain".to_string(), "plain".to_string(), serde_json::to_string(&FunctionExtraConfig::default()).unwrap()),
      )
      .await
      .unwrap();

    let request = taskgrid_queue::TaskRequest {
      name: "Internal.AutoRun".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 60.0,
      expires: 3600.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &AutoRunTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    assert_eq!(instance.result.unwrap()["enqueued"], 1);
  }
}
