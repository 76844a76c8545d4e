//! `ReloadDataMD5Cache` (§4.K): recomputes the MD5 index entries for every
//! Script, Connector, and Env Variable and republishes a full replace-all
//! into the shared cache, so a manual row edit bypassing `upsert_script`
//! (direct DB surgery, a restore) is still picked up within one run.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::constants::{MD5_KIND_CONNECTOR, MD5_KIND_ENV_VARIABLE, MD5_KIND_SCRIPT};
use crate::task::{TaskContext, TaskError, TaskRunner};

pub struct ReloadDataMd5CacheTask;

#[async_trait]
impl TaskRunner for ReloadDataMd5CacheTask {
  fn name(&self) -> &str {
    return "Internal.ReloadDataMD5Cache";
  }

  fn exclusive(&self) -> bool {
    return true;
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, _kwargs: Value) -> Result<Value, TaskError> {
    let state = ctx.state;
    let now = ctx.start_time as i64;

    let scripts = state.metadata().list_scripts().await.map_err(to_failure)?;
    let mut script_entries = Vec::with_capacity(scripts.len());
    for script in &scripts {
      state
        .metadata()
        .set_md5_index(MD5_KIND_SCRIPT, &script.id, &script.code_md5, now)
        .await
        .map_err(to_failure)?;
      script_entries.push((script.id.clone(), script.code_md5.clone()));
    }
    state.cache().replace_all_md5(MD5_KIND_SCRIPT, &script_entries).await.map_err(to_failure)?;

    let connectors = state.metadata().list_connectors().await.map_err(to_failure)?;
    let mut connector_entries = Vec::with_capacity(connectors.len());
    for connector in &connectors {
      let md5 = taskgrid_extension::md5_hex_digest(connector.config_json.as_bytes());
      state.metadata().set_md5_index(MD5_KIND_CONNECTOR, &connector.id, &md5, now).await.map_err(to_failure)?;
      connector_entries.push((connector.id.clone(), md5));
    }
    state.cache().replace_all_md5(MD5_KIND_CONNECTOR, &connector_entries).await.map_err(to_failure)?;

    let env_vars = state.metadata().list_env_variables().await.map_err(to_failure)?;
    let mut env_entries = Vec::with_capacity(env_vars.len());
    for var in &env_vars {
      let md5 = taskgrid_extension::md5_hex_digest(var.value_text.as_bytes());
      state.metadata().set_md5_index(MD5_KIND_ENV_VARIABLE, &var.id, &md5, now).await.map_err(to_failure)?;
      env_entries.push((var.id.clone(), md5));
    }
    state.cache().replace_all_md5(MD5_KIND_ENV_VARIABLE, &env_entries).await.map_err(to_failure)?;

    ctx.log(
      ctx.start_time,
      format!(
        "reloaded md5 cache: {} scripts, {} connectors, {} env vars",
        script_entries.len(),
        connector_entries.len(),
        env_entries.len()
      ),
    );

    return Ok(json!({
      "scripts": script_entries.len(),
      "connectors": connector_entries.len(),
      "envVariables": env_entries.len(),
    }));
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
  async fn test_reload_reflects_newly_upserted_script() {
    let state = test_state().await;
    state.metadata().upsert_script("fs__s", "fs", "export function plus(a,b){return a+b}", 0).await.unwrap();

    let request = taskgrid_queue::TaskRequest {
      name: "Internal.ReloadDataMD5Cache".to_string(),
      id: "t1".to_string(),
      kwargs: json!({}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 60.0,
      expires: 290.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &ReloadDataMd5CacheTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    assert_eq!(instance.result.unwrap()["scripts"], 1);
    assert!(state.cache().get_md5(MD5_KIND_SCRIPT, "fs__s").await.unwrap().is_some());
  }
}
