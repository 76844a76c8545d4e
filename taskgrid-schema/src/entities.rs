//! Row-oriented domain entities for the metadata store, per the data model in
//! §3: Script, Function, Cron Job, Sync/Async API, Connector, Env Variable,
//! Func Store, Task Record(Func).

use serde::{Deserialize, Serialize};

/// `{id, scriptSetId, code, codeMD5, publishVersion, codeDraft, codeDraftMD5}`.
/// `id` contains `__` to denote `scriptSet__name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
  pub id: String,
  pub script_set_id: String,
  pub code: String,
  pub code_md5: String,
  pub publish_version: i64,
  pub code_draft: Option<String>,
  pub code_draft_md5: Option<String>,
  pub create_time: i64,
  pub update_time: i64,
}

impl Script {
  /// Splits `scriptSet__name` into `(scriptSet, name)`.
  pub fn split_id(id: &str) -> Option<(&str, &str)> {
    return id.split_once("__");
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationConfig {
  pub cron_expr: Option<String>,
  pub on_system_launch: bool,
  pub on_script_publish: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Integration {
  SignIn,
  AutoRun,
}

/// Function extra config, stored as JSON in the `extra_config` column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionExtraConfig {
  pub timeout: Option<i64>,
  pub expires: Option<i64>,
  pub queue: Option<i64>,
  pub cache_result: Option<i64>,
  pub fixed_cron_expr: Option<String>,
  pub delayed_cron_job: Option<Vec<i64>>,
  pub integration_config: Option<IntegrationConfig>,
}

/// `{id = scriptId + "." + name, title, category, tags, extraConfig, integration}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
  pub id: String,
  pub title: String,
  pub category: Option<String>,
  /// comma-separated tags, matching the metadata store's flat column convention.
  pub tags: Option<String>,
  pub extra_config_json: String,
  pub integration: Option<String>,
  pub create_time: i64,
  pub update_time: i64,
}

impl Function {
  pub fn script_id(&self) -> Option<&str> {
    return self.id.rsplit_once('.').map(|(script, _name)| script);
  }

  pub fn extra_config(&self) -> serde_json::Result<FunctionExtraConfig> {
    return serde_json::from_str(&self.extra_config_json);
  }
}

/// `{id, funcId, funcCallKwargs, cronExpr, timezone, taskRecordLimit, isDisabled, expireTime}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
  pub id: String,
  pub seq: i64,
  pub func_id: String,
  pub func_call_kwargs_json: String,
  pub cron_expr: String,
  pub timezone: Option<String>,
  pub task_record_limit: Option<i64>,
  pub is_disabled: bool,
  pub expire_time: Option<i64>,
  pub create_time: i64,
  pub update_time: i64,
}

/// `{id, funcId, funcCallKwargsJSON, apiAuthId, taskRecordLimit}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncApi {
  pub id: String,
  pub func_id: String,
  pub func_call_kwargs_json: String,
  pub api_auth_id: Option<String>,
  pub task_record_limit: Option<i64>,
  pub create_time: i64,
  pub update_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncApi {
  pub id: String,
  pub func_id: String,
  pub func_call_kwargs_json: String,
  pub api_auth_id: Option<String>,
  pub task_record_limit: Option<i64>,
  pub create_time: i64,
  pub update_time: i64,
}

/// `{id, type, configJSON}`; cipher fields in `configJSON` are AES-enciphered
/// with the row `id` as associated data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
  pub id: String,
  #[serde(rename = "type")]
  pub connector_type: String,
  pub config_json: String,
  pub create_time: i64,
  pub update_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoTypeCasting {
  Integer,
  Float,
  Boolean,
  Json,
  CommaArray,
  Password,
  String,
}

/// `{id, autoTypeCasting, valueTEXT}`; passwords are AES-enciphered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVariable {
  pub id: String,
  pub auto_type_casting: String,
  pub value_text: String,
  pub create_time: i64,
  pub update_time: i64,
}

/// Durable key/value scoped mapping, at-most-one row per `(scope, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncStoreEntry {
  pub scope: String,
  pub key: String,
  pub value_json: String,
  pub expire_at: Option<i64>,
  pub update_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Waiting,
  Pending,
  Success,
  Failure,
  Timeout,
  Skip,
  Expire,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    return match self {
      TaskStatus::Waiting => "waiting",
      TaskStatus::Pending => "pending",
      TaskStatus::Success => "success",
      TaskStatus::Failure => "failure",
      TaskStatus::Timeout => "timeout",
      TaskStatus::Skip => "skip",
      TaskStatus::Expire => "expire",
    };
  }
}

/// Append-only task history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
  pub seq: i64,
  pub id: String,
  pub origin_id: String,
  pub name: String,
  pub trigger_time: i64,
  pub start_time: Option<i64>,
  pub end_time: Option<i64>,
  pub status: String,
  pub result_json: Option<String>,
  pub exception: Option<String>,
  pub traceback: Option<String>,
}

/// Append-only per-function-call history row (`task records (functions)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecordFunc {
  pub seq: i64,
  pub task_id: String,
  pub func_id: String,
  pub cost_ms: i64,
  pub status: String,
  pub create_time: i64,
}

/// Minute-bucketed invocation count per Function, rolled up by
/// `FlushDataBuffer` from committed Task Records (§4.K, §4.L).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallCount {
  pub func_id: String,
  pub minute_ts: i64,
  pub count: i64,
}

/// MD5 Index row: `dataType → {entityId → md5}`, flattened to one row per
/// `(data_type, entity_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Md5IndexEntry {
  pub data_type: String,
  pub entity_id: String,
  pub md5: String,
  pub update_time: i64,
}
