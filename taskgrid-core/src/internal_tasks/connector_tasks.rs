//! `CheckConnector`, `QueryConnector` (§4.K): run a Connector's health check
//! or a typed query against the configured backend, under the large
//! dedicated timeout connectors get instead of an ordinary Function call.
//! Dialect-specific query syntax for every supported backend is explicitly
//! out of scope; this module enumerates the kinds it can concretely drive
//! (`redis`, `sqlite`) and returns `RuntimeError::UnsupportedConnector` for
//! everything else, the same typed-error boundary `runtime.rs`'s `CONN.get`
//! already draws around unknown/unsupported kinds.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskgrid_schema::entities::Connector;

use crate::constants::CONNECTOR_OPERATION_TIMEOUT;
use crate::task::{TaskContext, TaskError, TaskRunner};

fn base64_decode(s: &str) -> Vec<u8> {
  use base64::Engine;
  return base64::engine::general_purpose::STANDARD.decode(s).unwrap_or_default();
}

/// Deciphers the `configJSON` fields an operator would have entered as
/// secrets, mirroring `runtime.rs`'s `decrypt_connector_config`.
fn decrypt_connector_config(state: &crate::app_state::AppState, row: &Connector) -> Result<Value, TaskError> {
  let mut config: Value = serde_json::from_str(&row.config_json).map_err(|e| TaskError::Failure(e.to_string()))?;
  if let Value::Object(map) = &mut config {
    for (key, value) in map.iter_mut() {
      if key.ends_with("_secret") || key == "password" || key == "token" || key == "secret" {
        if let Value::String(encoded) = value {
          let bytes = base64_decode(encoded);
          if let Ok(plain) = taskgrid_extension::decrypt(state.cipher_key(), row.id.as_bytes(), &bytes) {
            *value = Value::String(String::from_utf8_lossy(&plain).to_string());
          }
        }
      }
    }
  }
  return Ok(config);
}

async fn load_connector(state: &crate::app_state::AppState, id: &str) -> Result<(Connector, Value), TaskError> {
  let row = state
    .metadata()
    .get_connector(id)
    .await
    .map_err(|e| TaskError::Failure(e.to_string()))?
    .ok_or_else(|| TaskError::Failure(format!("unknown connector: {id}")))?;
  let config = decrypt_connector_config(state, &row)?;
  return Ok((row, config));
}

fn rusqlite_value_to_json(value: &rusqlite::types::Value) -> Value {
  return match value {
    rusqlite::types::Value::Null => Value::Null,
    rusqlite::types::Value::Integer(i) => json!(i),
    rusqlite::types::Value::Real(f) => json!(f),
    rusqlite::types::Value::Text(s) => json!(s),
    rusqlite::types::Value::Blob(b) => json!(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b)),
  };
}

async fn check_redis(config: &Value) -> Result<Value, TaskError> {
  let url = config
    .get("url")
    .and_then(Value::as_str)
    .ok_or_else(|| TaskError::Failure("redis connector config missing \"url\"".to_string()))?;
  let client = redis::Client::open(url).map_err(|e| TaskError::Failure(e.to_string()))?;
  let mut conn = client.get_multiplexed_async_connection().await.map_err(|e| TaskError::Failure(e.to_string()))?;
  let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| TaskError::Failure(e.to_string()))?;
  return Ok(json!({"kind": "redis", "reachable": pong == "PONG"}));
}

async fn query_redis(config: &Value, command: &Value) -> Result<Value, TaskError> {
  let url = config
    .get("url")
    .and_then(Value::as_str)
    .ok_or_else(|| TaskError::Failure("redis connector config missing \"url\"".to_string()))?;
  let args = command
    .get("args")
    .and_then(Value::as_array)
    .ok_or_else(|| TaskError::Failure("redis query requires {\"args\": [...]}".to_string()))?;

  let client = redis::Client::open(url).map_err(|e| TaskError::Failure(e.to_string()))?;
  let mut conn = client.get_multiplexed_async_connection().await.map_err(|e| TaskError::Failure(e.to_string()))?;

  let mut cmd = redis::cmd(
    args
      .first()
      .and_then(Value::as_str)
      .ok_or_else(|| TaskError::Failure("redis query's first arg must be the command name".to_string()))?,
  );
  for arg in args.iter().skip(1) {
    match arg {
      Value::String(s) => {
        cmd.arg(s);
      }
      Value::Number(n) => {
        cmd.arg(n.to_string());
      }
      other => {
        cmd.arg(other.to_string());
      }
    }
  }
  let reply: redis::Value = cmd.query_async(&mut conn).await.map_err(|e| TaskError::Failure(e.to_string()))?;
  return Ok(redis_value_to_json(&reply));
}

fn redis_value_to_json(value: &redis::Value) -> Value {
  return match value {
    redis::Value::Nil => Value::Null,
    redis::Value::Int(i) => json!(i),
    redis::Value::BulkString(b) => json!(String::from_utf8_lossy(b)),
    redis::Value::SimpleString(s) => json!(s),
    redis::Value::Okay => json!("OK"),
    redis::Value::Boolean(b) => json!(b),
    redis::Value::Double(d) => json!(d),
    redis::Value::Array(items) | redis::Value::Set(items) => Value::Array(items.iter().map(redis_value_to_json).collect()),
    redis::Value::Map(entries) => {
      Value::Array(entries.iter().flat_map(|(k, v)| [redis_value_to_json(k), redis_value_to_json(v)]).collect())
    }
    _ => Value::Null,
  };
}

async fn check_sqlite(config: &Value) -> Result<Value, TaskError> {
  let path = config
    .get("path")
    .and_then(Value::as_str)
    .ok_or_else(|| TaskError::Failure("sqlite connector config missing \"path\"".to_string()))?;
  let path = path.to_string();
  let conn = taskgrid_sqlite::Connection::from_conn(
    rusqlite::Connection::open(&path).map_err(|e| TaskError::Failure(e.to_string()))?,
  )
  .await
  .map_err(|e| TaskError::Failure(e.to_string()))?;
  let _: i64 = conn
    .query_value("SELECT 1", taskgrid_sqlite::params!())
    .await
    .map_err(|e| TaskError::Failure(e.to_string()))?;
  return Ok(json!({"kind": "sqlite", "reachable": true}));
}

async fn query_sqlite(config: &Value, command: &Value) -> Result<Value, TaskError> {
  let path = config
    .get("path")
    .and_then(Value::as_str)
    .ok_or_else(|| TaskError::Failure("sqlite connector config missing \"path\"".to_string()))?;
  let sql = command
    .get("sql")
    .and_then(Value::as_str)
    .ok_or_else(|| TaskError::Failure("sqlite query requires {\"sql\": \"...\"}".to_string()))?;

  let path = path.to_string();
  let sql = sql.to_string();
  let conn = taskgrid_sqlite::Connection::from_conn(
    rusqlite::Connection::open(&path).map_err(|e| TaskError::Failure(e.to_string()))?,
  )
  .await
  .map_err(|e| TaskError::Failure(e.to_string()))?;

  let rows = conn.query(&sql, taskgrid_sqlite::params!()).await.map_err(|e| TaskError::Failure(e.to_string()))?;
  let columns: Vec<String> = rows.column_names().iter().map(|s| s.to_string()).collect();
  let mut out = Vec::with_capacity(rows.len());
  for row in rows.iter() {
    let mut obj = serde_json::Map::with_capacity(columns.len());
    for (i, name) in columns.iter().enumerate() {
      if let Some(v) = row.get_value(i) {
        obj.insert(name.clone(), rusqlite_value_to_json(v));
      }
    }
    out.push(Value::Object(obj));
  }
  return Ok(json!(out));
}

async fn run_check(kind: &str, config: &Value) -> Result<Value, TaskError> {
  return match kind {
    "redis" => check_redis(config).await,
    "sqlite" => check_sqlite(config).await,
    other => Err(TaskError::Failure(format!("unsupported connector kind: {other}"))),
  };
}

async fn run_query(kind: &str, config: &Value, command: &Value) -> Result<Value, TaskError> {
  return match kind {
    "redis" => query_redis(config, command).await,
    "sqlite" => query_sqlite(config, command).await,
    other => Err(TaskError::Failure(format!("unsupported connector kind: {other}"))),
  };
}

async fn with_connector_timeout<F, T>(fut: F) -> Result<T, TaskError>
where
  F: std::future::Future<Output = Result<T, TaskError>>,
{
  return match tokio::time::timeout(CONNECTOR_OPERATION_TIMEOUT, fut).await {
    Ok(result) => result,
    Err(_) => Err(TaskError::Timeout(CONNECTOR_OPERATION_TIMEOUT.as_secs_f64())),
  };
}

pub struct CheckConnectorTask;

#[async_trait]
impl TaskRunner for CheckConnectorTask {
  fn name(&self) -> &str {
    return "Internal.CheckConnector";
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, kwargs: Value) -> Result<Value, TaskError> {
    let id = kwargs
      .get("connectorId")
      .and_then(Value::as_str)
      .ok_or_else(|| TaskError::Failure("missing \"connectorId\"".to_string()))?;

    let (row, config) = load_connector(ctx.state, id).await?;
    let result = with_connector_timeout(run_check(&row.connector_type, &config)).await?;
    ctx.log(ctx.start_time, format!("checked connector {id} ({})", row.connector_type));
    return Ok(result);
  }
}

pub struct QueryConnectorTask;

#[async_trait]
impl TaskRunner for QueryConnectorTask {
  fn name(&self) -> &str {
    return "Internal.QueryConnector";
  }

  async fn run(&self, ctx: &mut TaskContext<'_>, kwargs: Value) -> Result<Value, TaskError> {
    let id = kwargs
      .get("connectorId")
      .and_then(Value::as_str)
      .ok_or_else(|| TaskError::Failure("missing \"connectorId\"".to_string()))?;
    let command = kwargs.get("command").cloned().unwrap_or(Value::Null);

    let (row, config) = load_connector(ctx.state, id).await?;
    let result = with_connector_timeout(run_query(&row.connector_type, &config, &command)).await?;
    ctx.log(ctx.start_time, format!("queried connector {id} ({})", row.connector_type));
    return Ok(result);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_state::test_state;
  use crate::task::execute;
  use taskgrid_schema::entities::TaskStatus;

  async fn insert_connector(state: &crate::app_state::AppState, id: &str, kind: &str, config_json: &str) {
    state
      .metadata()
      .connection()
      .execute(
        "INSERT INTO connectors (id, type, config_json, create_time, update_time) VALUES ($1, $2, $3, 0, 0)",
        (id.to_string(), kind.to_string(), config_json.to_string()),
      )
      .await
      .unwrap();
  }

  #[tokio::test]
  #[ignore]
  async fn test_check_connector_reports_unsupported_kind() {
    let state = test_state().await;
    insert_connector(&state, "conn1", "carrier_pigeon", "{}").await;

    let request = taskgrid_queue::TaskRequest {
      name: "Internal.CheckConnector".to_string(),
      id: "t1".to_string(),
      kwargs: json!({"connectorId": "conn1"}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 130.0,
      expires: 300.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &CheckConnectorTask).await;
    assert_eq!(instance.status, TaskStatus::Failure);
  }

  #[tokio::test]
  #[ignore]
  async fn test_query_sqlite_connector_returns_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conn.sqlite3");
    {
      let conn = rusqlite::Connection::open(&path).unwrap();
      conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", []).unwrap();
      conn.execute("INSERT INTO t (name) VALUES ('a'), ('b')", []).unwrap();
    }

    let state = test_state().await;
    insert_connector(&state, "conn1", "sqlite", &json!({"path": path.to_str().unwrap()}).to_string()).await;

    let request = taskgrid_queue::TaskRequest {
      name: "Internal.QueryConnector".to_string(),
      id: "t1".to_string(),
      kwargs: json!({"connectorId": "conn1", "command": {"sql": "SELECT id, name FROM t ORDER BY id"}}),
      trigger_time: 0.0,
      queue: 1,
      eta: None,
      delay: 0.0,
      timeout: 130.0,
      expires: 300.0,
      ignore_result: true,
      task_record_limit: None,
      call_chain: vec![],
      cron_job_lock: None,
    };

    let instance = execute(&state, request, &QueryConnectorTask).await;
    assert_eq!(instance.status, TaskStatus::Success);
    let rows = instance.result.unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 2);
  }
}
