//! DDL for the metadata store. Applied once at startup via [`apply`].
//!
//! Timestamp columns `create_time`/`update_time` are maintained by the write
//! helpers in [`crate::store`], not by triggers, to keep the single writer
//! thread the sole source of truth for "now".

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS script_sets (
  id                TEXT PRIMARY KEY NOT NULL,
  title             TEXT,
  create_time       INTEGER NOT NULL,
  update_time       INTEGER NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS scripts (
  id                TEXT PRIMARY KEY NOT NULL,
  script_set_id     TEXT NOT NULL,
  code              TEXT NOT NULL,
  code_md5          TEXT NOT NULL,
  publish_version   INTEGER NOT NULL DEFAULT 0,
  code_draft        TEXT,
  code_draft_md5    TEXT,
  create_time       INTEGER NOT NULL,
  update_time       INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS scripts_script_set_id ON scripts (script_set_id);

CREATE TABLE IF NOT EXISTS functions (
  id                TEXT PRIMARY KEY NOT NULL,
  title             TEXT NOT NULL,
  category          TEXT,
  tags              TEXT,
  extra_config_json TEXT NOT NULL DEFAULT '{}',
  integration       TEXT,
  create_time       INTEGER NOT NULL,
  update_time       INTEGER NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS cron_jobs (
  id                  TEXT PRIMARY KEY NOT NULL,
  seq                 INTEGER NOT NULL,
  func_id             TEXT NOT NULL,
  func_call_kwargs_json TEXT NOT NULL DEFAULT '{}',
  cron_expr           TEXT NOT NULL,
  timezone            TEXT,
  task_record_limit   INTEGER,
  is_disabled         INTEGER NOT NULL DEFAULT 0,
  expire_time         INTEGER,
  create_time         INTEGER NOT NULL,
  update_time         INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS cron_jobs_seq ON cron_jobs (seq);

CREATE TABLE IF NOT EXISTS sync_apis (
  id                    TEXT PRIMARY KEY NOT NULL,
  func_id               TEXT NOT NULL,
  func_call_kwargs_json TEXT NOT NULL DEFAULT '{}',
  api_auth_id           TEXT,
  task_record_limit     INTEGER,
  create_time           INTEGER NOT NULL,
  update_time           INTEGER NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS async_apis (
  id                    TEXT PRIMARY KEY NOT NULL,
  func_id               TEXT NOT NULL,
  func_call_kwargs_json TEXT NOT NULL DEFAULT '{}',
  api_auth_id           TEXT,
  task_record_limit     INTEGER,
  create_time           INTEGER NOT NULL,
  update_time           INTEGER NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS connectors (
  id            TEXT PRIMARY KEY NOT NULL,
  type          TEXT NOT NULL,
  config_json   TEXT NOT NULL,
  create_time   INTEGER NOT NULL,
  update_time   INTEGER NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS env_variables (
  id                  TEXT PRIMARY KEY NOT NULL,
  auto_type_casting   TEXT NOT NULL DEFAULT 'string',
  value_text          TEXT NOT NULL,
  create_time         INTEGER NOT NULL,
  update_time         INTEGER NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS func_store (
  scope         TEXT NOT NULL,
  key           TEXT NOT NULL,
  value_json    TEXT NOT NULL,
  expire_at     INTEGER,
  update_time   INTEGER NOT NULL,
  PRIMARY KEY (scope, key)
) STRICT;

CREATE TABLE IF NOT EXISTS task_records (
  seq           INTEGER PRIMARY KEY AUTOINCREMENT,
  id            TEXT NOT NULL,
  origin_id     TEXT NOT NULL,
  name          TEXT NOT NULL,
  trigger_time  INTEGER NOT NULL,
  start_time    INTEGER,
  end_time      INTEGER,
  status        TEXT NOT NULL,
  result_json   TEXT,
  exception     TEXT,
  traceback     TEXT
) STRICT;
CREATE INDEX IF NOT EXISTS task_records_origin_id ON task_records (origin_id);

CREATE TABLE IF NOT EXISTS task_record_funcs (
  seq           INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id       TEXT NOT NULL,
  func_id       TEXT NOT NULL,
  cost_ms       INTEGER NOT NULL,
  status        TEXT NOT NULL,
  create_time   INTEGER NOT NULL
) STRICT;
CREATE INDEX IF NOT EXISTS task_record_funcs_func_id ON task_record_funcs (func_id);

CREATE TABLE IF NOT EXISTS md5_index (
  data_type     TEXT NOT NULL,
  entity_id     TEXT NOT NULL,
  md5           TEXT NOT NULL,
  update_time   INTEGER NOT NULL,
  PRIMARY KEY (data_type, entity_id)
) STRICT;

CREATE TABLE IF NOT EXISTS function_call_counts (
  func_id       TEXT NOT NULL,
  minute_ts     INTEGER NOT NULL,
  count         INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (func_id, minute_ts)
) STRICT;

CREATE TABLE IF NOT EXISTS system_settings (
  key           TEXT PRIMARY KEY NOT NULL,
  value_json    TEXT NOT NULL,
  update_time   INTEGER NOT NULL
) STRICT;
"#;

/// Applies the metadata-store DDL. Idempotent: safe to call on every process
/// start (`CREATE TABLE IF NOT EXISTS`).
pub async fn apply(conn: &taskgrid_sqlite::Connection) -> taskgrid_sqlite::Result<()> {
  conn.execute_batch(SCHEMA).await?;
  return Ok(());
}
