//! Repository layer over the metadata store: row-oriented CRUD for every
//! entity enumerated in §3, plus the SEQ-based rolling helpers of §4.D.

use crate::entities::{
  AsyncApi, Connector, CronJob, EnvVariable, Function, FuncStoreEntry, FunctionCallCount, Md5IndexEntry, Script,
  SyncApi, TaskRecord, TaskRecordFunc,
};
use crate::error::{MetadataError, Result};
use crate::migrations;
use crate::rolling;

/// A pooled handle onto the metadata store. Cheap to clone; internally a
/// handle to the background SQLite writer thread (see `taskgrid_sqlite`).
#[derive(Clone)]
pub struct MetadataStore {
  conn: taskgrid_sqlite::Connection,
}

impl MetadataStore {
  pub async fn open(path: Option<std::path::PathBuf>) -> Result<Self> {
    let conn = taskgrid_sqlite::connect_sqlite(path, None)?;
    let conn = taskgrid_sqlite::Connection::from_conn(conn).await?;
    migrations::apply(&conn).await?;
    return Ok(Self { conn });
  }

  pub fn connection(&self) -> &taskgrid_sqlite::Connection {
    return &self.conn;
  }

  // --- Scripts -----------------------------------------------------------

  pub async fn get_script(&self, id: &str) -> Result<Option<Script>> {
    let script = self
      .conn
      .query_value::<Script>("SELECT * FROM scripts WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(script);
  }

  /// All script rows, for `ReloadDataMD5Cache`'s replace-all pass (§4.K).
  pub async fn list_scripts(&self) -> Result<Vec<Script>> {
    let scripts = self.conn.query_values::<Script>("SELECT * FROM scripts", ()).await?;
    return Ok(scripts);
  }

  pub async fn upsert_script(&self, id: &str, script_set_id: &str, code: &str, now: i64) -> Result<()> {
    let md5 = taskgrid_extension::md5_hex_digest(code.as_bytes());
    self
      .conn
      .execute(
        r#"INSERT INTO scripts (id, script_set_id, code, code_md5, publish_version, create_time, update_time)
           VALUES ($1, $2, $3, $4, 1, $5, $5)
           ON CONFLICT(id) DO UPDATE SET
             code = excluded.code,
             code_md5 = excluded.code_md5,
             publish_version = scripts.publish_version + 1,
             update_time = excluded.update_time"#,
        (id.to_string(), script_set_id.to_string(), code.to_string(), md5, now),
      )
      .await?;
    return Ok(());
  }

  // --- Functions -----------------------------------------------------------

  pub async fn get_function(&self, id: &str) -> Result<Option<Function>> {
    let func = self
      .conn
      .query_value::<Function>("SELECT * FROM functions WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(func);
  }

  /// Every Function row, for `AutoRun`'s `integrationConfig.onSystemLaunch`
  /// scan (§4.K) — there is no index worth paging on since every Function
  /// must be inspected regardless of `integration`.
  pub async fn list_all_functions(&self) -> Result<Vec<Function>> {
    let funcs = self.conn.query_values::<Function>("SELECT * FROM functions", ()).await?;
    return Ok(funcs);
  }

  pub async fn list_functions_by_integration(&self, integration: &str) -> Result<Vec<Function>> {
    let funcs = self
      .conn
      .query_values::<Function>(
        "SELECT * FROM functions WHERE integration = $1",
        (integration.to_string(),),
      )
      .await?;
    return Ok(funcs);
  }

  /// Functions defined by a Script, keyed by the `scriptId.` id prefix
  /// (§3: `Function.id = scriptId + "." + name`).
  pub async fn list_functions_by_script(&self, script_id: &str) -> Result<Vec<Function>> {
    let funcs = self
      .conn
      .query_values::<Function>(
        "SELECT * FROM functions WHERE id LIKE $1",
        (format!("{script_id}.%"),),
      )
      .await?;
    return Ok(funcs);
  }

  // --- Cron Jobs -----------------------------------------------------------

  pub async fn get_cron_job(&self, id: &str) -> Result<Option<CronJob>> {
    let job = self
      .conn
      .query_value::<CronJob>("SELECT * FROM cron_jobs WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(job);
  }

  /// Pages through user cron jobs ordered by `seq`, per §4.J step 4.
  pub async fn list_cron_jobs_page(&self, after_seq: i64, page_size: i64) -> Result<Vec<CronJob>> {
    let jobs = self
      .conn
      .query_values::<CronJob>(
        "SELECT * FROM cron_jobs WHERE seq > $1 ORDER BY seq ASC LIMIT $2",
        (after_seq, page_size),
      )
      .await?;
    return Ok(jobs);
  }

  pub async fn upsert_cron_job(&self, job: &CronJob) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO cron_jobs
             (id, seq, func_id, func_call_kwargs_json, cron_expr, timezone, task_record_limit,
              is_disabled, expire_time, create_time, update_time)
           VALUES ($1, COALESCE((SELECT MAX(seq) FROM cron_jobs), 0) + 1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
           ON CONFLICT(id) DO UPDATE SET
             func_id = excluded.func_id,
             func_call_kwargs_json = excluded.func_call_kwargs_json,
             cron_expr = excluded.cron_expr,
             timezone = excluded.timezone,
             task_record_limit = excluded.task_record_limit,
             is_disabled = excluded.is_disabled,
             expire_time = excluded.expire_time,
             update_time = excluded.update_time"#,
        (
          job.id.clone(),
          job.func_id.clone(),
          job.func_call_kwargs_json.clone(),
          job.cron_expr.clone(),
          job.timezone.clone(),
          job.task_record_limit,
          job.is_disabled,
          job.expire_time,
          job.create_time,
        ),
      )
      .await?;
    return Ok(());
  }

  // --- Sync / Async APIs -----------------------------------------------------------

  pub async fn get_sync_api(&self, id: &str) -> Result<Option<SyncApi>> {
    let api = self
      .conn
      .query_value::<SyncApi>("SELECT * FROM sync_apis WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(api);
  }

  pub async fn get_async_api(&self, id: &str) -> Result<Option<AsyncApi>> {
    let api = self
      .conn
      .query_value::<AsyncApi>("SELECT * FROM async_apis WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(api);
  }

  // --- Connectors -----------------------------------------------------------

  pub async fn get_connector(&self, id: &str) -> Result<Option<Connector>> {
    let connector = self
      .conn
      .query_value::<Connector>("SELECT * FROM connectors WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(connector);
  }

  /// All connector rows, for `ReloadDataMD5Cache`'s replace-all pass (§4.K).
  pub async fn list_connectors(&self) -> Result<Vec<Connector>> {
    let connectors = self.conn.query_values::<Connector>("SELECT * FROM connectors", ()).await?;
    return Ok(connectors);
  }

  // --- Env Variables -----------------------------------------------------------

  pub async fn get_env_variable(&self, id: &str) -> Result<Option<EnvVariable>> {
    let var = self
      .conn
      .query_value::<EnvVariable>("SELECT * FROM env_variables WHERE id = $1", (id.to_string(),))
      .await?;
    return Ok(var);
  }

  /// All env variable rows, for `ReloadDataMD5Cache`'s replace-all pass (§4.K).
  pub async fn list_env_variables(&self) -> Result<Vec<EnvVariable>> {
    let vars = self.conn.query_values::<EnvVariable>("SELECT * FROM env_variables", ()).await?;
    return Ok(vars);
  }

  // --- Func Store (STORE capability) -----------------------------------------------------------

  pub async fn store_get(&self, scope: &str, key: &str, now: i64) -> Result<Option<String>> {
    let entry = self
      .conn
      .query_value::<FuncStoreEntry>(
        "SELECT * FROM func_store WHERE scope = $1 AND key = $2",
        (scope.to_string(), key.to_string()),
      )
      .await?;

    return Ok(match entry {
      Some(e) if e.expire_at.is_none_or(|exp| exp > now) => Some(e.value_json),
      _ => None,
    });
  }

  pub async fn store_set(
    &self,
    scope: &str,
    key: &str,
    value_json: &str,
    expire_at: Option<i64>,
    now: i64,
  ) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO func_store (scope, key, value_json, expire_at, update_time)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT(scope, key) DO UPDATE SET
             value_json = excluded.value_json,
             expire_at = excluded.expire_at,
             update_time = excluded.update_time"#,
        (
          scope.to_string(),
          key.to_string(),
          value_json.to_string(),
          expire_at,
          now,
        ),
      )
      .await?;
    return Ok(());
  }

  pub async fn store_delete_expired(&self, now: i64) -> Result<usize> {
    let deleted = self
      .conn
      .execute("DELETE FROM func_store WHERE expire_at IS NOT NULL AND expire_at <= $1", (now,))
      .await?;
    return Ok(deleted);
  }

  // --- Task Records -----------------------------------------------------------

  pub async fn insert_task_record(&self, record: &TaskRecord) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO task_records
             (id, origin_id, name, trigger_time, start_time, end_time, status, result_json, exception, traceback)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        (
          record.id.clone(),
          record.origin_id.clone(),
          record.name.clone(),
          record.trigger_time,
          record.start_time,
          record.end_time,
          record.status.clone(),
          record.result_json.clone(),
          record.exception.clone(),
          record.traceback.clone(),
        ),
      )
      .await?;
    return Ok(());
  }

  pub async fn insert_task_record_func(&self, record: &TaskRecordFunc) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO task_record_funcs (task_id, func_id, cost_ms, status, create_time)
           VALUES ($1, $2, $3, $4, $5)"#,
        (
          record.task_id.clone(),
          record.func_id.clone(),
          record.cost_ms,
          record.status.clone(),
          record.create_time,
        ),
      )
      .await?;
    return Ok(());
  }

  pub async fn roll_task_records_by_limit(&self, limit: i64) -> Result<usize> {
    return rolling::roll_by_limit(&self.conn, "task_records", limit).await;
  }

  pub async fn roll_task_records_by_expires(&self, now: i64, max_age_secs: i64) -> Result<usize> {
    return rolling::roll_by_expires(&self.conn, "task_records", "trigger_time", now, max_age_secs).await;
  }

  pub async fn roll_task_record_funcs_by_limit(&self, limit: i64) -> Result<usize> {
    return rolling::roll_by_limit(&self.conn, "task_record_funcs", limit).await;
  }

  /// Task-record-func rows strictly after `after_seq`, for
  /// `FlushDataBuffer`'s incremental aggregation pass (§4.K).
  pub async fn list_task_record_funcs_after(&self, after_seq: i64, limit: i64) -> Result<Vec<TaskRecordFunc>> {
    let rows = self
      .conn
      .query_values::<TaskRecordFunc>(
        "SELECT * FROM task_record_funcs WHERE seq > $1 ORDER BY seq ASC LIMIT $2",
        (after_seq, limit),
      )
      .await?;
    return Ok(rows);
  }

  // --- Function Call Counts -----------------------------------------------------------

  pub async fn increment_function_call_count(&self, func_id: &str, minute_ts: i64, delta: i64) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO function_call_counts (func_id, minute_ts, count)
           VALUES ($1, $2, $3)
           ON CONFLICT(func_id, minute_ts) DO UPDATE SET count = count + excluded.count"#,
        (func_id.to_string(), minute_ts, delta),
      )
      .await?;
    return Ok(());
  }

  pub async fn function_call_counts_since(&self, since_minute_ts: i64) -> Result<Vec<FunctionCallCount>> {
    let rows = self
      .conn
      .query_values::<FunctionCallCount>(
        "SELECT func_id, minute_ts, count FROM function_call_counts WHERE minute_ts >= $1 ORDER BY minute_ts ASC",
        (since_minute_ts,),
      )
      .await?;
    return Ok(rows);
  }

  /// Rows in `task_records` whose `origin_id` no longer matches a live Cron
  /// Job, Sync API, Async API, or Function, i.e. the entity that triggered
  /// them was since deleted. Directly-triggered runs (`origin_id == id`)
  /// are never orphaned, per `AutoClean` (§4.K).
  pub async fn delete_orphaned_task_records(&self) -> Result<usize> {
    let deleted = self
      .conn
      .execute(
        r#"DELETE FROM task_records
           WHERE origin_id != id
             AND origin_id NOT IN (SELECT id FROM cron_jobs)
             AND origin_id NOT IN (SELECT id FROM sync_apis)
             AND origin_id NOT IN (SELECT id FROM async_apis)
             AND origin_id NOT IN (SELECT id FROM functions)"#,
        (),
      )
      .await?;
    return Ok(deleted);
  }

  /// Row counts for every table `SystemMetric` reports entity counts for
  /// (§4.K), plus overall metadata-store size for the byte-size figure.
  pub async fn table_row_counts(&self) -> Result<Vec<(String, i64)>> {
    const TABLES: &[&str] = &[
      "scripts",
      "functions",
      "cron_jobs",
      "sync_apis",
      "async_apis",
      "connectors",
      "env_variables",
      "func_store",
      "task_records",
      "task_record_funcs",
      "md5_index",
    ];

    let mut counts = Vec::with_capacity(TABLES.len());
    for table in TABLES {
      let count: i64 = self
        .conn
        .query_value::<i64>(&format!("SELECT COUNT(*) FROM {table}"), ())
        .await?
        .unwrap_or(0);
      counts.push((table.to_string(), count));
    }
    return Ok(counts);
  }

  /// Approximate on-disk size of the metadata store, in bytes.
  pub async fn db_size_bytes(&self) -> Result<i64> {
    let page_count = self.conn.query_value::<i64>("PRAGMA page_count", ()).await?.unwrap_or(0);
    let page_size = self.conn.query_value::<i64>("PRAGMA page_size", ()).await?.unwrap_or(0);
    return Ok(page_count * page_size);
  }

  // --- MD5 Index -----------------------------------------------------------

  pub async fn set_md5_index(&self, data_type: &str, entity_id: &str, md5: &str, now: i64) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO md5_index (data_type, entity_id, md5, update_time)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT(data_type, entity_id) DO UPDATE SET
             md5 = excluded.md5,
             update_time = excluded.update_time"#,
        (data_type.to_string(), entity_id.to_string(), md5.to_string(), now),
      )
      .await?;
    return Ok(());
  }

  pub async fn get_md5_index(&self, data_type: &str, entity_id: &str) -> Result<Option<Md5IndexEntry>> {
    let entry = self
      .conn
      .query_value::<Md5IndexEntry>(
        "SELECT * FROM md5_index WHERE data_type = $1 AND entity_id = $2",
        (data_type.to_string(), entity_id.to_string()),
      )
      .await?;
    return Ok(entry);
  }

  pub async fn list_md5_index(&self, data_type: &str) -> Result<Vec<Md5IndexEntry>> {
    let entries = self
      .conn
      .query_values::<Md5IndexEntry>(
        "SELECT * FROM md5_index WHERE data_type = $1",
        (data_type.to_string(),),
      )
      .await?;
    return Ok(entries);
  }

  // --- System Settings (admin-tool's `reset_admin`/`reset_upgrade_db_seq`) -----------------------------------------------------------

  pub async fn get_system_setting(&self, key: &str) -> Result<Option<String>> {
    let value = self
      .conn
      .query_value::<String>("SELECT value_json FROM system_settings WHERE key = $1", (key.to_string(),))
      .await?;
    return Ok(value);
  }

  pub async fn set_system_setting(&self, key: &str, value_json: &str, now: i64) -> Result<()> {
    self
      .conn
      .execute(
        r#"INSERT INTO system_settings (key, value_json, update_time)
           VALUES ($1, $2, $3)
           ON CONFLICT(key) DO UPDATE SET
             value_json = excluded.value_json,
             update_time = excluded.update_time"#,
        (key.to_string(), value_json.to_string(), now),
      )
      .await?;
    return Ok(());
  }

  /// Backs up the metadata store to `dest_path` using SQLite's online backup
  /// API, for the `AutoBackupDB` internal task (§4.K).
  pub async fn backup_to(&self, dest_path: std::path::PathBuf) -> Result<()> {
    self
      .conn
      .call(move |conn: &mut rusqlite::Connection| -> taskgrid_sqlite::Result<()> {
        let dest = rusqlite::Connection::open(&dest_path)?;
        let backup = rusqlite::backup::Backup::new(conn, &dest)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(0), None)?;
        Ok(())
      })
      .await
      .map_err(MetadataError::from)?;
    return Ok(());
  }
}
