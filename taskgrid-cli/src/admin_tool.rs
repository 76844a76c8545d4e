//! `admin-tool` (§6): out-of-band maintenance commands run by an operator
//! against a live data directory, never by the Beat/Worker processes
//! themselves. Grounded on the platform's own pre-distillation admin script,
//! which exposed exactly these four commands (`reset_admin`,
//! `reset_upgrade_db_seq`, `clear_redis`, `run_sql`) behind an interactive
//! confirmation prompt and a `-f/--force` bypass.
//!
//! The user/authentication subsystem itself is out of scope for this crate
//! (§1 Non-goals), so `reset-admin` has no admin-user table to write into;
//! it instead resets the one administrative credential record this platform
//! keeps of its own — `system_settings['admin_credential']` — which an
//! out-of-scope external HTTP surface would consult (documented as an Open
//! Question decision in DESIGN.md).

use std::io::Write as _;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHasher};
use serde_json::json;
use taskgrid_core::AppState;

const ADMIN_CREDENTIAL_KEY: &str = "admin_credential";
const DB_UPGRADE_SEQ_KEY: &str = "db_upgrade_seq";

#[derive(Debug, thiserror::Error)]
pub enum AdminToolError {
  #[error("canceled")]
  Canceled,

  #[error("{0}")]
  BadInput(String),

  #[error("metadata: {0}")]
  Metadata(#[from] taskgrid_schema::MetadataError),

  #[error("queue: {0}")]
  Queue(#[from] taskgrid_queue::QueueError),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("http: {0}")]
  Http(#[from] reqwest::Error),

  #[error("password hashing failed: {0}")]
  Hash(String),
}

pub type Result<T> = std::result::Result<T, AdminToolError>;

/// Prompts `Are you sure you want to do this? (yes/no): ` unless `force`.
fn confirm(force: bool) -> Result<()> {
  if force {
    return Ok(());
  }

  print!("Are you sure you want to do this? (yes/no): ");
  std::io::stdout().flush()?;

  let mut input = String::new();
  std::io::stdin().read_line(&mut input)?;
  if input.trim() != "yes" {
    return Err(AdminToolError::Canceled);
  }
  return Ok(());
}

fn prompt(label: &str) -> Result<String> {
  print!("{label}");
  std::io::stdout().flush()?;
  let mut input = String::new();
  std::io::stdin().read_line(&mut input)?;
  return Ok(input.trim().to_string());
}

fn hash_password(password: &str) -> Result<String> {
  let salt = SaltString::generate(&mut OsRng);
  return Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map(|h| h.to_string())
    .map_err(|e| AdminToolError::Hash(e.to_string()));
}

fn now_unix() -> i64 {
  return std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as i64;
}

/// Resets the administrative credential record, prompting interactively for
/// any of username/password not already supplied on the command line.
pub async fn reset_admin(state: &AppState, force: bool, username: Option<String>, password: Option<String>) -> Result<()> {
  let username = match username {
    Some(u) => u,
    None => prompt("Enter new Admin username: ")?,
  };

  let (password, password_repeat) = match password {
    Some(p) => (p.clone(), p),
    None => {
      let p = rpassword::prompt_password(format!("Enter new password for [{username}]: "))?;
      let p_repeat = rpassword::prompt_password("Confirm new password: ")?;
      (p, p_repeat)
    }
  };

  if password != password_repeat {
    return Err(AdminToolError::BadInput("repeated password does not match".to_string()));
  }
  if username.is_empty() || password.is_empty() {
    return Err(AdminToolError::BadInput("username or password not supplied".to_string()));
  }

  confirm(force)?;

  let password_hash = hash_password(&password)?;
  let value = json!({
    "username": username,
    "passwordHash": password_hash,
  });
  state
    .metadata()
    .set_system_setting(ADMIN_CREDENTIAL_KEY, &value.to_string(), now_unix())
    .await?;

  return Ok(());
}

/// Resets the metadata-store upgrade sequence marker, prompting
/// interactively when `value` isn't already supplied.
pub async fn reset_upgrade_db_seq(state: &AppState, force: bool, value: Option<String>) -> Result<()> {
  let value = match value {
    Some(v) => v,
    None => prompt("Enter new DB upgrade SEQ: ")?,
  };

  confirm(force)?;

  state
    .metadata()
    .set_system_setting(DB_UPGRADE_SEQ_KEY, &json!(value).to_string(), now_unix())
    .await?;

  return Ok(());
}

/// Flushes the entire shared Redis store.
pub async fn clear_redis(state: &AppState, force: bool) -> Result<()> {
  confirm(force)?;
  state.queue().store().flush_all().await?;
  return Ok(());
}

/// Runs a raw SQL statement against the metadata store, sourced from a local
/// file, an `http(s)://` URL, or a literal statement typed at the prompt.
pub async fn run_sql(state: &AppState, source: Option<String>) -> Result<()> {
  let source = match source {
    Some(s) => s,
    None => prompt("Enter SQL file path, URL or SQL statement: ")?,
  };

  let sql = if source.starts_with("http://") || source.starts_with("https://") {
    println!("Run SQL from URL");
    reqwest::get(source.as_str()).await?.error_for_status()?.text().await?
  } else if let Ok(contents) = tokio::fs::read_to_string(&source).await {
    println!("Run SQL from local file");
    contents
  } else {
    println!("Run SQL from user input");
    source
  };

  let result = state.metadata().connection().execute_batch(&sql).await.map_err(|e| AdminToolError::Metadata(e.into()))?;
  println!("SQL result: {result:#?}");

  return Ok(());
}

#[cfg(test)]
mod tests {
  use super::*;
  use argon2::{Argon2, PasswordHash, PasswordVerifier};
  use taskgrid_core::config::Config;
  use taskgrid_core::DataDir;

  /// Same recipe as `taskgrid_core::app_state::test_state`: a real but
  /// disposable SQLite file plus whatever Redis `TASKGRID_TEST_REDIS_URL`
  /// points at. Not exported by `taskgrid-core` (it's `pub(crate)` there),
  /// so duplicated here for this crate's own integration tests.
  async fn test_state() -> AppState {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = DataDir(dir.path().to_path_buf());
    let mut config = Config::default();
    if let Ok(url) = std::env::var("TASKGRID_TEST_REDIS_URL") {
      config.redis.url = url;
    }
    let state = AppState::build(config, data_dir).await.unwrap();
    std::mem::forget(dir);
    return state;
  }

  #[test]
  fn test_hash_password_roundtrips_through_argon2() {
    let hash = hash_password("correct horse battery staple").unwrap();
    let parsed = PasswordHash::new(&hash).unwrap();
    assert!(Argon2::default().verify_password(b"correct horse battery staple", &parsed).is_ok());
    assert!(Argon2::default().verify_password(b"wrong password", &parsed).is_err());
  }

  // Requires a live Redis (AppState::build always connects one, even though
  // this command never touches it) and the in-process SQLite metadata store.
  #[tokio::test]
  #[ignore]
  async fn test_reset_upgrade_db_seq_persists_value() {
    let state = test_state().await;
    reset_upgrade_db_seq(&state, true, Some("42".to_string())).await.unwrap();

    let stored = state.metadata().get_system_setting(DB_UPGRADE_SEQ_KEY).await.unwrap();
    assert_eq!(stored, Some(json!("42").to_string()));
  }

  #[tokio::test]
  #[ignore]
  async fn test_reset_admin_rejects_empty_username() {
    let state = test_state().await;
    let err = reset_admin(&state, true, Some(String::new()), Some("pw".to_string())).await.unwrap_err();
    assert!(matches!(err, AdminToolError::BadInput(_)));
  }
}
