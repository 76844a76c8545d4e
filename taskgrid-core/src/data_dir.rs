use std::path::PathBuf;
use tokio::{fs, io::AsyncWriteExt};
use tracing::*;

/// The base data directory where the metadata-store database, config, and
/// secrets live.
#[derive(Debug, Clone)]
pub struct DataDir(pub PathBuf);

impl Default for DataDir {
  fn default() -> Self {
    Self(format!("./{}/", Self::DEFAULT).into())
  }
}

impl DataDir {
  pub const DEFAULT: &str = "taskgriddepot";

  pub fn root(&self) -> &PathBuf {
    return &self.0;
  }

  pub fn main_db_path(&self) -> PathBuf {
    return self.data_path().join("main.db");
  }

  pub fn data_path(&self) -> PathBuf {
    return self.0.join("data/");
  }

  pub fn config_path(&self) -> PathBuf {
    return self.0.join("config.toml");
  }

  pub fn secrets_path(&self) -> PathBuf {
    return self.0.join("secrets/");
  }

  pub fn backup_path(&self) -> PathBuf {
    return self.0.join("backups/");
  }

  pub fn key_path(&self) -> PathBuf {
    return self.secrets_path().join("cipher.key");
  }

  /// Scratch files named `<unix_ts>-<...>`; swept by `AutoClean` once their
  /// timestamp prefix has passed (§4.K).
  pub fn temp_path(&self) -> PathBuf {
    return self.0.join("tmp/");
  }

  fn directories(&self) -> Vec<PathBuf> {
    return vec![self.data_path(), self.backup_path(), self.secrets_path(), self.temp_path()];
  }

  pub async fn ensure_directory_structure(&self) -> std::io::Result<()> {
    let root = self.root();
    if !fs::try_exists(root).await.unwrap_or(false) {
      fs::create_dir_all(root).await?;

      let mut gitignore = fs::File::create_new(root.join(".gitignore")).await?;
      gitignore.write_all(GIT_IGNORE.as_bytes()).await?;

      info!("Initialized fresh data dir: {:?}", root);
    }

    for dir in self.directories() {
      if !fs::try_exists(&dir).await.unwrap_or(false) {
        fs::create_dir_all(dir).await?;
      }
    }

    Ok(())
  }
}

const GIT_IGNORE: &str = r#"
backups/
data/
secrets/
"#;
