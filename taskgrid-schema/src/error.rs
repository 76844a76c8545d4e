#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
  #[error("sqlite: {0}")]
  Sqlite(#[from] taskgrid_sqlite::Error),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("duplicate: {0}")]
  Duplicate(String),

  #[error("serde_json: {0}")]
  Json(#[from] serde_json::Error),

  #[error("cipher: {0}")]
  Cipher(#[from] taskgrid_extension::CipherError),
}

pub type Result<T> = std::result::Result<T, MetadataError>;
