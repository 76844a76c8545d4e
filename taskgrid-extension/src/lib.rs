#![allow(clippy::needless_return)]

use rusqlite::functions::FunctionFlags;

mod cipher;
mod md5;
mod uuid;

pub use cipher::{decrypt, encrypt, generate_random_key, CipherError, CipherKey};
pub use md5::hex_digest as md5_hex_digest;

/// Registers the application-defined SQLite functions used throughout the
/// metadata store: uuid generation/validation for primary keys and an md5
/// digest used by the MD5 content index.
///
/// WARN: Be careful with declaring INNOCUOUS. This allows these functions to
/// run even when `trusted_schema=OFF`, i.e. as part of VIEWs, TRIGGERs,
/// CHECK, DEFAULT, GENERATED cols, ... as opposed to just top-level SELECTs.
pub fn sqlite3_extension_init(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
  conn.create_scalar_function(
    "is_uuid",
    1,
    FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS,
    uuid::is_uuid,
  )?;
  conn.create_scalar_function(
    "is_uuid_v7",
    1,
    FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS,
    uuid::is_uuid_v7,
  )?;
  conn.create_scalar_function(
    "uuid_v7_text",
    0,
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS,
    uuid::uuid_v7_text,
  )?;
  conn.create_scalar_function("uuid_v7", 0, FunctionFlags::SQLITE_INNOCUOUS, uuid::uuid_v7)?;
  conn.create_scalar_function(
    "parse_uuid",
    1,
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS,
    uuid::parse_uuid,
  )?;

  conn.create_scalar_function(
    "md5_hex",
    1,
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS,
    md5::md5_hex,
  )?;

  return Ok(());
}

#[cfg(test)]
pub(crate) fn connect() -> Result<rusqlite::Connection, rusqlite::Error> {
  let conn = rusqlite::Connection::open_in_memory()?;
  sqlite3_extension_init(&conn)?;
  return Ok(conn);
}
