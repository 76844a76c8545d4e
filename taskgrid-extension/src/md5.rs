use md5::{Digest, Md5};
use rusqlite::functions::Context;

/// `md5_hex(content)` — used to populate the MD5 index over script/function
/// bodies so identical content can be deduplicated without a full scan.
pub(super) fn md5_hex(ctx: &Context) -> rusqlite::Result<String> {
  if ctx.len() != 1 {
    return Err(rusqlite::Error::InvalidParameterCount(ctx.len(), 1));
  }

  let value = ctx.get_raw(0).as_bytes().unwrap_or(&[]);
  let mut hasher = Md5::new();
  hasher.update(value);
  return Ok(format!("{:x}", hasher.finalize()));
}

pub fn hex_digest(content: &[u8]) -> String {
  let mut hasher = Md5::new();
  hasher.update(content);
  return format!("{:x}", hasher.finalize());
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_md5_hex_function() {
    let conn = crate::connect().unwrap();
    let digest: String = conn
      .query_row("SELECT md5_hex('hello')", (), |row| row.get(0))
      .unwrap();
    assert_eq!(digest, hex_digest(b"hello"));
  }
}
