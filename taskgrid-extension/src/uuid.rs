use rusqlite::functions::Context;
use rusqlite::Error;
use uuid::Uuid;

fn unpack_uuid_or_null(ctx: &Context) -> rusqlite::Result<Option<Uuid>> {
  if ctx.len() != 1 {
    return Err(Error::InvalidParameterCount(ctx.len(), 1));
  }

  return match ctx.get_raw(0) {
    rusqlite::types::ValueRef::Null => Ok(None),
    rusqlite::types::ValueRef::Blob(b) => Uuid::from_slice(b)
      .map(Some)
      .map_err(|err| Error::UserFunctionError(format!("Failed to read uuid: {err}").into())),
    rusqlite::types::ValueRef::Text(t) => std::str::from_utf8(t)
      .map_err(|err| Error::UserFunctionError(format!("invalid utf8: {err}").into()))
      .and_then(|s| {
        Uuid::parse_str(s)
          .map(Some)
          .map_err(|err| Error::UserFunctionError(format!("UUID parse: {err}").into()))
      }),
    _ => Err(Error::UserFunctionError(
      "Expected BLOB or TEXT column type.".into(),
    )),
  };
}

pub(super) fn is_uuid(ctx: &Context) -> rusqlite::Result<bool> {
  return Ok(match unpack_uuid_or_null(ctx) {
    Ok(_) => true,
    Err(_) => false,
  });
}

pub(super) fn is_uuid_v7(ctx: &Context) -> rusqlite::Result<bool> {
  return Ok(match unpack_uuid_or_null(ctx) {
    Ok(Some(uuid)) => uuid.get_version_num() == 7,
    Ok(None) => true,
    Err(_) => false,
  });
}

pub(super) fn uuid_v7_text(_ctx: &Context) -> rusqlite::Result<String> {
  return Ok(Uuid::now_v7().to_string());
}

pub(super) fn uuid_v7(_ctx: &Context) -> rusqlite::Result<Vec<u8>> {
  return Ok(Uuid::now_v7().as_bytes().to_vec());
}

pub(super) fn parse_uuid(ctx: &Context) -> rusqlite::Result<Vec<u8>> {
  if ctx.len() != 1 {
    return Err(Error::InvalidParameterCount(ctx.len(), 1));
  }

  let value = ctx.get::<String>(0)?;
  let id = Uuid::parse_str(&value)
    .map_err(|err| Error::UserFunctionError(format!("UUID parse: {err}").into()))?;

  return Ok(id.as_bytes().to_vec());
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  #[test]
  fn test_uuid() {
    let conn = crate::connect().unwrap();

    let create_table = r#"
        CREATE TABLE test (
          id                           BLOB PRIMARY KEY NOT NULL DEFAULT (uuid_v7()),
          uuid                         BLOB CHECK(is_uuid(uuid)),
          uuid_v7                      BLOB CHECK(is_uuid_v7(uuid_v7))
        ) STRICT;
      "#;
    conn.execute(create_table, ()).unwrap();

    {
      let id: Vec<u8> = conn
        .query_row(
          "INSERT INTO test (uuid, uuid_v7) VALUES (NULL, NULL) RETURNING id",
          (),
          |row| row.get(0),
        )
        .unwrap();

      Uuid::from_slice(&id).unwrap();
    }

    {
      assert!(conn
        .execute(
          "INSERT INTO test (uuid, uuid_v7) VALUES ($1, NULL)",
          (b"".to_vec(),)
        )
        .is_err());
    }

    {
      let uuid = Uuid::now_v7();
      let value: Vec<u8> = conn
        .query_row(
          "INSERT INTO test (uuid, uuid_v7) VALUES (parse_uuid($1), parse_uuid($1)) RETURNING uuid",
          (uuid.to_string(),),
          |row| row.get(0),
        )
        .unwrap();

      assert_eq!(Uuid::from_slice(&value).unwrap(), uuid);
    }
  }
}
