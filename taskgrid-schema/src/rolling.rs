//! SEQ-based table rolling for append-only history tables (§4.D).

use crate::error::Result;

/// Deletes all rows in `table` with `seq <= max(seq) - limit`, keeping the most
/// recent `limit` rows. `table` must be one of this crate's append-only
/// tables (never user-provided) since it is interpolated into the query.
pub async fn roll_by_limit(
  conn: &taskgrid_sqlite::Connection,
  table: &'static str,
  limit: i64,
) -> Result<usize> {
  let sql = format!(
    "DELETE FROM {table} WHERE seq <= (SELECT MAX(seq) FROM {table}) - $1",
  );
  let deleted = conn.execute(&sql, (limit,)).await?;
  return Ok(deleted);
}

/// Deletes rows older than `max_age_secs`, using a binary search over `seq`
/// to find the newest row past the age cutoff instead of scanning every row's
/// timestamp. `time_col` names the row's creation-time column.
pub async fn roll_by_expires(
  conn: &taskgrid_sqlite::Connection,
  table: &'static str,
  time_col: &'static str,
  now: i64,
  max_age_secs: i64,
) -> Result<usize> {
  let cutoff = now - max_age_secs;

  let Some((min_seq, max_seq)) = seq_bounds(conn, table).await? else {
    return Ok(0);
  };

  // Binary search for the largest seq whose time_col <= cutoff; everything at
  // or below it is expired. Falls back to zero matches when nothing qualifies.
  let mut lo = min_seq;
  let mut hi = max_seq;
  let mut boundary: Option<i64> = None;

  while lo <= hi {
    let mid = lo + (hi - lo) / 2;
    let sql = format!("SELECT {time_col} FROM {table} WHERE seq = $1");
    let Some(ts) = conn.query_value::<i64>(&sql, (mid,)).await? else {
      // Gap in seq (prior deletes); narrow the window toward the midpoint's
      // neighbourhood using the closest existing row below mid.
      hi = mid - 1;
      continue;
    };

    if ts <= cutoff {
      boundary = Some(mid);
      lo = mid + 1;
    } else {
      hi = mid - 1;
    }
  }

  let Some(boundary) = boundary else {
    return Ok(0);
  };

  let sql = format!("DELETE FROM {table} WHERE seq <= $1");
  let deleted = conn.execute(&sql, (boundary,)).await?;
  return Ok(deleted);
}

async fn seq_bounds(
  conn: &taskgrid_sqlite::Connection,
  table: &'static str,
) -> Result<Option<(i64, i64)>> {
  let sql = format!("SELECT MIN(seq), MAX(seq) FROM {table}");
  let row = conn.query_row(&sql, ()).await?;
  let Some(row) = row else {
    return Ok(None);
  };

  let min: Option<i64> = row.get(0).ok();
  let max: Option<i64> = row.get(1).ok();

  return Ok(match (min, max) {
    (Some(min), Some(max)) => Some((min, max)),
    _ => None,
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn setup() -> taskgrid_sqlite::Connection {
    let conn = taskgrid_sqlite::connect_sqlite(None, None).unwrap();
    let conn = taskgrid_sqlite::Connection::from_conn(conn).await.unwrap();
    conn
      .execute_batch(
        "CREATE TABLE task_records (seq INTEGER PRIMARY KEY AUTOINCREMENT, trigger_time INTEGER NOT NULL);",
      )
      .await
      .unwrap();
    return conn;
  }

  #[tokio::test]
  async fn test_roll_by_limit() {
    let conn = setup().await;
    for t in 0..10 {
      conn
        .execute("INSERT INTO task_records (trigger_time) VALUES ($1)", (t as i64,))
        .await
        .unwrap();
    }

    let deleted = roll_by_limit(&conn, "task_records", 3).await.unwrap();
    assert_eq!(deleted, 7);

    let remaining = conn
      .query_values::<i64>("SELECT seq FROM task_records", ())
      .await
      .unwrap();
    assert_eq!(remaining, vec![8, 9, 10]);
  }

  #[tokio::test]
  async fn test_roll_by_expires() {
    let conn = setup().await;
    for t in 0..10 {
      conn
        .execute("INSERT INTO task_records (trigger_time) VALUES ($1)", (t as i64,))
        .await
        .unwrap();
    }

    // now=10, max_age=5 => cutoff=5; rows with trigger_time <= 5 (t=0..5, seq 1..6) expire.
    let deleted = roll_by_expires(&conn, "task_records", "trigger_time", 10, 5)
      .await
      .unwrap();
    assert_eq!(deleted, 6);
  }
}
