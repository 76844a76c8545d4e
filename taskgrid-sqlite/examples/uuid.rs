/// A minimal binary demonstrating that the SQLite extensions registered by
/// `taskgrid-sqlite` (e.g. `uuid_v7`) work against a plain `rusqlite`
/// connection, independent of the rest of the platform.
use taskgrid_sqlite::connect_sqlite;

fn main() {
  let conn = connect_sqlite(None, None).unwrap();

  let mut stmt = conn.prepare("SELECT (uuid_text(uuid_v7()))").unwrap();

  let uuid: String = stmt.query_row((), |row| row.get(0)).unwrap();

  println!("Done! {uuid:?}");
}
