use serde::Deserialize;

use crate::connection::Connection;
use crate::{named_params, params};

#[tokio::test]
async fn open_in_memory_test() {
  let conn = Connection::open_in_memory().await.unwrap();
  assert!(conn.close().await.is_ok());
}

#[tokio::test]
async fn call_success_test() {
  let conn = Connection::open_in_memory().await.unwrap();

  let result = conn
    .call(|conn| {
      conn
        .execute(
          "CREATE TABLE person(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);",
          [],
        )
        .map_err(|e| e.into())
    })
    .await;

  assert_eq!(0, result.unwrap());
}

#[tokio::test]
async fn call_failure_test() {
  let conn = Connection::open_in_memory().await.unwrap();

  let result = conn
    .call(|conn| conn.execute("Invalid sql", []).map_err(|e| e.into()))
    .await;

  assert!(result.is_err());
}

#[tokio::test]
async fn query_row_and_value_test() {
  #[derive(Debug, Deserialize, PartialEq)]
  struct Person {
    id: i64,
    name: String,
  }

  let conn = Connection::open_in_memory().await.unwrap();
  conn
    .execute(
      "CREATE TABLE person(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);",
      params!(),
    )
    .await
    .unwrap();

  conn
    .execute(
      "INSERT INTO person (name) VALUES (:name)",
      named_params!(":name": "alice".to_string()),
    )
    .await
    .unwrap();

  let person = conn
    .query_value::<Person>("SELECT * FROM person WHERE name = $1", ("alice".to_string(),))
    .await
    .unwrap()
    .unwrap();

  assert_eq!(person.name, "alice");

  let people = conn
    .query_values::<Person>("SELECT * FROM person", params!())
    .await
    .unwrap();
  assert_eq!(people.len(), 1);
}

#[tokio::test]
async fn close_test() {
  let conn = Connection::open_in_memory().await.unwrap();
  let conn2 = conn.clone();

  assert!(conn.close().await.is_ok());
  // Closing a clone after the underlying connection already closed is a no-op.
  assert!(conn2.close().await.is_ok());
}
