#![allow(clippy::needless_return)]

mod connection;
mod error;
mod extension;
mod params;
mod rows;

pub use connection::Connection;
pub use error::Error;
pub use extension::connect_sqlite;
pub use params::{Params, ToSqlType};
pub use rows::{Row, Rows};

pub type Result<T> = std::result::Result<T, Error>;
