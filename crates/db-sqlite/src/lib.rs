pub mod sqlite_dao;

pub use sqlite_dao::{InitializationError, SqliteConfig, SqlitePool};
