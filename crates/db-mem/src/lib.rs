pub mod inmemory_dao;

pub use inmemory_dao::{InMemoryDbConnection, InMemoryPool};
