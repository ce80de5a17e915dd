use concepts::storage::DbPool;
use db_mem::inmemory_dao::InMemoryPool;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub mod faulty;
pub mod fixtures;

#[derive(Clone, Copy, Debug)]
pub enum Database {
    Memory,
    Sqlite,
}

/// Keeps the backing file of a sqlite pool alive for the duration of a test.
pub enum DbGuard {
    Memory,
    Sqlite(Option<NamedTempFile>),
}

impl Database {
    pub async fn set_up(self) -> (DbGuard, Arc<dyn DbPool>) {
        match self {
            Database::Memory => (DbGuard::Memory, Arc::new(InMemoryPool::new())),
            Database::Sqlite => {
                use db_sqlite::sqlite_dao::tempfile::sqlite_pool;
                let (db_pool, guard) = sqlite_pool().await;
                (DbGuard::Sqlite(guard), Arc::new(db_pool))
            }
        }
    }
}
