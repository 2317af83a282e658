pub mod manager;
pub mod mapping;
pub mod memory;
pub mod sqlite;

pub use manager::{DatabaseManager, RepositorySet};
pub use memory::InMemoryStore;
pub use sqlite::{
    SqliteAnalystRepository, SqliteDatabase, SqliteJobRepository, SqliteTaskErrorRepository,
    SqliteTaskRepository,
};
