pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;
