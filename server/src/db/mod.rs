pub mod kv;
pub mod migrations;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use kv::{AtomicOp, Commit, Entry, KvStore, KvStoreExt, ListOptions, SqliteKv, StoreError};

/// Type alias for the shared database connection.
/// rusqlite is synchronous, so it is wrapped in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, StoreError> {
    std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io(e.to_string()))?;

    let db_path = Path::new(data_dir).join("pairchat.db");
    let mut conn = Connection::open(&db_path)?;

    // WAL keeps history reads from blocking behind friend-graph commits
    conn.pragma_update(None, "journal_mode", "WAL")?;

    migrations::migrations()
        .to_latest(&mut conn)
        .map_err(|e| StoreError::Migration(e.to_string()))?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// Open a private in-memory database with the full schema applied.
pub fn init_memory_db() -> Result<DbPool, StoreError> {
    let mut conn = Connection::open_in_memory()?;
    migrations::migrations()
        .to_latest(&mut conn)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    Ok(Arc::new(Mutex::new(conn)))
}
