pub mod migrations;
pub mod models;
pub mod store;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use store::{
    MessageStore, PresenceStore, RosterStore, SessionStore, SqliteStore, Stores, UserStore,
};

/// Type alias for the shared database connection.
/// rusqlite is synchronous; we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Errors raised by the persistence collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("forum.db");
    let mut conn = Connection::open(&db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// Run a store call on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
}

/// Fresh in-memory database with the full schema, for tests.
#[cfg(test)]
pub(crate) fn open_in_memory() -> DbPool {
    let mut conn = Connection::open_in_memory().expect("open in-memory sqlite");
    conn.pragma_update(None, "foreign_keys", "ON")
        .expect("enable foreign keys");
    migrations::migrations()
        .to_latest(&mut conn)
        .expect("run migrations");
    Arc::new(Mutex::new(conn))
}

/// Insert a user row with a fixed id, for tests.
#[cfg(test)]
pub(crate) fn seed_user(db: &DbPool, id: i64, username: &str) {
    let conn = db.lock().expect("db lock");
    conn.execute(
        "INSERT INTO users (id, email, username, password_hash, created_at)
         VALUES (?1, ?2, ?3, 'x', ?4)",
        rusqlite::params![
            id,
            format!("{username}@example.com"),
            username,
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .expect("seed user");
}
