//! SQLite state backend, used for local development and tests.
//!
//! rusqlite is blocking, so every call hops onto the blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{StateBackend, StoreError};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "tailscale_data" (
    "id"    INTEGER PRIMARY KEY AUTOINCREMENT,
    "state" TEXT NOT NULL
);
"#;

/// [`StateBackend`] over a single SQLite connection.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute_batch(CREATE_TABLE)).await
    }

    async fn latest(&self) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                r#"SELECT "state" FROM "tailscale_data" ORDER BY "id" DESC LIMIT 1"#,
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
    }

    async fn insert(&self, state: &str) -> Result<i64, StoreError> {
        let state = state.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"INSERT INTO "tailscale_data" ("state") VALUES (?1)"#,
                params![state],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn prune(&self, keep: usize) -> Result<u64, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            conn.execute(
                r#"DELETE FROM "tailscale_data" WHERE "id" NOT IN (
                       SELECT "id" FROM "tailscale_data" ORDER BY "id" DESC LIMIT ?1
                   )"#,
                params![keep],
            )
        })
        .await
        .map(|n| n as u64)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(r#"SELECT COUNT(*) FROM "tailscale_data""#, [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .await
        .map(|n| n.max(0) as u64)
    }
}
