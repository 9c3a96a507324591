//! # State Store
//!
//! Restart-safe persistence for the overlay daemon's state file.
//!
//! The platform wipes local disk on every restart. To avoid registering a
//! brand-new node each time, the daemon's state file is copied into a
//! relational table after every join and replayed from there at startup.
//!
//! ## Table Layout
//!
//! ```text
//! tailscale_data
//! ├── id     serial / autoincrement primary key   (insertion order)
//! └── state  text not null                        (verbatim state file)
//! ```
//!
//! "Current" state is the row with the highest `id`. Older rows are history
//! and are pruned down to the configured retention after each append.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 StateStore                  │
//! │  baseline: last value loaded/appended       │
//! │  retention: rows kept after each append     │
//! └──────────────────────┬──────────────────────┘
//!                        │ dyn StateBackend
//!           ┌────────────┴────────────┐
//!           ▼                         ▼
//!   PostgresBackend             SqliteBackend
//!   (postgres:// URLs)          (sqlite:// URLs, tests)
//! ```
//!
//! ## Single Writer
//!
//! `append_if_changed` compares against the in-process baseline, not the
//! database. Two instances sharing one database could both append; the
//! deployment runs exactly one instance.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::postgres_store::PostgresBackend;
use crate::sqlite_store::SqliteBackend;
use crate::state::StateBlob;

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Default number of rows kept after each append.
pub const DEFAULT_STATE_RETENTION: usize = 5;

// ════════════════════════════════════════════════════════════════════════════
// ERROR TYPE
// ════════════════════════════════════════════════════════════════════════════

/// Errors surfaced by the state store. None of them are retried.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection string uses a scheme no backend understands.
    #[error("unsupported database url scheme: {0}")]
    UnsupportedUrl(String),

    /// The connection string could not be parsed.
    #[error("invalid database url: {0}")]
    InvalidUrl(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("tls setup error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The state column is text; the blob must be valid UTF-8.
    #[error("state blob is not valid UTF-8 ({len} bytes)")]
    NonUtf8Blob { len: usize },

    /// A blocking database task panicked or was cancelled.
    #[error("database task failed: {0}")]
    Task(String),
}

// ════════════════════════════════════════════════════════════════════════════
// BACKEND TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Raw table operations implemented per database engine.
///
/// Implementations hold exactly one connection and perform no retries.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short engine name for logs ("postgres", "sqlite").
    fn engine(&self) -> &'static str;

    /// `CREATE TABLE IF NOT EXISTS`. Must be idempotent.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// The `state` of the row with the highest id, if any.
    async fn latest(&self) -> Result<Option<String>, StoreError>;

    /// Inserts a row and returns its id.
    async fn insert(&self, state: &str) -> Result<i64, StoreError>;

    /// Deletes every row except the newest `keep`. Returns rows deleted.
    async fn prune(&self, keep: usize) -> Result<u64, StoreError>;

    /// Number of rows currently stored.
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Opens the backend matching the URL scheme.
///
/// - `postgres://…`, `postgresql://…` → [`PostgresBackend`]
/// - `sqlite::memory:`, `sqlite://<path>`, `sqlite:<path>` → [`SqliteBackend`]
pub async fn open_backend(database_url: &str) -> Result<Box<dyn StateBackend>, StoreError> {
    let url = database_url.trim();

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let backend = PostgresBackend::connect(url).await?;
        return Ok(Box::new(backend));
    }

    if let Some(rest) = url.strip_prefix("sqlite:") {
        let backend = if rest == ":memory:" {
            SqliteBackend::open_in_memory()?
        } else {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(StoreError::InvalidUrl("sqlite url has no path".to_string()));
            }
            SqliteBackend::open(path)?
        };
        return Ok(Box::new(backend));
    }

    let scheme = url.split(':').next().unwrap_or_default().to_string();
    Err(StoreError::UnsupportedUrl(scheme))
}

// ════════════════════════════════════════════════════════════════════════════
// APPEND OUTCOME
// ════════════════════════════════════════════════════════════════════════════

/// Result of [`StateStore::append_if_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new row was written.
    Appended {
        /// Id of the new row.
        id: i64,
        /// Older rows removed by the retention policy.
        pruned: u64,
    },
    /// The blob equals the baseline; nothing was written.
    Unchanged,
}

// ════════════════════════════════════════════════════════════════════════════
// STATE STORE
// ════════════════════════════════════════════════════════════════════════════

/// Persists and replays the daemon's state blob.
pub struct StateStore {
    backend: Box<dyn StateBackend>,
    /// Rows kept after an append. `0` disables pruning.
    retention: usize,
    /// Value most recently loaded or appended in this process run.
    baseline: Mutex<Option<StateBlob>>,
}

impl StateStore {
    pub fn new(backend: Box<dyn StateBackend>, retention: usize) -> Self {
        Self {
            backend,
            retention,
            baseline: Mutex::new(None),
        }
    }

    /// Opens a backend from a connection string and wraps it.
    pub async fn connect(database_url: &str, retention: usize) -> Result<Self, StoreError> {
        let backend = open_backend(database_url).await?;
        info!(engine = backend.engine(), retention, "state store connected");
        Ok(Self::new(backend, retention))
    }

    /// Creates the backing table if absent. Safe to call on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.backend.ensure_schema().await
    }

    /// Returns the most recently inserted blob, or `None` when the table is
    /// empty. The result becomes this run's baseline.
    pub async fn load_latest(&self) -> Result<Option<StateBlob>, StoreError> {
        let latest = self.backend.latest().await?.map(StateBlob::from);
        debug!(
            found = latest.is_some(),
            len = latest.as_ref().map(StateBlob::len).unwrap_or(0),
            "loaded latest state"
        );
        *self.baseline.lock() = latest.clone();
        Ok(latest)
    }

    /// Inserts `blob` only if it differs byte-for-byte from the baseline.
    ///
    /// A missing baseline compares equal to an empty blob, so an empty
    /// state file on a first run is not persisted. On insert the baseline
    /// moves to `blob`, which makes repeated appends of one value write a
    /// single row.
    pub async fn append_if_changed(&self, blob: &StateBlob) -> Result<AppendOutcome, StoreError> {
        let unchanged = match self.baseline.lock().as_ref() {
            Some(current) => current == blob,
            None => blob.is_empty(),
        };
        if unchanged {
            debug!(len = blob.len(), "state unchanged; skipping write");
            return Ok(AppendOutcome::Unchanged);
        }

        let text = blob
            .as_text()
            .ok_or(StoreError::NonUtf8Blob { len: blob.len() })?;
        let id = self.backend.insert(text).await?;

        let pruned = if self.retention > 0 {
            self.backend.prune(self.retention).await?
        } else {
            0
        };

        *self.baseline.lock() = Some(blob.clone());
        info!(id, pruned, len = blob.len(), "state appended");
        Ok(AppendOutcome::Appended { id, pruned })
    }

    /// Number of rows in the history table.
    pub async fn history_len(&self) -> Result<u64, StoreError> {
        self.backend.count().await
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
