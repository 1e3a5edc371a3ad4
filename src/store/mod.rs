//! Local mirror persistence.
//!
//! A thin wrapper around a rusqlite connection plus per-entity modules
//! of free functions. Every batch phase (compose, commit, rollback)
//! runs inside a single connection-level transaction obtained through
//! [`CertificateStore::with_conn_mut`].

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use crate::types::{Result, VaultError};

pub mod batches;
pub mod certificates;
pub mod meters;
pub mod schema;
pub mod subscriptions;
pub mod technologies;
pub mod users;

/// Handle to the mirror database.
///
/// The connection is guarded by a std mutex: SQLite serialises writers
/// anyway, and the closure style keeps lock scopes tight.
pub struct CertificateStore {
    conn: Mutex<Connection>,
}

impl CertificateStore {
    /// Open (or create) the database at `path` and initialize the
    /// schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| VaultError::Internal(format!("Failed to open database: {}", e)))?;

        info!("Opened certificate store at {}", path.display());
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VaultError::Internal(format!("Failed to open in-memory db: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| VaultError::Internal(format!("Failed to set WAL mode: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| VaultError::Internal(format!("Failed to set synchronous: {}", e)))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| VaultError::Internal(format!("Failed to enable foreign keys: {}", e)))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a read-only closure against the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("DB lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run a mutating closure against the connection. Callers that
    /// need atomicity open a transaction inside the closure.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("DB lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}

/// Convert a stored unix-seconds column to a timestamp, surfacing
/// corruption as a row conversion failure.
pub(crate) fn column_ts(value: i64, column: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(value, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("invalid timestamp in column {}: {}", column, value).into(),
        )
    })
}

pub(crate) fn column_ts_opt(
    value: Option<i64>,
    column: &str,
) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    value.map(|v| column_ts(v, column)).transpose()
}
