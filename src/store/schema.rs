//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::types::VaultError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), VaultError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, VaultError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| VaultError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), VaultError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| VaultError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| VaultError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), VaultError> {
    conn.execute_batch(ACCOUNT_SCHEMA)
        .map_err(|e| VaultError::Internal(format!("Failed to create account tables: {}", e)))?;

    conn.execute_batch(CERTIFICATE_SCHEMA)
        .map_err(|e| VaultError::Internal(format!("Failed to create certificate tables: {}", e)))?;

    conn.execute_batch(BATCH_SCHEMA)
        .map_err(|e| VaultError::Internal(format!("Failed to create batch tables: {}", e)))?;

    conn.execute_batch(EVENT_SCHEMA)
        .map_err(|e| VaultError::Internal(format!("Failed to create event tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| VaultError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), VaultError> {
    match from_version {
        // 1 -> 2 migration goes here once the schema evolves
        _ => {}
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Users, meters and per-user key index sequences
const ACCOUNT_SCHEMA: &str = r#"
-- Account holders. master_extended_key seeds the key schedule;
-- token fields are opaque upstream credentials.
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL UNIQUE,
    master_extended_key TEXT NOT NULL,
    access_token TEXT,
    refresh_token TEXT,
    token_expire INTEGER,
    last_login INTEGER
);

-- Metering points. key_index is the meter's slot in the owner's
-- key schedule.
CREATE TABLE IF NOT EXISTS meters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    gsrn TEXT NOT NULL UNIQUE,
    sector TEXT NOT NULL,
    key_index INTEGER NOT NULL,
    UNIQUE (user_id, key_index),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

-- Certificate counter: idx holds the last allocated child index.
CREATE TABLE IF NOT EXISTS certificate_index_seq (
    user_id INTEGER NOT NULL UNIQUE,
    idx INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

-- Meter allocations: one row per handed-out meter index.
CREATE TABLE IF NOT EXISTS meter_index_seq (
    user_id INTEGER NOT NULL,
    idx INTEGER NOT NULL,
    UNIQUE (user_id, idx),
    FOREIGN KEY (user_id) REFERENCES users(id)
);
"#;

/// Certificate mirror
const CERTIFICATE_SCHEMA: &str = r#"
-- Local mirror of ledger certificates. Timestamps are unix seconds,
-- flags are 0/1.
CREATE TABLE IF NOT EXISTS certificates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    parent_id INTEGER,
    address TEXT NOT NULL UNIQUE,
    key_index INTEGER,
    issue_time INTEGER NOT NULL,
    expire_time INTEGER NOT NULL,
    period_begin INTEGER NOT NULL,
    period_end INTEGER NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    sector TEXT NOT NULL,
    technology_code TEXT NOT NULL,
    fuel_code TEXT NOT NULL,
    issued INTEGER NOT NULL DEFAULT 0,
    stored INTEGER NOT NULL DEFAULT 0,
    retired INTEGER NOT NULL DEFAULT 0,
    synchronized INTEGER NOT NULL DEFAULT 0,
    locked INTEGER NOT NULL DEFAULT 0,
    issue_gsrn TEXT,
    retire_gsrn TEXT,
    retire_address TEXT,
    UNIQUE (user_id, key_index),
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (parent_id) REFERENCES certificates(id)
);
"#;

/// Batches and their transactions
const BATCH_SCHEMA: &str = r#"
-- Submitted batches. state is PENDING/SUBMITTED/DECLINED/COMPLETED.
CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created INTEGER NOT NULL,
    state TEXT NOT NULL,
    submitted INTEGER,
    user_id INTEGER NOT NULL,
    handle TEXT,
    poll_count INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

-- Batch transactions. tx_order is the application order on success;
-- rollback walks in reverse. Retire rows carry period_begin,
-- meter_id and measurement_address; split rows carry targets.
-- parent_ggo_id is deliberately not a foreign key: rollback retains
-- transaction rows while deleting the split children they consumed.
CREATE TABLE IF NOT EXISTS batch_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    tx_order INTEGER NOT NULL,
    tx_type TEXT NOT NULL,
    parent_ggo_id INTEGER NOT NULL,
    period_begin INTEGER,
    meter_id INTEGER,
    measurement_address TEXT,
    UNIQUE (batch_id, tx_order),
    FOREIGN KEY (batch_id) REFERENCES batches(id) ON DELETE CASCADE,
    FOREIGN KEY (meter_id) REFERENCES meters(id)
);

-- Children minted by a split. Cascade with the child certificate so
-- rollback's deletion cannot dangle.
CREATE TABLE IF NOT EXISTS split_targets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL,
    ggo_id INTEGER NOT NULL UNIQUE,
    reference TEXT,
    FOREIGN KEY (transaction_id) REFERENCES batch_transactions(id) ON DELETE CASCADE,
    FOREIGN KEY (ggo_id) REFERENCES certificates(id) ON DELETE CASCADE
);
"#;

/// Webhook subscriptions and technology labels
const EVENT_SCHEMA: &str = r#"
-- Webhook subscriptions. secret signs delivery bodies.
CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event TEXT NOT NULL,
    subject TEXT NOT NULL,
    url TEXT NOT NULL,
    secret TEXT NOT NULL,
    created INTEGER NOT NULL,
    UNIQUE (event, subject, url)
);

-- Display labels for (technology_code, fuel_code) pairs.
CREATE TABLE IF NOT EXISTS technology (
    technology_code TEXT NOT NULL,
    fuel_code TEXT NOT NULL,
    label TEXT NOT NULL,
    PRIMARY KEY (technology_code, fuel_code)
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
-- Certificate indexes
CREATE INDEX IF NOT EXISTS idx_certificates_user_id ON certificates(user_id);
CREATE INDEX IF NOT EXISTS idx_certificates_parent_id ON certificates(parent_id);
CREATE INDEX IF NOT EXISTS idx_certificates_retire_address ON certificates(retire_address);

-- Batch indexes
CREATE INDEX IF NOT EXISTS idx_batches_state ON batches(state);
CREATE INDEX IF NOT EXISTS idx_batches_user_id ON batches(user_id);
CREATE INDEX IF NOT EXISTS idx_transactions_batch_id ON batch_transactions(batch_id);
CREATE INDEX IF NOT EXISTS idx_transactions_parent_ggo ON batch_transactions(parent_ggo_id);
CREATE INDEX IF NOT EXISTS idx_split_targets_transaction ON split_targets(transaction_id);

-- Subscription indexes
CREATE INDEX IF NOT EXISTS idx_subscriptions_event_subject ON webhook_subscriptions(event, subject);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_twice() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn amount_check_rejects_zero() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (subject, master_extended_key) VALUES ('s', 'k')",
            [],
        )
        .unwrap();
        let res = conn.execute(
            "INSERT INTO certificates (user_id, address, issue_time, expire_time,
             period_begin, period_end, amount, sector, technology_code, fuel_code)
             VALUES (1, 'addr', 0, 0, 0, 0, 0, 'DK1', 'T', 'F')",
            [],
        );
        assert!(res.is_err());
    }
}
