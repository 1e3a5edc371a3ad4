//! User CRUD and token bookkeeping.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{NewUser, User};
use crate::types::{Result, VaultError};

use super::column_ts_opt;

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        subject: row.get("subject")?,
        master_extended_key: row.get("master_extended_key")?,
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        token_expire: column_ts_opt(row.get("token_expire")?, "token_expire")?,
        last_login: column_ts_opt(row.get("last_login")?, "last_login")?,
    })
}

pub fn create_user(conn: &Connection, input: &NewUser) -> Result<User> {
    conn.execute(
        "INSERT INTO users (subject, master_extended_key, access_token, refresh_token, token_expire)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            input.subject,
            input.master_extended_key,
            input.access_token,
            input.refresh_token,
            input.token_expire.map(|t| t.timestamp()),
        ],
    )
    .map_err(|e| VaultError::Internal(format!("Insert user failed: {}", e)))?;

    get_user(conn, conn.last_insert_rowid())
}

pub fn get_user(conn: &Connection, id: i64) -> Result<User> {
    conn.query_row("SELECT * FROM users WHERE id = ?1", [id], user_from_row)
        .optional()
        .map_err(|e| VaultError::Internal(format!("Query user failed: {}", e)))?
        .ok_or_else(|| VaultError::NotFound(format!("user {}", id)))
}

pub fn get_user_by_subject(conn: &Connection, subject: &str) -> Result<User> {
    conn.query_row(
        "SELECT * FROM users WHERE subject = ?1",
        [subject],
        user_from_row,
    )
    .optional()
    .map_err(|e| VaultError::Internal(format!("Query user failed: {}", e)))?
    .ok_or_else(|| VaultError::NotFound(format!("user with subject {}", subject)))
}

/// Replace the upstream credentials after a token refresh.
pub fn update_tokens(
    conn: &Connection,
    user_id: i64,
    access_token: &str,
    refresh_token: &str,
    token_expire: DateTime<Utc>,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE users SET access_token = ?2, refresh_token = ?3, token_expire = ?4
             WHERE id = ?1",
            params![user_id, access_token, refresh_token, token_expire.timestamp()],
        )
        .map_err(|e| VaultError::Internal(format!("Update tokens failed: {}", e)))?;
    if updated == 0 {
        return Err(VaultError::NotFound(format!("user {}", user_id)));
    }
    Ok(())
}

pub fn touch_last_login(conn: &Connection, user_id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE users SET last_login = ?2 WHERE id = ?1",
        params![user_id, now.timestamp()],
    )
    .map_err(|e| VaultError::Internal(format!("Update last_login failed: {}", e)))?;
    Ok(())
}

pub fn list_all(conn: &Connection) -> Result<Vec<User>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM users ORDER BY id")
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map([], user_from_row)
        .map_err(|e| VaultError::Internal(format!("Query users failed: {}", e)))?;

    let mut users = Vec::new();
    for row in rows {
        users.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(users)
}

/// Users whose access token expires within `within` of `now`,
/// including users with no recorded expiry at all.
pub fn list_token_refresh_due(
    conn: &Connection,
    now: DateTime<Utc>,
    within: Duration,
) -> Result<Vec<User>> {
    let cutoff = (now + within).timestamp();
    let mut stmt = conn
        .prepare_cached(
            "SELECT * FROM users WHERE token_expire IS NULL OR token_expire <= ?1
             ORDER BY token_expire ASC",
        )
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map([cutoff], user_from_row)
        .map_err(|e| VaultError::Internal(format!("Query refresh-due users failed: {}", e)))?;

    let mut users = Vec::new();
    for row in rows {
        users.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(users)
}
