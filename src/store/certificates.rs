//! Certificate CRUD, the tradability gate and the certificate index
//! allocator.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{Certificate, NewCertificate, User};
use crate::types::{Result, VaultError};

use super::column_ts;

pub(crate) fn certificate_from_row(row: &Row) -> rusqlite::Result<Certificate> {
    Ok(Certificate {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        parent_id: row.get("parent_id")?,
        address: row.get("address")?,
        key_index: row
            .get::<_, Option<i64>>("key_index")?
            .map(|i| i as u64),
        issue_time: column_ts(row.get("issue_time")?, "issue_time")?,
        expire_time: column_ts(row.get("expire_time")?, "expire_time")?,
        begin: column_ts(row.get("period_begin")?, "period_begin")?,
        end: column_ts(row.get("period_end")?, "period_end")?,
        amount: row.get::<_, i64>("amount")? as u64,
        sector: row.get("sector")?,
        technology_code: row.get("technology_code")?,
        fuel_code: row.get("fuel_code")?,
        issued: row.get("issued")?,
        stored: row.get("stored")?,
        retired: row.get("retired")?,
        synchronized: row.get("synchronized")?,
        locked: row.get("locked")?,
        issue_gsrn: row.get("issue_gsrn")?,
        retire_gsrn: row.get("retire_gsrn")?,
        retire_address: row.get("retire_address")?,
    })
}

pub fn create_certificate(conn: &Connection, input: &NewCertificate) -> Result<Certificate> {
    conn.execute(
        "INSERT INTO certificates (
             user_id, parent_id, address, key_index, issue_time, expire_time,
             period_begin, period_end, amount, sector, technology_code, fuel_code,
             issued, stored, retired, synchronized, locked, issue_gsrn
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            input.user_id,
            input.parent_id,
            input.address,
            input.key_index.map(|i| i as i64),
            input.issue_time.timestamp(),
            input.expire_time.timestamp(),
            input.begin.timestamp(),
            input.end.timestamp(),
            input.amount as i64,
            input.sector,
            input.technology_code,
            input.fuel_code,
            input.issued,
            input.stored,
            input.retired,
            input.synchronized,
            input.locked,
            input.issue_gsrn,
        ],
    )
    .map_err(|e| VaultError::Internal(format!("Insert certificate failed: {}", e)))?;

    get_certificate(conn, conn.last_insert_rowid())
}

pub fn get_certificate(conn: &Connection, id: i64) -> Result<Certificate> {
    conn.query_row(
        "SELECT * FROM certificates WHERE id = ?1",
        [id],
        certificate_from_row,
    )
    .optional()
    .map_err(|e| VaultError::Internal(format!("Query certificate failed: {}", e)))?
    .ok_or_else(|| VaultError::NotFound(format!("certificate {}", id)))
}

pub fn get_by_address(conn: &Connection, address: &str) -> Result<Option<Certificate>> {
    conn.query_row(
        "SELECT * FROM certificates WHERE address = ?1",
        [address],
        certificate_from_row,
    )
    .optional()
    .map_err(|e| VaultError::Internal(format!("Query certificate failed: {}", e)))
}

/// Load a certificate for consumption by the composer.
///
/// `NotFound` covers both a missing address and an address owned by
/// somebody else; `NotTradable` names the first failing predicate.
pub fn load_tradable(
    conn: &Connection,
    user: &User,
    address: &str,
    now: DateTime<Utc>,
) -> Result<Certificate> {
    let cert = get_by_address(conn, address)?
        .filter(|c| c.user_id == user.id)
        .ok_or_else(|| {
            VaultError::NotFound(format!("certificate {} for user {}", address, user.subject))
        })?;

    if !cert.stored {
        return Err(VaultError::NotTradable(format!("{}: not stored", address)));
    }
    if cert.retired {
        return Err(VaultError::NotTradable(format!("{}: retired", address)));
    }
    if cert.locked {
        return Err(VaultError::NotTradable(format!("{}: locked", address)));
    }
    if !cert.synchronized {
        return Err(VaultError::NotTradable(format!(
            "{}: not synchronized",
            address
        )));
    }
    if cert.is_expired(now) {
        return Err(VaultError::NotTradable(format!("{}: expired", address)));
    }

    Ok(cert)
}

/// Total Wh already retired against a measurement's ledger address.
/// Includes optimistically retired certificates of in-flight batches,
/// which keeps concurrent composers from over-retiring a measurement.
pub fn retired_amount(conn: &Connection, measurement_address: &str) -> Result<u64> {
    let sum: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM certificates
             WHERE retire_address = ?1 AND retired = 1",
            [measurement_address],
            |row| row.get(0),
        )
        .map_err(|e| VaultError::Internal(format!("Query retired amount failed: {}", e)))?;
    Ok(sum as u64)
}

pub fn list_user_certificates(conn: &Connection, user_id: i64) -> Result<Vec<Certificate>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM certificates WHERE user_id = ?1 ORDER BY id")
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map([user_id], certificate_from_row)
        .map_err(|e| VaultError::Internal(format!("Query certificates failed: {}", e)))?;

    let mut certs = Vec::new();
    for row in rows {
        certs.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(certs)
}

pub fn list_children(conn: &Connection, parent_id: i64) -> Result<Vec<Certificate>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM certificates WHERE parent_id = ?1 ORDER BY id")
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map([parent_id], certificate_from_row)
        .map_err(|e| VaultError::Internal(format!("Query children failed: {}", e)))?;

    let mut certs = Vec::new();
    for row in rows {
        certs.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(certs)
}

// ============================================================================
// Certificate index sequence
// ============================================================================

/// Allocate the next certificate index for a user.
///
/// A single upsert increments and returns the counter, so concurrent
/// composers for one user cannot receive the same value.
pub fn next_certificate_index(conn: &Connection, user_id: i64) -> Result<u64> {
    let idx: i64 = conn
        .query_row(
            "INSERT INTO certificate_index_seq (user_id, idx) VALUES (?1, 0)
             ON CONFLICT (user_id) DO UPDATE SET idx = idx + 1
             RETURNING idx",
            [user_id],
            |row| row.get(0),
        )
        .map_err(|e| VaultError::Internal(format!("Allocate certificate index failed: {}", e)))?;
    Ok(idx as u64)
}

/// Rewind a user's certificate counter to the highest index still in
/// use, deleting the row when none remain. Called by batch rollback
/// after the children holding the top indices are removed, inside the
/// rollback's transaction.
pub fn reclaim_certificate_indices(conn: &Connection, user_id: i64) -> Result<()> {
    let max: Option<i64> = conn
        .query_row(
            "SELECT MAX(key_index) FROM certificates
             WHERE user_id = ?1 AND key_index IS NOT NULL",
            [user_id],
            |row| row.get(0),
        )
        .map_err(|e| VaultError::Internal(format!("Query max key_index failed: {}", e)))?;

    match max {
        Some(m) => {
            conn.execute(
                "UPDATE certificate_index_seq SET idx = ?2 WHERE user_id = ?1",
                params![user_id, m],
            )
            .map_err(|e| VaultError::Internal(format!("Rewind index seq failed: {}", e)))?;
        }
        None => {
            conn.execute(
                "DELETE FROM certificate_index_seq WHERE user_id = ?1",
                [user_id],
            )
            .map_err(|e| VaultError::Internal(format!("Delete index seq failed: {}", e)))?;
        }
    }
    Ok(())
}
