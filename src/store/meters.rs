//! Meter CRUD and the meter index allocator.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::model::Meter;
use crate::types::{Result, VaultError};

fn meter_from_row(row: &Row) -> rusqlite::Result<Meter> {
    Ok(Meter {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        gsrn: row.get("gsrn")?,
        sector: row.get("sector")?,
        key_index: row.get::<_, i64>("key_index")? as u64,
    })
}

/// Register a meter under a user, allocating its key index.
pub fn create_meter(conn: &mut Connection, user_id: i64, gsrn: &str, sector: &str) -> Result<Meter> {
    let tx = conn
        .transaction()
        .map_err(|e| VaultError::Internal(format!("Begin transaction failed: {}", e)))?;

    let key_index = next_meter_index(&tx, user_id)?;
    tx.execute(
        "INSERT INTO meters (user_id, gsrn, sector, key_index) VALUES (?1, ?2, ?3, ?4)",
        params![user_id, gsrn, sector, key_index as i64],
    )
    .map_err(|e| VaultError::Internal(format!("Insert meter failed: {}", e)))?;
    let id = tx.last_insert_rowid();

    tx.commit()
        .map_err(|e| VaultError::Internal(format!("Commit failed: {}", e)))?;

    Ok(Meter {
        id,
        user_id,
        gsrn: gsrn.to_string(),
        sector: sector.to_string(),
        key_index,
    })
}

pub fn get_meter(conn: &Connection, id: i64) -> Result<Meter> {
    conn.query_row("SELECT * FROM meters WHERE id = ?1", [id], meter_from_row)
        .optional()
        .map_err(|e| VaultError::Internal(format!("Query meter failed: {}", e)))?
        .ok_or_else(|| VaultError::NotFound(format!("meter {}", id)))
}

/// Look up a meter by GSRN, requiring it to belong to `user_id`.
pub fn get_user_meter(conn: &Connection, user_id: i64, gsrn: &str) -> Result<Meter> {
    conn.query_row(
        "SELECT * FROM meters WHERE user_id = ?1 AND gsrn = ?2",
        params![user_id, gsrn],
        meter_from_row,
    )
    .optional()
    .map_err(|e| VaultError::Internal(format!("Query meter failed: {}", e)))?
    .ok_or_else(|| VaultError::NotFound(format!("meter {} for user {}", gsrn, user_id)))
}

pub fn list_user_meters(conn: &Connection, user_id: i64) -> Result<Vec<Meter>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM meters WHERE user_id = ?1 ORDER BY key_index")
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map([user_id], meter_from_row)
        .map_err(|e| VaultError::Internal(format!("Query meters failed: {}", e)))?;

    let mut meters = Vec::new();
    for row in rows {
        meters.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(meters)
}

/// Allocate the next meter index for a user.
///
/// Inserts `max + 1` into the allocation table and walks forward on a
/// duplicate-key failure until an insert lands, so two callers racing
/// on the same user end up with distinct indices.
pub fn next_meter_index(conn: &Connection, user_id: i64) -> Result<u64> {
    let mut candidate: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM meter_index_seq WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .map_err(|e| VaultError::Internal(format!("Query meter index failed: {}", e)))?;

    loop {
        let inserted = conn.execute(
            "INSERT INTO meter_index_seq (user_id, idx) VALUES (?1, ?2)",
            params![user_id, candidate],
        );
        match inserted {
            Ok(_) => return Ok(candidate as u64),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                candidate += 1;
            }
            Err(e) => {
                return Err(VaultError::Internal(format!(
                    "Insert meter index failed: {}",
                    e
                )))
            }
        }
    }
}
