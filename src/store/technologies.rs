//! Display labels for `(technology_code, fuel_code)` pairs.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::Technology;
use crate::types::{Result, VaultError};

fn technology_from_row(row: &Row) -> rusqlite::Result<Technology> {
    Ok(Technology {
        technology_code: row.get("technology_code")?,
        fuel_code: row.get("fuel_code")?,
        label: row.get("label")?,
    })
}

pub fn set_label(
    conn: &Connection,
    technology_code: &str,
    fuel_code: &str,
    label: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO technology (technology_code, fuel_code, label) VALUES (?1, ?2, ?3)
         ON CONFLICT (technology_code, fuel_code) DO UPDATE SET label = excluded.label",
        params![technology_code, fuel_code, label],
    )
    .map_err(|e| VaultError::Internal(format!("Upsert technology failed: {}", e)))?;
    Ok(())
}

pub fn get_label(
    conn: &Connection,
    technology_code: &str,
    fuel_code: &str,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT * FROM technology WHERE technology_code = ?1 AND fuel_code = ?2",
        params![technology_code, fuel_code],
        technology_from_row,
    )
    .optional()
    .map_err(|e| VaultError::Internal(format!("Query technology failed: {}", e)))
    .map(|t| t.map(|t| t.label))
}

/// Resolve a label, falling back to the configured unknown label for
/// unmapped pairs.
pub fn resolve_label(
    conn: &Connection,
    technology_code: &str,
    fuel_code: &str,
    unknown_label: &str,
) -> Result<String> {
    Ok(get_label(conn, technology_code, fuel_code)?.unwrap_or_else(|| unknown_label.to_string()))
}

pub fn list_all(conn: &Connection) -> Result<Vec<Technology>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM technology ORDER BY technology_code, fuel_code")
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map([], technology_from_row)
        .map_err(|e| VaultError::Internal(format!("Query technologies failed: {}", e)))?;

    let mut technologies = Vec::new();
    for row in rows {
        technologies.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(technologies)
}
