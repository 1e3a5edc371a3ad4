//! Batch and transaction persistence plus the state-machine effects
//! on certificate flags.
//!
//! Compose, commit and rollback each run inside one connection-level
//! transaction: either every flag flip and row lands, or none do.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{
    Batch, BatchState, BatchTransaction, Certificate, ComposedBatch, RetireSubject, SplitTarget,
    TransactionDetail, TransactionKind, User,
};
use crate::types::{Result, VaultError};

use super::{certificates, column_ts, column_ts_opt, users};

fn batch_from_row(row: &Row) -> rusqlite::Result<Batch> {
    let state_text: String = row.get("state")?;
    let state = BatchState::parse(&state_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;
    Ok(Batch {
        id: row.get("id")?,
        created: column_ts(row.get("created")?, "created")?,
        state,
        submitted: column_ts_opt(row.get("submitted")?, "submitted")?,
        user_id: row.get("user_id")?,
        handle: row.get("handle")?,
        poll_count: row.get::<_, i64>("poll_count")? as u32,
    })
}

struct RawTransaction {
    id: i64,
    batch_id: i64,
    order: u32,
    kind: String,
    parent_ggo_id: i64,
    period_begin: Option<i64>,
    meter_id: Option<i64>,
    measurement_address: Option<String>,
}

// ============================================================================
// Creation (compose phase)
// ============================================================================

/// Persist a composed batch in `PENDING` together with its children
/// and apply the optimistic flag effects, all in one transaction.
///
/// Returns the batch and the minted children in split-target order
/// (empty for a direct retire).
pub fn create_batch(
    conn: &mut Connection,
    composed: &ComposedBatch,
    now: DateTime<Utc>,
) -> Result<(Batch, Vec<Certificate>)> {
    let tx = conn
        .transaction()
        .map_err(|e| VaultError::Internal(format!("Begin transaction failed: {}", e)))?;
    let created = create_batch_in(&tx, composed, now)?;
    tx.commit()
        .map_err(|e| VaultError::Internal(format!("Commit failed: {}", e)))?;
    Ok(created)
}

/// Like [`create_batch`] but runs on the caller's open transaction,
/// so child index allocation and batch creation share one atomic
/// scope. The caller commits.
pub fn create_batch_in(
    tx: &Connection,
    composed: &ComposedBatch,
    now: DateTime<Utc>,
) -> Result<(Batch, Vec<Certificate>)> {
    let parent = certificates::get_certificate(tx, composed.parent_id)?;
    if composed.split_targets.is_empty() {
        // Direct retire of the parent: exactly one retire, no children.
        if composed.retires.len() != 1 || composed.retires[0].subject != RetireSubject::Parent {
            return Err(VaultError::Integrity(format!(
                "batch without split must retire the parent exactly once, got {} retires",
                composed.retires.len()
            )));
        }
    } else {
        let sum: u64 = composed
            .split_targets
            .iter()
            .map(|t| t.certificate.amount)
            .sum();
        if sum != parent.amount {
            return Err(VaultError::Integrity(format!(
                "split targets sum {} != parent amount {}",
                sum, parent.amount
            )));
        }
    }

    tx.execute(
        "INSERT INTO batches (created, state, user_id) VALUES (?1, ?2, ?3)",
        params![
            now.timestamp(),
            BatchState::Pending.as_str(),
            composed.user_id
        ],
    )
    .map_err(|e| VaultError::Internal(format!("Insert batch failed: {}", e)))?;
    let batch_id = tx.last_insert_rowid();

    let mut order: u32 = 0;
    let mut children: Vec<Certificate> = Vec::with_capacity(composed.split_targets.len());

    if !composed.split_targets.is_empty() {
        for target in &composed.split_targets {
            children.push(certificates::create_certificate(tx, &target.certificate)?);
        }

        tx.execute(
            "INSERT INTO batch_transactions (batch_id, tx_order, tx_type, parent_ggo_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                batch_id,
                order,
                TransactionKind::Split.as_str(),
                composed.parent_id
            ],
        )
        .map_err(|e| VaultError::Internal(format!("Insert split failed: {}", e)))?;
        let split_tx_id = tx.last_insert_rowid();
        order += 1;

        for (target, child) in composed.split_targets.iter().zip(&children) {
            tx.execute(
                "INSERT INTO split_targets (transaction_id, ggo_id, reference)
                 VALUES (?1, ?2, ?3)",
                params![split_tx_id, child.id, target.reference],
            )
            .map_err(|e| VaultError::Internal(format!("Insert split target failed: {}", e)))?;
        }

        // Optimistic split effect on the parent.
        tx.execute(
            "UPDATE certificates SET stored = 0, locked = 1, synchronized = 0 WHERE id = ?1",
            [composed.parent_id],
        )
        .map_err(|e| VaultError::Internal(format!("Lock parent failed: {}", e)))?;
    }

    for retire in &composed.retires {
        let target_id = match retire.subject {
            RetireSubject::Parent => composed.parent_id,
            RetireSubject::SplitChild(i) => {
                children
                    .get(i)
                    .ok_or_else(|| {
                        VaultError::Integrity(format!(
                            "retire references split child {} of {}",
                            i,
                            children.len()
                        ))
                    })?
                    .id
            }
        };

        tx.execute(
            "INSERT INTO batch_transactions
                 (batch_id, tx_order, tx_type, parent_ggo_id, period_begin, meter_id, measurement_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                batch_id,
                order,
                TransactionKind::Retire.as_str(),
                target_id,
                retire.begin.timestamp(),
                retire.meter_id,
                retire.measurement_address,
            ],
        )
        .map_err(|e| VaultError::Internal(format!("Insert retire failed: {}", e)))?;
        order += 1;

        // Optimistic retire effect on its target.
        tx.execute(
            "UPDATE certificates SET stored = 0, retired = 1, locked = 1, synchronized = 0,
                 retire_gsrn = ?2, retire_address = ?3
             WHERE id = ?1",
            params![target_id, retire.gsrn, retire.measurement_address],
        )
        .map_err(|e| VaultError::Internal(format!("Mark retired failed: {}", e)))?;
    }

    let batch = get_batch_tx(tx, batch_id)?;
    // Re-read children so returned rows carry the retire flags.
    let children = children
        .iter()
        .map(|c| certificates::get_certificate(tx, c.id))
        .collect::<Result<Vec<_>>>()?;

    Ok((batch, children))
}

// ============================================================================
// Lookup
// ============================================================================

pub fn get_batch(conn: &Connection, id: i64) -> Result<Batch> {
    get_batch_tx(conn, id)
}

fn get_batch_tx(conn: &Connection, id: i64) -> Result<Batch> {
    conn.query_row("SELECT * FROM batches WHERE id = ?1", [id], batch_from_row)
        .optional()
        .map_err(|e| VaultError::Internal(format!("Query batch failed: {}", e)))?
        .ok_or_else(|| VaultError::NotFound(format!("batch {}", id)))
}

/// Load a batch's transactions in application order, with split
/// targets attached, and verify the ordering invariant: an optional
/// split strictly first, retires after, orders contiguous.
pub fn get_batch_transactions(conn: &Connection, batch_id: i64) -> Result<Vec<BatchTransaction>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id, batch_id, tx_order, tx_type, parent_ggo_id,
                    period_begin, meter_id, measurement_address
             FROM batch_transactions WHERE batch_id = ?1 ORDER BY tx_order",
        )
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;

    let raw_rows = stmt
        .query_map([batch_id], |row| {
            Ok(RawTransaction {
                id: row.get("id")?,
                batch_id: row.get("batch_id")?,
                order: row.get::<_, i64>("tx_order")? as u32,
                kind: row.get("tx_type")?,
                parent_ggo_id: row.get("parent_ggo_id")?,
                period_begin: row.get("period_begin")?,
                meter_id: row.get("meter_id")?,
                measurement_address: row.get("measurement_address")?,
            })
        })
        .map_err(|e| VaultError::Internal(format!("Query transactions failed: {}", e)))?;

    let mut transactions = Vec::new();
    for raw in raw_rows {
        let raw = raw.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?;
        let detail = match TransactionKind::parse(&raw.kind)? {
            TransactionKind::Split => TransactionDetail::Split {
                targets: load_targets(conn, raw.id)?,
            },
            TransactionKind::Retire => TransactionDetail::Retire {
                begin: raw
                    .period_begin
                    .and_then(|s| DateTime::from_timestamp(s, 0))
                    .ok_or_else(|| {
                        VaultError::Integrity(format!("retire {} missing begin", raw.id))
                    })?,
                meter_id: raw
                    .meter_id
                    .ok_or_else(|| VaultError::Integrity(format!("retire {} missing meter", raw.id)))?,
                measurement_address: raw.measurement_address.ok_or_else(|| {
                    VaultError::Integrity(format!("retire {} missing measurement address", raw.id))
                })?,
            },
        };
        transactions.push(BatchTransaction {
            id: raw.id,
            batch_id: raw.batch_id,
            order: raw.order,
            parent_ggo_id: raw.parent_ggo_id,
            detail,
        });
    }

    validate_ordering(&transactions)?;
    Ok(transactions)
}

fn load_targets(conn: &Connection, transaction_id: i64) -> Result<Vec<SplitTarget>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT id, transaction_id, ggo_id, reference FROM split_targets
             WHERE transaction_id = ?1 ORDER BY id",
        )
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map([transaction_id], |row| {
            Ok(SplitTarget {
                id: row.get("id")?,
                transaction_id: row.get("transaction_id")?,
                ggo_id: row.get("ggo_id")?,
                reference: row.get("reference")?,
            })
        })
        .map_err(|e| VaultError::Internal(format!("Query targets failed: {}", e)))?;

    let mut targets = Vec::new();
    for row in rows {
        targets.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(targets)
}

fn validate_ordering(transactions: &[BatchTransaction]) -> Result<()> {
    for (i, tx) in transactions.iter().enumerate() {
        if tx.order as usize != i {
            return Err(VaultError::Integrity(format!(
                "batch {} transaction order not contiguous at {}",
                tx.batch_id, tx.order
            )));
        }
        let is_split = matches!(tx.detail, TransactionDetail::Split { .. });
        if is_split && i != 0 {
            return Err(VaultError::Integrity(format!(
                "batch {} has a split at position {}",
                tx.batch_id, i
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Submission bookkeeping
// ============================================================================

/// Record a successful ledger submission.
pub fn mark_submitted(
    conn: &Connection,
    batch_id: i64,
    handle: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE batches SET state = ?2, handle = ?3, submitted = ?4, poll_count = 0
             WHERE id = ?1 AND state IN ('PENDING', 'SUBMITTED')",
            params![
                batch_id,
                BatchState::Submitted.as_str(),
                handle,
                now.timestamp()
            ],
        )
        .map_err(|e| VaultError::Internal(format!("Mark submitted failed: {}", e)))?;
    if updated == 0 {
        return Err(VaultError::Integrity(format!(
            "batch {} cannot move to SUBMITTED",
            batch_id
        )));
    }
    Ok(())
}

pub fn increment_poll_count(conn: &Connection, batch_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE batches SET poll_count = poll_count + 1 WHERE id = ?1",
        [batch_id],
    )
    .map_err(|e| VaultError::Internal(format!("Increment poll count failed: {}", e)))?;
    Ok(())
}

/// Discard a stale handle so the batch re-enters at the Submit step.
pub fn reset_for_resubmit(conn: &Connection, batch_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE batches SET state = ?2, handle = NULL, submitted = NULL
         WHERE id = ?1 AND state IN ('PENDING', 'SUBMITTED')",
        params![batch_id, BatchState::Pending.as_str()],
    )
    .map_err(|e| VaultError::Internal(format!("Reset batch failed: {}", e)))?;
    Ok(())
}

/// Batches to re-enqueue at boot.
pub fn list_unfinished(conn: &Connection) -> Result<Vec<Batch>> {
    list_by(
        conn,
        "SELECT * FROM batches WHERE state IN ('PENDING', 'SUBMITTED') ORDER BY id",
        params![],
    )
}

/// Batches the hourly resubmitter should rescue: pending ones older
/// than the threshold and submitted ones whose last submission is.
pub fn list_stuck(conn: &Connection, now: DateTime<Utc>, threshold: Duration) -> Result<Vec<Batch>> {
    let cutoff = (now - threshold).timestamp();
    list_by(
        conn,
        "SELECT * FROM batches
         WHERE (state = 'PENDING' AND created <= ?1)
            OR (state = 'SUBMITTED' AND submitted IS NOT NULL AND submitted <= ?1)
         ORDER BY id",
        params![cutoff],
    )
}

fn list_by(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Batch>> {
    let mut stmt = conn
        .prepare_cached(sql)
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map(args, batch_from_row)
        .map_err(|e| VaultError::Internal(format!("Query batches failed: {}", e)))?;

    let mut batches = Vec::new();
    for row in rows {
        batches.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(batches)
}

// ============================================================================
// Commit / rollback
// ============================================================================

pub struct CommitOutcome {
    /// True when a previous commit already applied the effects; the
    /// caller must not emit events again.
    pub already_completed: bool,
    /// `(recipient, certificate)` pairs for event publication: every
    /// split target that is not consumed by a retire in this batch.
    pub recipients: Vec<(User, Certificate)>,
}

/// Apply the COMPLETED effects in insertion order and finalize the
/// batch. Idempotent on flags: recommitting an already completed
/// batch changes nothing.
pub fn commit_batch(conn: &mut Connection, batch_id: i64) -> Result<CommitOutcome> {
    let tx = conn
        .transaction()
        .map_err(|e| VaultError::Internal(format!("Begin transaction failed: {}", e)))?;

    let batch = get_batch_tx(&tx, batch_id)?;
    if batch.state == BatchState::Completed {
        let recipients = collect_recipients(&tx, batch_id)?;
        tx.commit()
            .map_err(|e| VaultError::Internal(format!("Commit failed: {}", e)))?;
        return Ok(CommitOutcome {
            already_completed: true,
            recipients,
        });
    }
    if batch.state == BatchState::Declined {
        return Err(VaultError::Integrity(format!(
            "batch {} is DECLINED and cannot complete",
            batch_id
        )));
    }

    let transactions = get_batch_transactions(&tx, batch_id)?;
    for transaction in &transactions {
        match &transaction.detail {
            TransactionDetail::Split { targets } => {
                tx.execute(
                    "UPDATE certificates SET stored = 0, locked = 0, synchronized = 1
                     WHERE id = ?1",
                    [transaction.parent_ggo_id],
                )
                .map_err(|e| VaultError::Internal(format!("Complete split parent failed: {}", e)))?;
                for target in targets {
                    tx.execute(
                        "UPDATE certificates SET stored = 1, locked = 0, synchronized = 1
                         WHERE id = ?1",
                        [target.ggo_id],
                    )
                    .map_err(|e| {
                        VaultError::Internal(format!("Complete split child failed: {}", e))
                    })?;
                }
            }
            TransactionDetail::Retire { .. } => {
                tx.execute(
                    "UPDATE certificates SET stored = 0, retired = 1, locked = 0, synchronized = 1
                     WHERE id = ?1",
                    [transaction.parent_ggo_id],
                )
                .map_err(|e| VaultError::Internal(format!("Complete retire failed: {}", e)))?;
            }
        }
    }

    tx.execute(
        "UPDATE batches SET state = ?2 WHERE id = ?1",
        params![batch_id, BatchState::Completed.as_str()],
    )
    .map_err(|e| VaultError::Internal(format!("Finalize batch failed: {}", e)))?;

    let recipients = collect_recipients(&tx, batch_id)?;

    tx.commit()
        .map_err(|e| VaultError::Internal(format!("Commit failed: {}", e)))?;

    Ok(CommitOutcome {
        already_completed: false,
        recipients,
    })
}

fn collect_recipients(conn: &Connection, batch_id: i64) -> Result<Vec<(User, Certificate)>> {
    let transactions = get_batch_transactions(conn, batch_id)?;

    let retired: Vec<i64> = transactions
        .iter()
        .filter(|t| matches!(t.detail, TransactionDetail::Retire { .. }))
        .map(|t| t.parent_ggo_id)
        .collect();

    let mut recipients = Vec::new();
    for transaction in &transactions {
        if let TransactionDetail::Split { targets } = &transaction.detail {
            for target in targets {
                if retired.contains(&target.ggo_id) {
                    continue;
                }
                let cert = certificates::get_certificate(conn, target.ggo_id)?;
                let owner = users::get_user(conn, cert.user_id)?;
                recipients.push((owner, cert));
            }
        }
    }
    Ok(recipients)
}

/// Apply the DECLINED effects in reverse order and finalize the
/// batch. Children minted by the split are deleted and every touched
/// owner's certificate counter is rewound.
pub fn rollback_batch(conn: &mut Connection, batch_id: i64) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| VaultError::Internal(format!("Begin transaction failed: {}", e)))?;

    let batch = get_batch_tx(&tx, batch_id)?;
    if batch.state == BatchState::Declined {
        return Ok(());
    }
    if batch.state == BatchState::Completed {
        return Err(VaultError::Integrity(format!(
            "batch {} is COMPLETED and cannot roll back",
            batch_id
        )));
    }

    let transactions = get_batch_transactions(&tx, batch_id)?;
    for transaction in transactions.iter().rev() {
        match &transaction.detail {
            TransactionDetail::Retire { .. } => {
                tx.execute(
                    "UPDATE certificates SET stored = 1, retired = 0, locked = 0,
                         synchronized = 1, retire_gsrn = NULL, retire_address = NULL
                     WHERE id = ?1",
                    [transaction.parent_ggo_id],
                )
                .map_err(|e| VaultError::Internal(format!("Revert retire failed: {}", e)))?;
            }
            TransactionDetail::Split { targets } => {
                let mut owners: Vec<i64> = Vec::new();
                for target in targets {
                    let child = certificates::get_certificate(&tx, target.ggo_id)?;
                    if !owners.contains(&child.user_id) {
                        owners.push(child.user_id);
                    }
                    tx.execute("DELETE FROM certificates WHERE id = ?1", [target.ggo_id])
                        .map_err(|e| {
                            VaultError::Internal(format!("Delete split child failed: {}", e))
                        })?;
                }
                tx.execute(
                    "UPDATE certificates SET stored = 1, locked = 0, synchronized = 1
                     WHERE id = ?1",
                    [transaction.parent_ggo_id],
                )
                .map_err(|e| VaultError::Internal(format!("Restore parent failed: {}", e)))?;
                for owner in owners {
                    certificates::reclaim_certificate_indices(&tx, owner)?;
                }
            }
        }
    }

    tx.execute(
        "UPDATE batches SET state = ?2 WHERE id = ?1",
        params![batch_id, BatchState::Declined.as_str()],
    )
    .map_err(|e| VaultError::Internal(format!("Finalize rollback failed: {}", e)))?;

    tx.commit()
        .map_err(|e| VaultError::Internal(format!("Commit failed: {}", e)))?;

    Ok(())
}
