//! Periodic rescue of stuck batches.
//!
//! A batch can linger in `PENDING` (process died before submit) or in
//! `SUBMITTED` (handle lost on the ledger side, poll budget spent).
//! The resubmitter discards any stale handle and re-enters the batch
//! at the Submit step; a fresh submission yields a fresh handle.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::store::batches;

use super::worker::Pipeline;

/// Run one rescue pass: reset every stuck batch and re-enqueue it.
pub async fn resubmit_stuck(pipeline: &Pipeline, older_than: chrono::Duration) -> crate::types::Result<usize> {
    let ctx = pipeline.context();
    let stuck = ctx
        .store
        .with_conn(|conn| batches::list_stuck(conn, Utc::now(), older_than))?;

    for batch in &stuck {
        warn!(
            batch_id = batch.id,
            state = %batch.state,
            "Resubmitting stuck batch"
        );
        ctx.store
            .with_conn(|conn| batches::reset_for_resubmit(conn, batch.id))?;
        pipeline.enqueue(batch.id).await?;
    }
    Ok(stuck.len())
}

/// Spawn the periodic job. `every` is the pass interval (hourly in
/// production), `older_than` the dormancy threshold.
pub fn spawn_resubmitter(
    pipeline: Pipeline,
    every: Duration,
    older_than: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The immediate first tick would race boot recovery.
        interval.tick().await;
        loop {
            interval.tick().await;
            match resubmit_stuck(&pipeline, older_than).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Resubmitter rescued batches"),
                Err(e) => error!(error = %e, "Resubmitter pass failed"),
            }
        }
    })
}
