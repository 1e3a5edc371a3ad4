//! Worker pool and the per-batch submit/poll/commit/rollback driver.
//!
//! Workers pull batch ids off a shared queue and run [`drive_batch`]
//! to completion. All durable state lives in the store, so a worker
//! dying mid-batch loses nothing: boot recovery and the resubmitter
//! re-enqueue anything left in `PENDING` or `SUBMITTED`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, EventPublisher, VaultEvent};
use crate::ledger::{self, BatchStatus, Ledger};
use crate::model::{Batch, BatchState};
use crate::store::{batches, CertificateStore};
use crate::types::{Result, VaultError};

use super::backoff;

/// Transient submit retries log quietly at first and loudly once the
/// outage looks real.
const NOISY_AFTER: u32 = 10;

/// Collaborators shared by every worker.
pub struct PipelineContext {
    pub store: Arc<CertificateStore>,
    pub ledger: Arc<dyn Ledger>,
    pub publisher: Arc<EventPublisher>,
    pub bus: Arc<EventBus>,
}

/// Handle to the running pool. Cloning shares the queue.
#[derive(Clone)]
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    job_tx: mpsc::Sender<i64>,
}

impl Pipeline {
    pub fn start(workers: usize, ctx: Arc<PipelineContext>) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<i64>(1024);
        let job_rx = Arc::new(Mutex::new(job_rx));

        info!("Starting pipeline with {} workers", workers);
        for worker in 0..workers {
            let ctx = Arc::clone(&ctx);
            let job_rx = Arc::clone(&job_rx);
            tokio::spawn(async move {
                worker_task(worker, ctx, job_rx).await;
            });
        }

        Self { ctx, job_tx }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Hand a batch to the pool.
    pub async fn enqueue(&self, batch_id: i64) -> Result<()> {
        self.job_tx
            .send(batch_id)
            .await
            .map_err(|_| VaultError::Internal("pipeline queue closed".into()))
    }

    /// Re-enqueue every batch the last run left unfinished.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.ctx.store.with_conn(batches::list_unfinished)?;
        let count = unfinished.len();
        for batch in unfinished {
            info!(batch_id = batch.id, state = %batch.state, "Recovering unfinished batch");
            self.enqueue(batch.id).await?;
        }
        Ok(count)
    }
}

async fn worker_task(worker: usize, ctx: Arc<PipelineContext>, job_rx: Arc<Mutex<mpsc::Receiver<i64>>>) {
    debug!(worker, "Pipeline worker started");
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            rx.recv().await
        };
        match job {
            Some(batch_id) => match drive_batch(&ctx, batch_id).await {
                Ok(state) => debug!(worker, batch_id, state = %state, "Batch settled"),
                Err(e) => error!(worker, batch_id, error = %e, "Batch task aborted"),
            },
            None => {
                debug!(worker, "Pipeline queue closed, worker exiting");
                break;
            }
        }
    }
}

/// Drive one batch as far as it can go. Returns the batch's state
/// when the task is done with it: final, or `SUBMITTED` when the poll
/// budget ran out and the resubmitter takes over.
pub async fn drive_batch(ctx: &PipelineContext, batch_id: i64) -> Result<BatchState> {
    loop {
        let batch = ctx.store.with_conn(|conn| batches::get_batch(conn, batch_id))?;
        match batch.state {
            BatchState::Pending => {
                if !submit(ctx, &batch).await? {
                    return Ok(BatchState::Declined);
                }
            }
            BatchState::Submitted => return poll(ctx, &batch).await,
            state => return Ok(state),
        }
    }
}

/// Submit step. Returns false when the batch was rolled back instead
/// of reaching `SUBMITTED`.
async fn submit(ctx: &PipelineContext, batch: &Batch) -> Result<bool> {
    let signed = ctx
        .store
        .with_conn(|conn| ledger::assemble_batch(conn, batch))?;

    let mut attempt: u32 = 0;
    loop {
        match ctx.ledger.submit_batch(&signed).await {
            Ok(handle) => {
                ctx.store
                    .with_conn(|conn| batches::mark_submitted(conn, batch.id, &handle, Utc::now()))?;
                info!(batch_id = batch.id, handle = %handle, "Batch submitted");
                ctx.bus.emit(VaultEvent::BatchSubmitted {
                    batch_id: batch.id,
                    handle,
                });
                return Ok(true);
            }
            Err(e) if e.is_transient() => {
                if attempt >= backoff::MAX_RETRIES {
                    error!(batch_id = batch.id, "Submit retry budget exhausted, declining");
                    rollback(ctx, batch.id).await?;
                    return Ok(false);
                }
                match &e {
                    // Queue-full is routine; resubmit quietly.
                    VaultError::Rejected { code: 31, .. } => {}
                    _ if attempt < NOISY_AFTER => {
                        warn!(batch_id = batch.id, attempt, error = %e, "Submit failed, retrying")
                    }
                    _ => {
                        error!(batch_id = batch.id, attempt, error = %e, "Submit still failing")
                    }
                }
                tokio::time::sleep(backoff::delay(attempt)).await;
                attempt += 1;
            }
            Err(VaultError::Rejected { code, message }) => {
                warn!(
                    batch_id = batch.id,
                    code, message = %message, "Ledger rejected batch, declining"
                );
                rollback(ctx, batch.id).await?;
                return Ok(false);
            }
            // Anything else is a programmer or operator problem.
            Err(e) => return Err(e),
        }
    }
}

/// Poll step. `UNKNOWN`/`PENDING` re-poll on the backoff schedule; a
/// batch that outlives the in-process budget stays `SUBMITTED` for
/// the resubmitter.
async fn poll(ctx: &PipelineContext, batch: &Batch) -> Result<BatchState> {
    let handle = batch.handle.clone().ok_or_else(|| {
        VaultError::Integrity(format!("batch {} is SUBMITTED without a handle", batch.id))
    })?;

    let mut attempt: u32 = 0;
    loop {
        match ctx.ledger.get_batch_status(&handle).await {
            Ok(BatchStatus::Committed) => {
                commit(ctx, batch.id).await?;
                return Ok(BatchState::Completed);
            }
            Ok(BatchStatus::Invalid) => {
                warn!(batch_id = batch.id, handle = %handle, "Ledger invalidated batch");
                rollback(ctx, batch.id).await?;
                return Ok(BatchState::Declined);
            }
            Ok(status @ (BatchStatus::Unknown | BatchStatus::Pending)) => {
                if attempt >= backoff::MAX_RETRIES {
                    warn!(
                        batch_id = batch.id,
                        handle = %handle,
                        "Poll budget exhausted, leaving batch for the resubmitter"
                    );
                    return Ok(BatchState::Submitted);
                }
                debug!(batch_id = batch.id, status = ?status, attempt, "Batch not settled yet");
                ctx.store
                    .with_conn(|conn| batches::increment_poll_count(conn, batch.id))?;
                tokio::time::sleep(backoff::delay(attempt)).await;
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                if attempt >= backoff::MAX_RETRIES {
                    error!(batch_id = batch.id, "Poll retry budget exhausted, declining");
                    rollback(ctx, batch.id).await?;
                    return Ok(BatchState::Declined);
                }
                warn!(batch_id = batch.id, attempt, error = %e, "Poll failed, retrying");
                tokio::time::sleep(backoff::delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply the COMPLETED effects and fan out "received" events. A
/// recommit after a double-accepted resubmission finds the flags
/// already set and publishes nothing.
async fn commit(ctx: &PipelineContext, batch_id: i64) -> Result<()> {
    let outcome = ctx
        .store
        .with_conn_mut(|conn| batches::commit_batch(conn, batch_id))?;

    if outcome.already_completed {
        debug!(batch_id, "Batch already completed, skipping events");
        return Ok(());
    }

    info!(batch_id, recipients = outcome.recipients.len(), "Batch completed");
    for (recipient, certificate) in &outcome.recipients {
        ctx.publisher.publish_ggo_received(recipient, certificate)?;
    }
    ctx.bus.emit(VaultEvent::BatchCompleted { batch_id });
    Ok(())
}

/// Roll back and decline, retrying transient store failures on the
/// shared schedule. Integrity errors surface immediately.
async fn rollback(ctx: &PipelineContext, batch_id: i64) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match ctx
            .store
            .with_conn_mut(|conn| batches::rollback_batch(conn, batch_id))
        {
            Ok(()) => {
                info!(batch_id, "Batch rolled back and declined");
                ctx.bus.emit(VaultEvent::BatchDeclined { batch_id });
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < backoff::MAX_RETRIES => {
                warn!(batch_id, attempt, error = %e, "Rollback failed, retrying");
                tokio::time::sleep(backoff::delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
