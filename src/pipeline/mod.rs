//! The submission pipeline: drives each batch from `PENDING` through
//! the ledger to `COMPLETED` or `DECLINED`.

pub mod backoff;
pub mod resubmitter;
pub mod worker;

pub use resubmitter::spawn_resubmitter;
pub use worker::{drive_batch, Pipeline, PipelineContext};
