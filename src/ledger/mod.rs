//! Adapter for the external append-only certificate ledger.
//!
//! The pipeline depends only on the [`Ledger`] trait; the production
//! implementation speaks HTTP, tests plug in programmable mocks. The
//! wire batch is built and signed by [`batch`] from persisted state.

mod client;

pub mod batch;

pub use batch::{assemble_batch, LedgerBatchBuilder, RetirePart, SignedBatch, SplitPart};
pub use client::HttpLedgerClient;

use async_trait::async_trait;

use crate::types::{Result, VaultError};

/// Ledger-side state of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Committed,
    Invalid,
    Unknown,
    Pending,
}

impl BatchStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "COMMITTED" => Ok(BatchStatus::Committed),
            "INVALID" => Ok(BatchStatus::Invalid),
            "UNKNOWN" => Ok(BatchStatus::Unknown),
            "PENDING" => Ok(BatchStatus::Pending),
            other => Err(VaultError::Parse(format!(
                "unknown ledger status: {}",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a signed batch; the handle identifies it in later polls.
    ///
    /// `Connection` errors and rejection code 31 ("queue full") are
    /// transient; any other rejection is permanent.
    async fn submit_batch(&self, batch: &SignedBatch) -> Result<String>;

    async fn get_batch_status(&self, handle: &str) -> Result<BatchStatus>;
}
