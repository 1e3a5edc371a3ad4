//! Batches of ledger transactions and their state machine vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::VaultError;

use super::certificate::NewCertificate;

/// Lifecycle of a submitted batch.
///
/// `Pending` batches have optimistic effects applied locally but have
/// not reached the ledger. `Submitted` batches are awaiting ledger
/// confirmation under a handle. `Completed` and `Declined` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Pending,
    Submitted,
    Declined,
    Completed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Submitted => "SUBMITTED",
            BatchState::Declined => "DECLINED",
            BatchState::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, VaultError> {
        match s {
            "PENDING" => Ok(BatchState::Pending),
            "SUBMITTED" => Ok(BatchState::Submitted),
            "DECLINED" => Ok(BatchState::Declined),
            "COMPLETED" => Ok(BatchState::Completed),
            other => Err(VaultError::Parse(format!("unknown batch state: {}", other))),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, BatchState::Declined | BatchState::Completed)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub state: BatchState,
    /// Time of the most recent ledger submission.
    pub submitted: Option<DateTime<Utc>>,
    pub user_id: i64,
    /// Opaque ledger handle from the most recent submission.
    pub handle: Option<String>,
    pub poll_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Split,
    Retire,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Split => "split",
            TransactionKind::Retire => "retire",
        }
    }

    pub fn parse(s: &str) -> Result<Self, VaultError> {
        match s {
            "split" => Ok(TransactionKind::Split),
            "retire" => Ok(TransactionKind::Retire),
            other => Err(VaultError::Parse(format!(
                "unknown transaction kind: {}",
                other
            ))),
        }
    }
}

/// One child slot of a split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitTarget {
    pub id: i64,
    pub transaction_id: i64,
    pub ggo_id: i64,
    /// Opaque caller reference carried through to the recipient.
    pub reference: Option<String>,
}

/// Variant payload of a batch transaction.
#[derive(Debug, Clone)]
pub enum TransactionDetail {
    Split {
        targets: Vec<SplitTarget>,
    },
    Retire {
        begin: DateTime<Utc>,
        meter_id: i64,
        measurement_address: String,
    },
}

impl TransactionDetail {
    pub fn kind(&self) -> TransactionKind {
        match self {
            TransactionDetail::Split { .. } => TransactionKind::Split,
            TransactionDetail::Retire { .. } => TransactionKind::Retire,
        }
    }
}

/// A persisted batch transaction. `order` is the application order on
/// success; rollback walks transactions in reverse.
#[derive(Debug, Clone)]
pub struct BatchTransaction {
    pub id: i64,
    pub batch_id: i64,
    pub order: u32,
    /// The certificate this transaction consumes.
    pub parent_ggo_id: i64,
    pub detail: TransactionDetail,
}

// ============================================================================
// Composer output, not yet persisted
// ============================================================================

/// What a retire transaction consumes: the batch's parent certificate
/// itself (single full retire, no split) or one of the split children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireSubject {
    Parent,
    SplitChild(usize),
}

#[derive(Debug, Clone)]
pub struct ComposedTarget {
    pub certificate: NewCertificate,
    pub reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ComposedRetire {
    pub subject: RetireSubject,
    pub meter_id: i64,
    pub gsrn: String,
    pub begin: DateTime<Utc>,
    pub measurement_address: String,
}

/// A fully validated batch ready for transactional persistence. When
/// `split_targets` is empty the batch is a direct retire of the parent
/// and `retires` holds exactly one entry with `RetireSubject::Parent`.
#[derive(Debug, Clone)]
pub struct ComposedBatch {
    pub user_id: i64,
    pub parent_id: i64,
    pub split_targets: Vec<ComposedTarget>,
    pub retires: Vec<ComposedRetire>,
}

impl ComposedBatch {
    /// Transaction count once persisted.
    pub fn transaction_count(&self) -> usize {
        let split = if self.split_targets.is_empty() { 0 } else { 1 };
        split + self.retires.len()
    }
}
