//! Validates a transfer/retire intent and assembles a `PENDING` batch
//! with its optimistic mirror effects.
//!
//! The composer performs no retries: every failure is surfaced to the
//! caller verbatim. Once it returns success the batch belongs to the
//! submission pipeline and will either complete or decline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::datahub::DataHub;
use crate::events::{EventBus, VaultEvent};
use crate::keys::KeySchedule;
use crate::model::{
    Batch, Certificate, ComposedBatch, ComposedRetire, ComposedTarget, NewCertificate,
    RetireSubject, User,
};
use crate::store::{batches, certificates, meters, users, CertificateStore};
use crate::types::VaultError;

/// One transfer leg of an intent.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Subject of the recipient user.
    pub subject: String,
    pub amount: u64,
    /// Opaque reference carried through to the recipient.
    pub reference: Option<String>,
}

/// One retire leg of an intent. The meter must belong to the
/// composing user.
#[derive(Debug, Clone)]
pub struct RetireRequest {
    pub gsrn: String,
    pub amount: u64,
}

/// Intent failures, surfaced synchronously and verbatim.
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Nothing to compose: requested amount is zero")]
    Empty,

    #[error("Requested {requested} Wh exceeds the {available} Wh available")]
    AmountUnavailable { requested: u64, available: u64 },

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("Unknown meter: {0}")]
    UnknownMeter(String),

    #[error("No consumption measurement for meter {gsrn} at {begin}")]
    RetireMeasurementUnavailable {
        gsrn: String,
        begin: DateTime<Utc>,
    },

    #[error("Measurement for meter {gsrn} does not match the certificate: {reason}")]
    RetireMeasurementInvalid { gsrn: String, reason: String },

    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("Certificate not tradable: {0}")]
    CertificateNotTradable(String),

    #[error(transparent)]
    Internal(#[from] VaultError),
}

/// A successfully composed batch plus the `(recipient, certificate)`
/// pairs the publisher will announce once the batch completes.
#[derive(Debug)]
pub struct ComposeOutcome {
    pub batch: Batch,
    pub recipients: Vec<(User, Certificate)>,
}

/// A retire leg after measurement validation and clamping.
struct ClampedRetire {
    meter_id: i64,
    gsrn: String,
    begin: DateTime<Utc>,
    measurement_address: String,
    amount: u64,
}

pub struct Composer {
    store: Arc<CertificateStore>,
    datahub: Arc<dyn DataHub>,
    bus: Arc<EventBus>,
}

impl Composer {
    pub fn new(store: Arc<CertificateStore>, datahub: Arc<dyn DataHub>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            datahub,
            bus,
        }
    }

    /// Compose a batch consuming the tradable certificate at
    /// `parent_address`. On success the batch is persisted in
    /// `PENDING` with its optimistic effects applied.
    pub async fn compose(
        &self,
        user: &User,
        parent_address: &str,
        transfers: &[TransferRequest],
        retires: &[RetireRequest],
    ) -> Result<ComposeOutcome, ComposeError> {
        let now = Utc::now();

        let parent = self
            .store
            .with_conn(|conn| certificates::load_tradable(conn, user, parent_address, now))
            .map_err(|e| match e {
                VaultError::NotFound(msg) => ComposeError::CertificateNotFound(msg),
                VaultError::NotTradable(msg) => ComposeError::CertificateNotTradable(msg),
                other => ComposeError::Internal(other),
            })?;

        let clamped = self.clamp_retires(user, &parent, retires).await?;

        let transfer_total: u64 = transfers.iter().map(|t| t.amount).sum();
        let retire_total: u64 = clamped.iter().map(|r| r.amount).sum();
        let total = transfer_total + retire_total;

        if total == 0 {
            return Err(ComposeError::Empty);
        }
        if total > parent.amount {
            return Err(ComposeError::AmountUnavailable {
                requested: total,
                available: parent.amount,
            });
        }
        let remainder = parent.amount - total;

        // A single retire that consumes the whole parent needs no
        // split; the parent itself becomes the retired certificate.
        if transfers.is_empty() && clamped.len() == 1 && remainder == 0 {
            let retire = &clamped[0];
            let composed = ComposedBatch {
                user_id: user.id,
                parent_id: parent.id,
                split_targets: Vec::new(),
                retires: vec![ComposedRetire {
                    subject: RetireSubject::Parent,
                    meter_id: retire.meter_id,
                    gsrn: retire.gsrn.clone(),
                    begin: retire.begin,
                    measurement_address: retire.measurement_address.clone(),
                }],
            };
            let (batch, _) = self
                .store
                .with_conn_mut(|conn| batches::create_batch(conn, &composed, now))?;
            info!(batch_id = batch.id, parent = %parent.address, "Composed direct retire");
            self.bus.emit(VaultEvent::BatchComposed {
                batch_id: batch.id,
                user_id: user.id,
            });
            return Ok(ComposeOutcome {
                batch,
                recipients: Vec::new(),
            });
        }

        // Resolve recipients before allocating anything.
        let mut recipient_users = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            let recipient = self
                .store
                .with_conn(|conn| users::get_user_by_subject(conn, &transfer.subject))
                .map_err(|e| match e {
                    VaultError::NotFound(_) => {
                        ComposeError::UnknownRecipient(transfer.subject.clone())
                    }
                    other => ComposeError::Internal(other),
                })?;
            recipient_users.push(recipient);
        }

        let user_id = user.id;
        let transfer_count = transfers.len();
        let retire_count = clamped.len();
        let parent_for_mint = parent.clone();
        let transfer_legs: Vec<(User, u64, Option<String>)> = recipient_users
            .iter()
            .cloned()
            .zip(transfers.iter())
            .map(|(r, t)| (r, t.amount, t.reference.clone()))
            .collect();
        let owner = user.clone();

        // Index allocation and batch creation share one transaction:
        // a failed create must not consume indices from the owners'
        // sequences.
        let (batch, children) = self.store.with_conn_mut(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| VaultError::Internal(format!("Begin transaction failed: {}", e)))?;

            let mut split_targets = Vec::new();
            let mut composed_retires = Vec::new();

            for (recipient, amount, reference) in &transfer_legs {
                split_targets.push(ComposedTarget {
                    certificate: mint_child(&tx, &parent_for_mint, recipient, *amount)?,
                    reference: reference.clone(),
                });
            }

            for retire in &clamped {
                let position = split_targets.len();
                split_targets.push(ComposedTarget {
                    certificate: mint_child(&tx, &parent_for_mint, &owner, retire.amount)?,
                    reference: None,
                });
                composed_retires.push(ComposedRetire {
                    subject: RetireSubject::SplitChild(position),
                    meter_id: retire.meter_id,
                    gsrn: retire.gsrn.clone(),
                    begin: retire.begin,
                    measurement_address: retire.measurement_address.clone(),
                });
            }

            if remainder > 0 {
                split_targets.push(ComposedTarget {
                    certificate: mint_child(&tx, &parent_for_mint, &owner, remainder)?,
                    reference: None,
                });
            }

            let composed = ComposedBatch {
                user_id,
                parent_id: parent_for_mint.id,
                split_targets,
                retires: composed_retires,
            };
            let created = batches::create_batch_in(&tx, &composed, now)?;
            tx.commit()
                .map_err(|e| VaultError::Internal(format!("Commit failed: {}", e)))?;
            Ok(created)
        })?;

        // Pair each non-retired child with its owner for publication.
        // Children come back in split-target order: transfers first,
        // then retire children, then the optional remainder.
        let mut recipients = Vec::new();
        for (position, child) in children.iter().enumerate() {
            if position < transfer_count {
                recipients.push((recipient_users[position].clone(), child.clone()));
            } else if position >= transfer_count + retire_count {
                recipients.push((user.clone(), child.clone()));
            }
        }

        info!(
            batch_id = batch.id,
            parent = %parent.address,
            transactions = 1 + retire_count,
            "Composed batch"
        );
        self.bus.emit(VaultEvent::BatchComposed {
            batch_id: batch.id,
            user_id: user.id,
        });

        Ok(ComposeOutcome { batch, recipients })
    }

    /// Validate every retire leg against its measurement and clamp to
    /// the unretired remainder. A leg that clamps to zero is dropped.
    async fn clamp_retires(
        &self,
        user: &User,
        parent: &Certificate,
        retires: &[RetireRequest],
    ) -> Result<Vec<ClampedRetire>, ComposeError> {
        if retires.is_empty() {
            return Ok(Vec::new());
        }
        let token = user
            .access_token
            .clone()
            .ok_or_else(|| VaultError::Auth(format!("user {} has no access token", user.subject)))?;

        let mut clamped = Vec::with_capacity(retires.len());
        // Amounts granted to earlier legs of this intent, per
        // measurement address. Two legs against the same measurement
        // share its unretired remainder.
        let mut granted: HashMap<String, u64> = HashMap::new();
        for retire in retires {
            let meter = self
                .store
                .with_conn(|conn| meters::get_user_meter(conn, user.id, &retire.gsrn))
                .map_err(|e| match e {
                    VaultError::NotFound(_) => ComposeError::UnknownMeter(retire.gsrn.clone()),
                    other => ComposeError::Internal(other),
                })?;

            let measurement = self
                .datahub
                .get_consumption(&token, &retire.gsrn, parent.begin)
                .await?
                .ok_or_else(|| ComposeError::RetireMeasurementUnavailable {
                    gsrn: retire.gsrn.clone(),
                    begin: parent.begin,
                })?;

            if measurement.sector != parent.sector {
                return Err(ComposeError::RetireMeasurementInvalid {
                    gsrn: retire.gsrn.clone(),
                    reason: format!(
                        "sector {} != certificate sector {}",
                        measurement.sector, parent.sector
                    ),
                });
            }
            if measurement.begin != parent.begin {
                return Err(ComposeError::RetireMeasurementInvalid {
                    gsrn: retire.gsrn.clone(),
                    reason: format!(
                        "begin {} != certificate begin {}",
                        measurement.begin, parent.begin
                    ),
                });
            }

            let already = self
                .store
                .with_conn(|conn| certificates::retired_amount(conn, &measurement.address))?;
            let held = granted.get(&measurement.address).copied().unwrap_or(0);
            let amount = retire
                .amount
                .min(measurement.amount.saturating_sub(already).saturating_sub(held));
            if amount == 0 {
                // Measurement is fully covered; the leg is dropped.
                debug!(gsrn = %retire.gsrn, "Retire clamps to zero, dropping");
                continue;
            }
            *granted.entry(measurement.address.clone()).or_insert(0) += amount;

            clamped.push(ClampedRetire {
                meter_id: meter.id,
                gsrn: retire.gsrn.clone(),
                begin: measurement.begin,
                measurement_address: measurement.address,
                amount,
            });
        }
        Ok(clamped)
    }
}

/// Mint one split child for `owner`: allocate the next index from the
/// owner's sequence and derive its address from the owner's schedule.
fn mint_child(
    conn: &rusqlite::Connection,
    parent: &Certificate,
    owner: &User,
    amount: u64,
) -> crate::types::Result<NewCertificate> {
    let index = certificates::next_certificate_index(conn, owner.id)?;
    let address = KeySchedule::for_user(owner)?.certificate_address(index)?;
    Ok(NewCertificate::child_of(parent, owner.id, index, address, amount))
}
