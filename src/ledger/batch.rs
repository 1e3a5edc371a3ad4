//! Signed wire format for ledger batches.
//!
//! A batch envelope carries the signer's public key, the ordered
//! operations and an envelope signature over the canonical operation
//! JSON. Each operation is additionally signed by the key that
//! authorizes it: the source certificate key for a split, the
//! measurement key for a retire, and every retired part by its own
//! certificate key. Signatures are 64-byte secp256k1, hex encoded.

use bip32::XPrv;
use k256::ecdsa::{signature::Signer, Signature};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::keys::KeySchedule;
use crate::model::{Batch, Certificate, TransactionDetail};
use crate::store::{batches, certificates, meters, users};
use crate::types::{Result, VaultError};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSplitPart {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRetirePart {
    pub address: String,
    /// Part key's signature over `"{measurement}:{address}"`.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireOperation {
    Split {
        source: String,
        parts: Vec<WireSplitPart>,
    },
    Retire {
        settlement: String,
        measurement: String,
        parts: Vec<WireRetirePart>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOperation {
    pub operation: WireOperation,
    pub signature: String,
}

/// The envelope POSTed to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBatch {
    /// Hex compressed public key of the submitting user's master key.
    pub signer: String,
    pub operations: Vec<SignedOperation>,
    pub signature: String,
}

// ============================================================================
// Builder
// ============================================================================

/// A split child slot handed to the builder.
pub struct SplitPart {
    pub address: String,
    pub amount: u64,
}

/// A certificate consumed by a retire, with the key that proves
/// ownership.
pub struct RetirePart {
    pub address: String,
    pub key: XPrv,
}

fn sign(key: &XPrv, message: &[u8]) -> String {
    let signature: Signature = key.private_key().sign(message);
    hex::encode(signature.to_bytes())
}

fn canonical(value: &impl Serialize) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(VaultError::from)
}

pub struct LedgerBatchBuilder {
    signer: XPrv,
    operations: Vec<SignedOperation>,
}

impl LedgerBatchBuilder {
    pub fn build(signer: &XPrv) -> Self {
        Self {
            signer: signer.clone(),
            operations: Vec::new(),
        }
    }

    pub fn add_split(
        &mut self,
        source_address: &str,
        source_key: &XPrv,
        parts: Vec<SplitPart>,
    ) -> Result<&mut Self> {
        if parts.is_empty() {
            return Err(VaultError::Integrity("split with no parts".into()));
        }
        let operation = WireOperation::Split {
            source: source_address.to_string(),
            parts: parts
                .into_iter()
                .map(|p| WireSplitPart {
                    address: p.address,
                    amount: p.amount,
                })
                .collect(),
        };
        let signature = sign(source_key, &canonical(&operation)?);
        self.operations.push(SignedOperation {
            operation,
            signature,
        });
        Ok(self)
    }

    pub fn add_retire(
        &mut self,
        settlement_address: &str,
        measurement_address: &str,
        measurement_key: &XPrv,
        parts: Vec<RetirePart>,
    ) -> Result<&mut Self> {
        if parts.is_empty() {
            return Err(VaultError::Integrity("retire with no parts".into()));
        }
        let wire_parts = parts
            .into_iter()
            .map(|p| {
                let message = format!("{}:{}", measurement_address, p.address);
                WireRetirePart {
                    signature: sign(&p.key, message.as_bytes()),
                    address: p.address,
                }
            })
            .collect();
        let operation = WireOperation::Retire {
            settlement: settlement_address.to_string(),
            measurement: measurement_address.to_string(),
            parts: wire_parts,
        };
        let signature = sign(measurement_key, &canonical(&operation)?);
        self.operations.push(SignedOperation {
            operation,
            signature,
        });
        Ok(self)
    }

    pub fn finish(self) -> Result<SignedBatch> {
        if self.operations.is_empty() {
            return Err(VaultError::Integrity("batch with no operations".into()));
        }
        let signature = sign(&self.signer, &canonical(&self.operations)?);
        Ok(SignedBatch {
            signer: hex::encode(self.signer.private_key().verifying_key().to_sec1_bytes()),
            operations: self.operations,
            signature,
        })
    }
}

// ============================================================================
// Assembly from persisted state
// ============================================================================

/// The private key controlling a certificate's ledger address: the
/// producing measurement's key for an issued certificate, the owner's
/// certificate child key for a traded one.
fn certificate_key(
    conn: &Connection,
    schedule: &KeySchedule,
    certificate: &Certificate,
) -> Result<XPrv> {
    if certificate.issued {
        let gsrn = certificate.issue_gsrn.as_deref().ok_or_else(|| {
            VaultError::Integrity(format!(
                "issued certificate {} has no issue_gsrn",
                certificate.id
            ))
        })?;
        let meter = meters::get_user_meter(conn, certificate.user_id, gsrn)?;
        schedule.measurement_key(meter.key_index, certificate.begin)
    } else {
        let index = certificate.key_index.ok_or_else(|| {
            VaultError::Integrity(format!(
                "traded certificate {} has no key_index",
                certificate.id
            ))
        })?;
        schedule.certificate_key(index)
    }
}

/// Build and sign the wire batch for a persisted batch. Pure with
/// respect to the database: the same rows always serialise to the
/// same envelope, so a resubmission is byte-identical.
pub fn assemble_batch(conn: &Connection, batch: &Batch) -> Result<SignedBatch> {
    let user = users::get_user(conn, batch.user_id)?;
    let schedule = KeySchedule::for_user(&user)?;
    let transactions = batches::get_batch_transactions(conn, batch.id)?;

    let mut builder = LedgerBatchBuilder::build(schedule.master_key());

    for transaction in &transactions {
        let parent = certificates::get_certificate(conn, transaction.parent_ggo_id)?;
        match &transaction.detail {
            TransactionDetail::Split { targets } => {
                let source_key = certificate_key(conn, &schedule, &parent)?;
                let mut parts = Vec::with_capacity(targets.len());
                for target in targets {
                    let child = certificates::get_certificate(conn, target.ggo_id)?;
                    parts.push(SplitPart {
                        address: child.address,
                        amount: child.amount,
                    });
                }
                builder.add_split(&parent.address, &source_key, parts)?;
            }
            TransactionDetail::Retire {
                begin, meter_id, ..
            } => {
                let meter = meters::get_meter(conn, *meter_id)?;
                let settlement = schedule.settlement_address(meter.key_index, *begin)?;
                let measurement_address = schedule.measurement_address(meter.key_index, *begin)?;
                let measurement_key = schedule.measurement_key(meter.key_index, *begin)?;
                let part_key = certificate_key(conn, &schedule, &parent)?;
                builder.add_retire(
                    &settlement,
                    &measurement_address,
                    &measurement_key,
                    vec![RetirePart {
                        address: parent.address.clone(),
                        key: part_key,
                    }],
                )?;
            }
        }
    }

    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bip32::Prefix;

    fn key(seed: u8) -> XPrv {
        XPrv::new([seed; 32]).unwrap()
    }

    #[test]
    fn split_wire_shape() {
        let master = key(1);
        let mut builder = LedgerBatchBuilder::build(&master);
        builder
            .add_split(
                "aaaa00",
                &key(2),
                vec![
                    SplitPart {
                        address: "bbbb00".into(),
                        amount: 40,
                    },
                    SplitPart {
                        address: "cccc00".into(),
                        amount: 60,
                    },
                ],
            )
            .unwrap();
        let batch = builder.finish().unwrap();

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["operations"][0]["operation"]["op"], "split");
        assert_eq!(json["operations"][0]["operation"]["source"], "aaaa00");
        assert_eq!(
            json["operations"][0]["operation"]["parts"][1]["amount"],
            60
        );
        assert!(json["operations"][0]["signature"].as_str().unwrap().len() == 128);
        assert!(json["signature"].as_str().is_some());
        // Compressed SEC1 public key: 33 bytes, 66 hex chars.
        assert_eq!(json["signer"].as_str().unwrap().len(), 66);
    }

    #[test]
    fn retire_parts_carry_their_own_signatures() {
        let master = key(1);
        let mut builder = LedgerBatchBuilder::build(&master);
        builder
            .add_retire(
                "dddd00",
                "eeee00",
                &key(3),
                vec![RetirePart {
                    address: "ffff00".into(),
                    key: key(4),
                }],
            )
            .unwrap();
        let batch = builder.finish().unwrap();

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["operations"][0]["operation"]["op"], "retire");
        assert_eq!(json["operations"][0]["operation"]["settlement"], "dddd00");
        assert_eq!(json["operations"][0]["operation"]["measurement"], "eeee00");
        let part = &json["operations"][0]["operation"]["parts"][0];
        assert_eq!(part["address"], "ffff00");
        assert_eq!(part["signature"].as_str().unwrap().len(), 128);
    }

    #[test]
    fn signing_is_deterministic() {
        // RFC 6979 nonces: the same key and message always produce the
        // same signature, so resubmitted envelopes are byte-identical.
        let build = || {
            let mut b = LedgerBatchBuilder::build(&key(1));
            b.add_split(
                "aaaa00",
                &key(2),
                vec![SplitPart {
                    address: "bbbb00".into(),
                    amount: 100,
                }],
            )
            .unwrap();
            serde_json::to_vec(&b.finish().unwrap()).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn empty_batches_and_operations_are_rejected() {
        assert!(LedgerBatchBuilder::build(&key(1)).finish().is_err());
        let mut builder = LedgerBatchBuilder::build(&key(1));
        assert!(builder.add_split("aaaa00", &key(2), vec![]).is_err());
        assert!(builder.add_retire("dddd00", "eeee00", &key(3), vec![]).is_err());
    }

    #[test]
    fn master_key_string_survives_builder() {
        // Guard against the builder consuming or mutating the key.
        let master = key(9);
        let before = master.to_string(Prefix::XPRV).to_string();
        let _ = LedgerBatchBuilder::build(&master);
        assert_eq!(master.to_string(Prefix::XPRV).to_string(), before);
    }
}
