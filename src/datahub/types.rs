//! Wire types shared with the upstream datahub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated statement of consumed Wh at a meter for one
/// period. `address` is the measurement's ledger address; retirements
/// against the measurement accumulate under its settlement address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub address: String,
    pub gsrn: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sector: String,
    pub amount: u64,
}

/// A certificate the upstream issuer granted for a production meter.
/// Its ledger address is not carried on the wire; the importer derives
/// it from the owner's key schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub gsrn: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub amount: u64,
    pub sector: String,
    pub technology_code: String,
    pub fuel_code: String,
    pub issue_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
}
