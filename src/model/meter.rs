//! Metering points registered under a user.

use serde::{Deserialize, Serialize};

/// A metering point (GSRN) owned by a user. `key_index` is the meter's
/// slot in the owner's key schedule and never changes once allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meter {
    pub id: i64,
    pub user_id: i64,
    pub gsrn: String,
    pub sector: String,
    pub key_index: u64,
}
