//! Hierarchical-deterministic key schedule rooted at a user's master
//! extended key.
//!
//! Child paths:
//! - `master / 0 / n` - traded certificate with key_index `n`
//! - `master / 1 / m` - meter with key_index `m`
//! - `master / 1 / m / t` - measurement at meter `m`, `t` = minutes
//!   since epoch of the measurement's begin
//!
//! An issued certificate is addressed by its producing measurement's
//! key; traded certificates are addressed by their own child key.

use std::str::FromStr;

use bip32::{ChildNumber, Prefix, XPrv};
use chrono::{DateTime, Timelike, Utc};
use rand::RngCore;

use crate::model::User;
use crate::types::{Result, VaultError};

use super::address::{generate_address, AddressPrefix};

// ============================================================================
// Derivation path constants
// ============================================================================

/// First-level child holding traded certificate keys.
const BRANCH_CERTIFICATE: u32 = 0;
/// First-level child holding meter keys.
const BRANCH_METER: u32 = 1;

/// Indices live in the non-hardened half of the BIP32 space.
const MAX_CHILD_INDEX: u64 = 0x7FFF_FFFF;

/// Generate a fresh random master extended key, serialized in the
/// standard `xprv` encoding. Used when registering a new user.
pub fn generate_master_key() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let root = XPrv::new(seed).expect("32-byte seed is always valid");
    root.to_string(Prefix::XPRV).to_string()
}

/// Per-user view of the key tree.
pub struct KeySchedule {
    root: XPrv,
}

impl KeySchedule {
    pub fn from_master(master_extended_key: &str) -> Result<Self> {
        let root = XPrv::from_str(master_extended_key)
            .map_err(|e| VaultError::Keys(format!("invalid master extended key: {}", e)))?;
        Ok(Self { root })
    }

    pub fn for_user(user: &User) -> Result<Self> {
        Self::from_master(&user.master_extended_key)
    }

    /// Key of the traded certificate with `key_index = index`.
    pub fn certificate_key(&self, index: u64) -> Result<XPrv> {
        let branch = self.child(&self.root, BRANCH_CERTIFICATE as u64)?;
        self.child(&branch, index)
    }

    /// Key of the meter with `key_index = index`.
    pub fn meter_key(&self, index: u64) -> Result<XPrv> {
        let branch = self.child(&self.root, BRANCH_METER as u64)?;
        self.child(&branch, index)
    }

    /// Key of the measurement at meter `meter_index` beginning at
    /// `begin`. Seconds and sub-seconds of `begin` are discarded.
    pub fn measurement_key(&self, meter_index: u64, begin: DateTime<Utc>) -> Result<XPrv> {
        let meter = self.meter_key(meter_index)?;
        self.child(&meter, minutes_since_epoch(begin)?)
    }

    /// GGO address of the traded certificate with `key_index = index`.
    pub fn certificate_address(&self, index: u64) -> Result<String> {
        let key = self.certificate_key(index)?;
        Ok(generate_address(
            AddressPrefix::Ggo,
            key.private_key().verifying_key(),
        ))
    }

    /// GGO address of the measurement-issued certificate at
    /// `(meter_index, begin)`.
    pub fn measurement_address(&self, meter_index: u64, begin: DateTime<Utc>) -> Result<String> {
        let key = self.measurement_key(meter_index, begin)?;
        Ok(generate_address(
            AddressPrefix::Ggo,
            key.private_key().verifying_key(),
        ))
    }

    /// SETTLEMENT address of the measurement at `(meter_index, begin)`,
    /// where retirements against that measurement accumulate.
    pub fn settlement_address(&self, meter_index: u64, begin: DateTime<Utc>) -> Result<String> {
        let key = self.measurement_key(meter_index, begin)?;
        Ok(generate_address(
            AddressPrefix::Settlement,
            key.private_key().verifying_key(),
        ))
    }

    /// The raw root key, used to sign batch envelopes.
    pub fn master_key(&self) -> &XPrv {
        &self.root
    }

    fn child(&self, parent: &XPrv, index: u64) -> Result<XPrv> {
        if index > MAX_CHILD_INDEX {
            return Err(VaultError::Keys(format!(
                "child index {} outside the derivable range",
                index
            )));
        }
        let number = ChildNumber::new(index as u32, false)
            .map_err(|e| VaultError::Keys(format!("invalid child number {}: {}", index, e)))?;
        parent
            .derive_child(number)
            .map_err(|e| VaultError::Keys(format!("derivation failed at {}: {}", index, e)))
    }
}

/// Whole minutes since the unix epoch of `begin`, seconds zeroed.
fn minutes_since_epoch(begin: DateTime<Utc>) -> Result<u64> {
    let zeroed = begin
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(|| VaultError::Keys(format!("unrepresentable begin: {}", begin)))?;
    let seconds = zeroed.timestamp();
    if seconds < 0 {
        return Err(VaultError::Keys(format!("begin before epoch: {}", begin)));
    }
    Ok(seconds as u64 / 60)
}
