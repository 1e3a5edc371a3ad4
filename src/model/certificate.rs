//! Certificate (GGO) entity and lifecycle flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A guarantee-of-origin certificate mirrored from the ledger.
///
/// Certificates form a write-once split tree: issued certificates are
/// roots (`parent_id == None`, `issue_gsrn` set), traded certificates
/// are children produced by a split and addressed through the owner's
/// key schedule (`key_index` set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: i64,
    pub user_id: i64,
    pub parent_id: Option<i64>,
    /// Ledger address, unique across all users.
    pub address: String,
    /// Child index in the owner's key schedule. None for issued roots.
    pub key_index: Option<u64>,
    pub issue_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    /// Production period start, hour aligned.
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Amount in Wh, always positive.
    pub amount: u64,
    pub sector: String,
    pub technology_code: String,
    pub fuel_code: String,
    pub issued: bool,
    pub stored: bool,
    pub retired: bool,
    pub synchronized: bool,
    pub locked: bool,
    pub issue_gsrn: Option<String>,
    pub retire_gsrn: Option<String>,
    pub retire_address: Option<String>,
}

impl Certificate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_time
    }

    /// Stored, not retired, not locked, synchronized with the ledger
    /// and not past its expiry time.
    pub fn is_tradable(&self, now: DateTime<Utc>) -> bool {
        self.stored && !self.retired && !self.locked && self.synchronized && !self.is_expired(now)
    }
}

/// Insert payload for a new certificate row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCertificate {
    pub user_id: i64,
    pub parent_id: Option<i64>,
    pub address: String,
    pub key_index: Option<u64>,
    pub issue_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub amount: u64,
    pub sector: String,
    pub technology_code: String,
    pub fuel_code: String,
    pub issued: bool,
    pub stored: bool,
    pub retired: bool,
    pub synchronized: bool,
    pub locked: bool,
    pub issue_gsrn: Option<String>,
}

impl NewCertificate {
    /// Child minted by a split: inherits the parent's period and
    /// technology, starts locked and unsynchronized until the batch
    /// settles.
    pub fn child_of(parent: &Certificate, owner_id: i64, key_index: u64, address: String, amount: u64) -> Self {
        Self {
            user_id: owner_id,
            parent_id: Some(parent.id),
            address,
            key_index: Some(key_index),
            issue_time: parent.issue_time,
            expire_time: parent.expire_time,
            begin: parent.begin,
            end: parent.end,
            amount,
            sector: parent.sector.clone(),
            technology_code: parent.technology_code.clone(),
            fuel_code: parent.fuel_code.clone(),
            issued: false,
            stored: false,
            retired: false,
            synchronized: false,
            locked: true,
            issue_gsrn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cert(stored: bool, retired: bool, locked: bool, synchronized: bool) -> Certificate {
        Certificate {
            id: 1,
            user_id: 1,
            parent_id: None,
            address: "aabbcc".into(),
            key_index: None,
            issue_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            expire_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            begin: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            amount: 100,
            sector: "DK1".into(),
            technology_code: "T010101".into(),
            fuel_code: "F01010101".into(),
            issued: true,
            stored,
            retired,
            synchronized,
            locked,
            issue_gsrn: Some("571313000000000001".into()),
            retire_gsrn: None,
            retire_address: None,
        }
    }

    #[test]
    fn tradable_requires_all_predicates() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(cert(true, false, false, true).is_tradable(now));
        assert!(!cert(false, false, false, true).is_tradable(now));
        assert!(!cert(true, true, false, true).is_tradable(now));
        assert!(!cert(true, false, true, true).is_tradable(now));
        assert!(!cert(true, false, false, false).is_tradable(now));
    }

    #[test]
    fn expired_certificate_is_not_tradable() {
        let c = cert(true, false, false, true);
        let at_expiry = c.expire_time;
        let before = c.expire_time - chrono::Duration::hours(1);
        assert!(!c.is_tradable(at_expiry));
        assert!(c.is_tradable(before));
    }

    #[test]
    fn child_inherits_period_and_technology() {
        let parent = cert(true, false, false, true);
        let child = NewCertificate::child_of(&parent, 7, 3, "ddeeff".into(), 40);
        assert_eq!(child.begin, parent.begin);
        assert_eq!(child.end, parent.end);
        assert_eq!(child.sector, parent.sector);
        assert_eq!(child.technology_code, parent.technology_code);
        assert_eq!(child.fuel_code, parent.fuel_code);
        assert_eq!(child.parent_id, Some(parent.id));
        assert_eq!(child.key_index, Some(3));
        assert!(child.locked && !child.stored && !child.synchronized && !child.issued);
    }
}
