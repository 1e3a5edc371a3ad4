//! Ledger address derivation from public keys.

use k256::ecdsa::VerifyingKey;
use sha2::{Digest, Sha256};

/// Address namespace length in hex characters.
const NAMESPACE_LEN: usize = 6;
/// Key digest length in hex characters.
const DIGEST_LEN: usize = 64;

/// Ledger namespaces. GGO addresses hold certificates; SETTLEMENT
/// addresses accumulate retirements against a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPrefix {
    Ggo,
    Settlement,
}

impl AddressPrefix {
    fn label(&self) -> &'static str {
        match self {
            AddressPrefix::Ggo => "GGO",
            AddressPrefix::Settlement => "SETTLEMENT",
        }
    }

    /// First six hex characters of the label's SHA-256.
    pub fn namespace(&self) -> String {
        let digest = Sha256::digest(self.label().as_bytes());
        hex::encode(digest)[..NAMESPACE_LEN].to_string()
    }
}

/// Derive the 70-character hex ledger address of a public key under
/// the given namespace. Pure: the same key always yields the same
/// address in any process.
pub fn generate_address(prefix: AddressPrefix, public_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(public_key.to_sec1_bytes());
    let mut address = prefix.namespace();
    address.push_str(&hex::encode(digest)[..DIGEST_LEN]);
    address
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[7u8; 32]).unwrap()
    }

    #[test]
    fn address_shape() {
        let key = test_key();
        let addr = generate_address(AddressPrefix::Ggo, key.verifying_key());
        assert_eq!(addr.len(), NAMESPACE_LEN + DIGEST_LEN);
        assert!(addr.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(addr.starts_with(&AddressPrefix::Ggo.namespace()));
    }

    #[test]
    fn namespaces_differ() {
        assert_ne!(
            AddressPrefix::Ggo.namespace(),
            AddressPrefix::Settlement.namespace()
        );
        let key = test_key();
        let ggo = generate_address(AddressPrefix::Ggo, key.verifying_key());
        let settlement = generate_address(AddressPrefix::Settlement, key.verifying_key());
        assert_ne!(ggo, settlement);
        assert_eq!(ggo[NAMESPACE_LEN..], settlement[NAMESPACE_LEN..]);
    }

    #[test]
    fn derivation_is_pure() {
        let key = test_key();
        let a = generate_address(AddressPrefix::Ggo, key.verifying_key());
        let b = generate_address(AddressPrefix::Ggo, key.verifying_key());
        assert_eq!(a, b);
    }
}
