//! Deterministic key schedule and ledger address derivation.
//!
//! Keys are never persisted. Every certificate, meter and measurement
//! key is re-derived on demand from the owner's master extended key
//! and the indices stored in the mirror, so any process holding the
//! master key reproduces identical addresses.

pub mod address;
pub mod schedule;

pub use address::{generate_address, AddressPrefix};
pub use schedule::{generate_master_key, KeySchedule};
