//! Origin Vault - energy-origin certificate accounting core.
//!
//! Composes batches of certificate mutations (splits, transfers,
//! retirements), submits them to an external append-only ledger and
//! keeps a local relational mirror consistent with the ledger's
//! asynchronous, fallible confirmation.
//!
//! The moving parts:
//! - [`keys`]: deterministic per-user key schedule and addresses
//! - [`store`]: the local mirror and its invariants
//! - [`datahub`] / [`ledger`]: typed adapters over external services
//! - [`composer`]: intent validation and batch assembly
//! - [`pipeline`]: submit/poll/commit/rollback with retry and rescue
//! - [`events`]: milestone bus and webhook publication
//! - [`import`]: merge of issuer-granted certificates

pub mod composer;
pub mod config;
pub mod datahub;
pub mod events;
pub mod import;
pub mod keys;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod types;

pub use composer::{ComposeError, ComposeOutcome, Composer, RetireRequest, TransferRequest};
pub use types::{Result, VaultError};
