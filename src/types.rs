//! Shared result and error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Certificate not tradable: {0}")]
    NotTradable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Ledger rejected batch (code {code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Key derivation error: {0}")]
    Keys(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Transient failures are worth retrying on the pipeline's backoff
    /// schedule. Ledger code 31 means the validator queue is full and the
    /// batch should simply be resubmitted later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VaultError::Connection(_) | VaultError::Rejected { code: 31, .. }
        )
    }
}
