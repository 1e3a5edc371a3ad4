//! Configuration for the origin-vault daemon.
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;

use clap::Parser;

use crate::types::VaultError;

/// Origin Vault - energy-origin certificate accounting core
#[derive(Parser, Debug, Clone)]
#[command(name = "origin-vault")]
#[command(about = "Composes, submits and settles GGO batches against the origin ledger")]
pub struct Args {
    /// Path to the local mirror database
    #[arg(long, env = "DATABASE_PATH", default_value = "origin-vault.db")]
    pub database_path: PathBuf,

    /// Base URL of the certificate ledger
    #[arg(long, env = "LEDGER_URL", default_value = "http://localhost:8008")]
    pub ledger_url: String,

    /// Base URL of the upstream datahub (measurements, issued certificates)
    #[arg(long, env = "DATAHUB_URL", default_value = "http://localhost:8089")]
    pub datahub_url: String,

    /// Number of pipeline worker tasks
    #[arg(long, env = "PIPELINE_WORKERS", default_value = "4")]
    pub pipeline_workers: usize,

    /// Hours a batch may sit in PENDING/SUBMITTED before the
    /// resubmitter rescues it
    #[arg(long, env = "RESUBMIT_AFTER_HOURS", default_value = "6")]
    pub resubmit_after_hours: i64,

    /// Seconds before token expiry at which a refresh is due
    #[arg(long, env = "TOKEN_REFRESH_AT", default_value = "86400")]
    pub token_refresh_at: i64,

    /// Label for certificates whose technology/fuel pair is unmapped
    #[arg(long, env = "UNKNOWN_TECHNOLOGY_LABEL", default_value = "Unknown")]
    pub unknown_technology_label: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.pipeline_workers == 0 {
            return Err(VaultError::Config(
                "PIPELINE_WORKERS must be at least 1".into(),
            ));
        }
        if self.resubmit_after_hours <= 0 {
            return Err(VaultError::Config(
                "RESUBMIT_AFTER_HOURS must be positive".into(),
            ));
        }
        if self.token_refresh_at <= 0 {
            return Err(VaultError::Config("TOKEN_REFRESH_AT must be positive".into()));
        }
        for (name, url) in [("LEDGER_URL", &self.ledger_url), ("DATAHUB_URL", &self.datahub_url)] {
            reqwest::Url::parse(url)
                .map_err(|e| VaultError::Config(format!("{} is not a valid URL: {}", name, e)))?;
        }
        Ok(())
    }

    /// Dormancy threshold for the resubmitter.
    pub fn resubmit_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.resubmit_after_hours)
    }

    /// Window before expiry inside which a token refresh is due.
    pub fn token_refresh_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_at)
    }
}
