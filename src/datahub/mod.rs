//! Typed view over the upstream datahub: consumption measurements and
//! issued certificates.
//!
//! The composer and importer depend only on the [`DataHub`] trait;
//! [`HttpDataHubClient`] is the production implementation, tests plug
//! in programmable mocks.

mod client;
mod types;

pub use client::HttpDataHubClient;
pub use types::{IssuedCertificate, Measurement};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::Result;

#[async_trait]
pub trait DataHub: Send + Sync {
    /// The consumption measurement at `(gsrn, begin)`, if the meter
    /// operator has published one. `None` is a valid answer, not an
    /// error.
    async fn get_consumption(
        &self,
        access_token: &str,
        gsrn: &str,
        begin: DateTime<Utc>,
    ) -> Result<Option<Measurement>>;

    /// Certificates the issuer has issued for `gsrn` with a period
    /// begin inside `[begin_from, begin_to)`.
    async fn get_issued_certificates(
        &self,
        access_token: &str,
        gsrn: &str,
        begin_from: DateTime<Utc>,
        begin_to: DateTime<Utc>,
    ) -> Result<Vec<IssuedCertificate>>;
}
