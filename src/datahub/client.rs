//! HTTP implementation of the datahub adapter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tracing::debug;

use crate::types::{Result, VaultError};

use super::{DataHub, IssuedCertificate, Measurement};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpDataHubClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDataHubClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VaultError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

/// Map a reqwest failure or an unexpected status to the error
/// taxonomy: network problems and 5xx are transient, the rest are not.
fn status_error(endpoint: &str, status: StatusCode) -> VaultError {
    if status.is_server_error() {
        VaultError::Connection(format!("datahub {} returned {}", endpoint, status))
    } else {
        VaultError::Internal(format!("datahub {} returned {}", endpoint, status))
    }
}

#[async_trait]
impl DataHub for HttpDataHubClient {
    async fn get_consumption(
        &self,
        access_token: &str,
        gsrn: &str,
        begin: DateTime<Utc>,
    ) -> Result<Option<Measurement>> {
        let url = format!("{}/measurements/consumed", self.base_url);
        debug!(gsrn = %gsrn, begin = %begin, "Fetching consumption measurement");

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("gsrn", gsrn), ("begin", &begin.to_rfc3339())])
            .send()
            .await
            .map_err(|e| VaultError::Connection(format!("datahub request failed: {}", e)))?;

        match response.status() {
            StatusCode::OK => {
                let measurement = response
                    .json::<Measurement>()
                    .await
                    .map_err(|e| VaultError::Parse(format!("bad measurement body: {}", e)))?;
                Ok(Some(measurement))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(status_error("measurements/consumed", status)),
        }
    }

    async fn get_issued_certificates(
        &self,
        access_token: &str,
        gsrn: &str,
        begin_from: DateTime<Utc>,
        begin_to: DateTime<Utc>,
    ) -> Result<Vec<IssuedCertificate>> {
        let url = format!("{}/certificates/issued", self.base_url);
        debug!(gsrn = %gsrn, from = %begin_from, to = %begin_to, "Fetching issued certificates");

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[
                ("gsrn", gsrn),
                ("begin_from", &begin_from.to_rfc3339()),
                ("begin_to", &begin_to.to_rfc3339()),
            ])
            .send()
            .await
            .map_err(|e| VaultError::Connection(format!("datahub request failed: {}", e)))?;

        match response.status() {
            StatusCode::OK => response
                .json::<Vec<IssuedCertificate>>()
                .await
                .map_err(|e| VaultError::Parse(format!("bad certificate list body: {}", e))),
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(status_error("certificates/issued", status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_normalized() {
        let client = HttpDataHubClient::new("https://datahub.example/api/").unwrap();
        assert_eq!(client.base_url, "https://datahub.example/api");
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(status_error("x", StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status_error("x", StatusCode::FORBIDDEN).is_transient());
    }
}
