//! HTTP implementation of the ledger adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::types::{Result, VaultError};

use super::{BatchStatus, Ledger, SignedBatch};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct SubmitResponse {
    handle: String,
}

#[derive(Deserialize)]
struct RejectResponse {
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

pub struct HttpLedgerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLedgerClient {
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

#[async_trait]
impl Ledger for HttpLedgerClient {
    async fn submit_batch(&self, batch: &SignedBatch) -> Result<String> {
        let url = format!("{}/batches", self.base_url);
        debug!(operations = batch.operations.len(), "Submitting ledger batch");

        let response = self
            .client
            .post(&url)
            .json(batch)
            .send()
            .await
            .map_err(|e| VaultError::Connection(format!("ledger submit failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .json::<SubmitResponse>()
                .await
                .map_err(|e| VaultError::Parse(format!("bad submit response: {}", e)))?;
            return Ok(body.handle);
        }
        if status.is_server_error() {
            return Err(VaultError::Connection(format!(
                "ledger submit returned {}",
                status
            )));
        }

        // Structured rejection. Code 31 stays transient even though
        // the connection itself succeeded.
        let reject = response
            .json::<RejectResponse>()
            .await
            .map_err(|e| VaultError::Parse(format!("bad rejection body: {}", e)))?;
        Err(VaultError::Rejected {
            code: reject.code,
            message: reject.message,
        })
    }

    async fn get_batch_status(&self, handle: &str) -> Result<BatchStatus> {
        let url = format!("{}/batch_status/{}", self.base_url, handle);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VaultError::Connection(format!("ledger status failed: {}", e)))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .json::<StatusResponse>()
                    .await
                    .map_err(|e| VaultError::Parse(format!("bad status response: {}", e)))?;
                BatchStatus::parse(&body.status)
            }
            // The ledger forgets handles it has not seen yet.
            StatusCode::NOT_FOUND => Ok(BatchStatus::Unknown),
            status if status.is_server_error() => Err(VaultError::Connection(format!(
                "ledger status returned {}",
                status
            ))),
            status => Err(VaultError::Internal(format!(
                "ledger status returned {}",
                status
            ))),
        }
    }
}
