//! Subscription fan-out for "received" notifications.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

use crate::model::{Certificate, Subscription, User, WebhookEvent};
use crate::store::{subscriptions, technologies, CertificateStore};
use crate::types::Result;

use super::delivery::WebhookDeliverer;

/// The `ggo` object of a `GGO_RECEIVED` body.
#[derive(Debug, Clone, Serialize)]
pub struct GgoPayload {
    pub address: String,
    pub amount: u64,
    pub begin: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
    pub sector: String,
    pub technology: String,
    pub technology_code: String,
    pub fuel_code: String,
    pub issue_time: chrono::DateTime<chrono::Utc>,
    pub expire_time: chrono::DateTime<chrono::Utc>,
}

pub struct EventPublisher {
    store: Arc<CertificateStore>,
    deliverer: Arc<WebhookDeliverer>,
    unknown_technology_label: String,
}

impl EventPublisher {
    pub fn new(store: Arc<CertificateStore>, unknown_technology_label: &str) -> Result<Self> {
        Ok(Self {
            store,
            deliverer: Arc::new(WebhookDeliverer::new()?),
            unknown_technology_label: unknown_technology_label.to_string(),
        })
    }

    /// Announce a received certificate to every active subscription of
    /// the recipient. One independent delivery task per subscription;
    /// a permanently failing endpoint only logs.
    pub fn publish_ggo_received(
        &self,
        recipient: &User,
        certificate: &Certificate,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let payload = self.ggo_payload(certificate)?;
        let body = json!({ "sub": recipient.subject, "ggo": payload });
        self.publish(WebhookEvent::GgoReceived, &recipient.subject, &body)
    }

    /// Generic fan-out: resolve subscriptions for `(event, subject)`
    /// and schedule one delivery per endpoint.
    pub fn publish(
        &self,
        event: WebhookEvent,
        subject: &str,
        body: &serde_json::Value,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let subs = self
            .store
            .with_conn(|conn| subscriptions::list_for(conn, event, subject))?;
        debug!(
            event = %event,
            subject = %subject,
            endpoints = subs.len(),
            "Publishing event"
        );

        let bytes = serde_json::to_vec(body)?;
        let mut handles = Vec::with_capacity(subs.len());
        for subscription in subs {
            handles.push(self.spawn_delivery(subscription, bytes.clone()));
        }
        Ok(handles)
    }

    fn spawn_delivery(
        &self,
        subscription: Subscription,
        body: Vec<u8>,
    ) -> tokio::task::JoinHandle<()> {
        let deliverer = Arc::clone(&self.deliverer);
        tokio::spawn(async move {
            if let Err(e) = deliverer.deliver(&subscription, &body).await {
                error!(
                    url = %subscription.url,
                    error = %e,
                    "Webhook delivery abandoned"
                );
            }
        })
    }

    fn ggo_payload(&self, certificate: &Certificate) -> Result<GgoPayload> {
        let technology = self.store.with_conn(|conn| {
            technologies::resolve_label(
                conn,
                &certificate.technology_code,
                &certificate.fuel_code,
                &self.unknown_technology_label,
            )
        })?;
        Ok(GgoPayload {
            address: certificate.address.clone(),
            amount: certificate.amount,
            begin: certificate.begin,
            end: certificate.end,
            sector: certificate.sector.clone(),
            technology,
            technology_code: certificate.technology_code.clone(),
            fuel_code: certificate.fuel_code.clone(),
            issue_time: certificate.issue_time,
            expire_time: certificate.expire_time,
        })
    }
}
