//! Webhook subscriptions and event kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::VaultError;

/// Kinds of notifications a subscriber can sign up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    GgoReceived,
    ForecastReceived,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::GgoReceived => "GGO_RECEIVED",
            WebhookEvent::ForecastReceived => "FORECAST_RECEIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, VaultError> {
        match s {
            "GGO_RECEIVED" => Ok(WebhookEvent::GgoReceived),
            "FORECAST_RECEIVED" => Ok(WebhookEvent::ForecastReceived),
            other => Err(VaultError::Parse(format!("unknown event kind: {}", other))),
        }
    }
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered webhook endpoint. `secret` signs delivery bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub event: WebhookEvent,
    /// Subject of the user whose events this subscription receives.
    pub subject: String,
    pub url: String,
    pub secret: String,
    pub created: DateTime<Utc>,
}
