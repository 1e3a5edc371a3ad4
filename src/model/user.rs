//! Account holders and their upstream credentials.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An account holder. `master_extended_key` seeds the key schedule;
/// the token fields are opaque credentials for the upstream datahub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Stable identity from the auth layer, unique.
    pub subject: String,
    pub master_extended_key: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expire: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    /// True when the access token expires within `within` of `now`
    /// (or is missing entirely).
    pub fn token_needs_refresh(&self, now: DateTime<Utc>, within: Duration) -> bool {
        match self.token_expire {
            Some(expire) => expire - now <= within,
            None => true,
        }
    }
}

/// Insert payload for a new user row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub subject: String,
    pub master_extended_key: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expire: Option<DateTime<Utc>>,
}
