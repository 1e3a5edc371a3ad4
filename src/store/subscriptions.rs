//! Webhook subscription persistence.
//!
//! Subscriptions are read-only in the publication path; mutation
//! happens only through subscribe/unsubscribe.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::model::{Subscription, WebhookEvent};
use crate::types::{Result, VaultError};

use super::column_ts;

fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    let event_text: String = row.get("event")?;
    let event = WebhookEvent::parse(&event_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;
    Ok(Subscription {
        id: row.get("id")?,
        event,
        subject: row.get("subject")?,
        url: row.get("url")?,
        secret: row.get("secret")?,
        created: column_ts(row.get("created")?, "created")?,
    })
}

/// Register a webhook endpoint. `(event, subject, url)` is unique;
/// re-subscribing the same triple replaces the secret.
pub fn subscribe(
    conn: &Connection,
    event: WebhookEvent,
    subject: &str,
    url: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    conn.execute(
        "INSERT INTO webhook_subscriptions (event, subject, url, secret, created)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (event, subject, url) DO UPDATE SET secret = excluded.secret",
        params![event.as_str(), subject, url, secret, now.timestamp()],
    )
    .map_err(|e| VaultError::Internal(format!("Insert subscription failed: {}", e)))?;

    conn.query_row(
        "SELECT * FROM webhook_subscriptions WHERE event = ?1 AND subject = ?2 AND url = ?3",
        params![event.as_str(), subject, url],
        subscription_from_row,
    )
    .map_err(|e| VaultError::Internal(format!("Query subscription failed: {}", e)))
}

pub fn unsubscribe(
    conn: &Connection,
    event: WebhookEvent,
    subject: &str,
    url: &str,
) -> Result<bool> {
    let deleted = conn
        .execute(
            "DELETE FROM webhook_subscriptions WHERE event = ?1 AND subject = ?2 AND url = ?3",
            params![event.as_str(), subject, url],
        )
        .map_err(|e| VaultError::Internal(format!("Delete subscription failed: {}", e)))?;
    Ok(deleted > 0)
}

/// Active subscriptions for an `(event, subject)` pair, in creation
/// order. The publisher fans one delivery out per row.
pub fn list_for(conn: &Connection, event: WebhookEvent, subject: &str) -> Result<Vec<Subscription>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT * FROM webhook_subscriptions WHERE event = ?1 AND subject = ?2 ORDER BY id",
        )
        .map_err(|e| VaultError::Internal(format!("Prepare failed: {}", e)))?;
    let rows = stmt
        .query_map(params![event.as_str(), subject], subscription_from_row)
        .map_err(|e| VaultError::Internal(format!("Query subscriptions failed: {}", e)))?;

    let mut subscriptions = Vec::new();
    for row in rows {
        subscriptions.push(row.map_err(|e| VaultError::Internal(format!("Row error: {}", e)))?);
    }
    Ok(subscriptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CertificateStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn subscribe_and_list_scoped_to_event_and_subject() {
        let store = CertificateStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                subscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://a.example/hook",
                    "s1",
                    now(),
                )
                .unwrap();
                subscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://b.example/hook",
                    "s2",
                    now(),
                )
                .unwrap();
                subscribe(
                    conn,
                    WebhookEvent::ForecastReceived,
                    "sub-a",
                    "https://a.example/hook",
                    "s3",
                    now(),
                )
                .unwrap();

                let ggo = list_for(conn, WebhookEvent::GgoReceived, "sub-a").unwrap();
                assert_eq!(ggo.len(), 2);
                assert!(list_for(conn, WebhookEvent::GgoReceived, "sub-b")
                    .unwrap()
                    .is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn resubscribe_replaces_secret() {
        let store = CertificateStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                subscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://a.example/hook",
                    "old",
                    now(),
                )
                .unwrap();
                let replaced = subscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://a.example/hook",
                    "new",
                    now(),
                )
                .unwrap();
                assert_eq!(replaced.secret, "new");
                assert_eq!(
                    list_for(conn, WebhookEvent::GgoReceived, "sub-a")
                        .unwrap()
                        .len(),
                    1
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn unsubscribe_removes_exactly_one_endpoint() {
        let store = CertificateStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                subscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://a.example/hook",
                    "s1",
                    now(),
                )
                .unwrap();
                assert!(unsubscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://a.example/hook"
                )
                .unwrap());
                assert!(!unsubscribe(
                    conn,
                    WebhookEvent::GgoReceived,
                    "sub-a",
                    "https://a.example/hook"
                )
                .unwrap());
                Ok(())
            })
            .unwrap();
    }
}
