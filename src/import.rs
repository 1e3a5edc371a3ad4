//! Merge of issuer-granted certificates into the local mirror.
//!
//! The issuer is a data source: certificates it reports are inserted
//! as `issued, stored, synchronized` roots unless their address is
//! already mirrored. Addresses come from the owner's key schedule
//! (the producing measurement's key), never from the wire.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::datahub::DataHub;
use crate::events::{EventBus, EventPublisher, VaultEvent};
use crate::keys::KeySchedule;
use crate::model::{Certificate, NewCertificate, User};
use crate::store::{certificates, meters, CertificateStore};
use crate::types::{Result, VaultError};

pub struct CertificateImporter {
    store: Arc<CertificateStore>,
    datahub: Arc<dyn DataHub>,
    publisher: Arc<EventPublisher>,
    bus: Arc<EventBus>,
}

impl CertificateImporter {
    pub fn new(
        store: Arc<CertificateStore>,
        datahub: Arc<dyn DataHub>,
        publisher: Arc<EventPublisher>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            datahub,
            publisher,
            bus,
        }
    }

    /// Import issued certificates for every meter of `user` with a
    /// period begin inside `[begin_from, begin_to)`. Returns the newly
    /// mirrored rows; already-known addresses are skipped.
    pub async fn import_user(
        &self,
        user: &User,
        begin_from: DateTime<Utc>,
        begin_to: DateTime<Utc>,
    ) -> Result<Vec<Certificate>> {
        let token = user
            .access_token
            .clone()
            .ok_or_else(|| VaultError::Auth(format!("user {} has no access token", user.subject)))?;
        let schedule = KeySchedule::for_user(user)?;
        let user_meters = self
            .store
            .with_conn(|conn| meters::list_user_meters(conn, user.id))?;

        let mut added = Vec::new();
        for meter in &user_meters {
            let issued = self
                .datahub
                .get_issued_certificates(&token, &meter.gsrn, begin_from, begin_to)
                .await?;

            for cert in issued {
                if cert.amount == 0 {
                    warn!(gsrn = %meter.gsrn, begin = %cert.begin, "Skipping zero-amount certificate");
                    continue;
                }
                let address = schedule.measurement_address(meter.key_index, cert.begin)?;
                let exists = self
                    .store
                    .with_conn(|conn| certificates::get_by_address(conn, &address))?
                    .is_some();
                if exists {
                    continue;
                }

                let input = NewCertificate {
                    user_id: user.id,
                    parent_id: None,
                    address,
                    key_index: None,
                    issue_time: cert.issue_time,
                    expire_time: cert.expire_time,
                    begin: cert.begin,
                    end: cert.end,
                    amount: cert.amount,
                    sector: cert.sector,
                    technology_code: cert.technology_code,
                    fuel_code: cert.fuel_code,
                    issued: true,
                    stored: true,
                    retired: false,
                    synchronized: true,
                    locked: false,
                    issue_gsrn: Some(meter.gsrn.clone()),
                };
                let created = self
                    .store
                    .with_conn(|conn| certificates::create_certificate(conn, &input))?;
                self.publisher.publish_ggo_received(user, &created)?;
                added.push(created);
            }
        }

        if !added.is_empty() {
            info!(user = %user.subject, count = added.len(), "Imported certificates");
            self.bus.emit(VaultEvent::CertificatesImported {
                user_id: user.id,
                count: added.len(),
            });
        }
        Ok(added)
    }
}
