//! Store durability and importer-merge integration tests.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use common::*;

use origin_vault::datahub::{DataHub, IssuedCertificate};
use origin_vault::events::VaultEvent;
use origin_vault::import::CertificateImporter;
use origin_vault::keys::KeySchedule;
use origin_vault::store::{certificates, meters, users, CertificateStore};

// =============================================================================
// Durability across reopen
// =============================================================================

#[test]
fn test_mirror_survives_a_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("vault.db");

    let (user_id, cert_address) = {
        let store = CertificateStore::open(&path).unwrap();
        let user = seed_user(&store, "owner");
        let meter = seed_meter(&store, &user, "gsrn-prod", "DK1");
        let cert = seed_issued_certificate(&store, &user, &meter, 100);
        (user.id, cert.address)
    };

    let store = CertificateStore::open(&path).unwrap();
    let user = store
        .with_conn(|conn| users::get_user_by_subject(conn, "owner"))
        .unwrap();
    assert_eq!(user.id, user_id);

    let cert = store
        .with_conn(|conn| certificates::get_by_address(conn, &cert_address))
        .unwrap()
        .expect("certificate lost across reopen");
    assert_eq!(cert.amount, 100);
    assert!(cert.issued && cert.stored && cert.synchronized);

    // Allocators continue where the previous process stopped.
    let meter = store
        .with_conn_mut(|conn| meters::create_meter(conn, user.id, "gsrn-extra", "DK1"))
        .unwrap();
    assert_eq!(meter.key_index, 1);
    let index = store
        .with_conn(|conn| certificates::next_certificate_index(conn, user.id))
        .unwrap();
    assert_eq!(index, 0);
}

// =============================================================================
// Importer merge
// =============================================================================

fn issued(gsrn: &str, begin: chrono::DateTime<Utc>, amount: u64) -> IssuedCertificate {
    IssuedCertificate {
        gsrn: gsrn.into(),
        begin,
        end: begin + chrono::Duration::hours(1),
        amount,
        sector: "DK1".into(),
        technology_code: "T010101".into(),
        fuel_code: "F01010101".into(),
        issue_time: begin,
        expire_time: Utc::now() + chrono::Duration::days(365),
    }
}

#[tokio::test]
async fn test_import_mirrors_new_certificates_once() {
    let env = env();
    let mut events = env.bus.subscribe();
    let owner = seed_user(&env.store, "owner");
    let meter = seed_meter(&env.store, &owner, "gsrn-prod", "DK1");

    let in_range = period_begin();
    let out_of_range = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    env.datahub.add_issued(issued("gsrn-prod", in_range, 100));
    // Zero-amount grants are noise and never mirrored.
    env.datahub
        .add_issued(issued("gsrn-prod", period_end(), 0));
    env.datahub.add_issued(issued("gsrn-prod", out_of_range, 50));

    let importer = CertificateImporter::new(
        Arc::clone(&env.store),
        Arc::clone(&env.datahub) as Arc<dyn DataHub>,
        Arc::clone(&env.ctx.publisher),
        Arc::clone(&env.bus),
    );

    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let added = importer.import_user(&owner, from, to).await.unwrap();
    assert_eq!(added.len(), 1);

    // Addresses come from the schedule, not the wire.
    let expected = KeySchedule::for_user(&owner)
        .unwrap()
        .measurement_address(meter.key_index, in_range)
        .unwrap();
    assert_eq!(added[0].address, expected);
    assert!(added[0].issued && added[0].stored && added[0].synchronized);
    assert!(!added[0].locked && !added[0].retired);
    assert_eq!(added[0].issue_gsrn.as_deref(), Some("gsrn-prod"));

    match events.try_recv().unwrap() {
        VaultEvent::CertificatesImported { user_id, count } => {
            assert_eq!((user_id, count), (owner.id, 1));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // The same window again: everything is already mirrored.
    let again = importer.import_user(&owner, from, to).await.unwrap();
    assert!(again.is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_imported_certificate_is_immediately_composable() {
    let env = env();
    let owner = seed_user(&env.store, "owner");
    seed_user(&env.store, "recipient");
    seed_meter(&env.store, &owner, "gsrn-prod", "DK1");
    env.datahub
        .add_issued(issued("gsrn-prod", period_begin(), 80));

    let importer = CertificateImporter::new(
        Arc::clone(&env.store),
        Arc::clone(&env.datahub) as Arc<dyn DataHub>,
        Arc::clone(&env.ctx.publisher),
        Arc::clone(&env.bus),
    );
    let added = importer
        .import_user(
            &owner,
            period_begin() - chrono::Duration::days(1),
            period_begin() + chrono::Duration::days(1),
        )
        .await
        .unwrap();

    // The freshly mirrored root passes the tradability gate and the
    // pipeline can re-derive its signing key from the meter.
    let outcome = env
        .composer
        .compose(
            &owner,
            &added[0].address,
            &[origin_vault::composer::TransferRequest {
                subject: "recipient".into(),
                amount: 80,
                reference: None,
            }],
            &[],
        )
        .await
        .unwrap();
    let state = origin_vault::pipeline::drive_batch(&env.ctx, outcome.batch.id)
        .await
        .unwrap();
    assert_eq!(state, origin_vault::model::BatchState::Completed);
}
