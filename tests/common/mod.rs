//! Shared fixtures for the integration tests: an in-memory store,
//! programmable ledger/datahub mocks and entity seeding helpers.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use origin_vault::composer::Composer;
use origin_vault::datahub::{DataHub, IssuedCertificate, Measurement};
use origin_vault::events::{EventBus, EventPublisher};
use origin_vault::keys::{generate_master_key, KeySchedule};
use origin_vault::ledger::{BatchStatus, Ledger, SignedBatch};
use origin_vault::model::{Certificate, Meter, NewCertificate, NewUser, User};
use origin_vault::pipeline::PipelineContext;
use origin_vault::store::{certificates, meters, users, CertificateStore};
use origin_vault::types::Result;

// =============================================================================
// Mock ledger
// =============================================================================

/// Ledger double with programmable outcome queues. When a queue is
/// empty, submission succeeds with a fresh handle and polling reports
/// `COMMITTED`.
pub struct MockLedger {
    submit_outcomes: Mutex<VecDeque<Result<String>>>,
    status_outcomes: Mutex<VecDeque<Result<BatchStatus>>>,
    handle_counter: AtomicU64,
    /// Every envelope the pipeline submitted, in order.
    pub submissions: Mutex<Vec<SignedBatch>>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            submit_outcomes: Mutex::new(VecDeque::new()),
            status_outcomes: Mutex::new(VecDeque::new()),
            handle_counter: AtomicU64::new(0),
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn push_submit(&self, outcome: Result<String>) {
        self.submit_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn push_status(&self, outcome: Result<BatchStatus>) {
        self.status_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn submit_batch(&self, batch: &SignedBatch) -> Result<String> {
        self.submissions.lock().unwrap().push(batch.clone());
        match self.submit_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!(
                "handle-{}",
                self.handle_counter.fetch_add(1, Ordering::SeqCst)
            )),
        }
    }

    async fn get_batch_status(&self, _handle: &str) -> Result<BatchStatus> {
        match self.status_outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(BatchStatus::Committed),
        }
    }
}

// =============================================================================
// Mock datahub
// =============================================================================

pub struct MockDataHub {
    measurements: Mutex<HashMap<(String, i64), Measurement>>,
    issued: Mutex<HashMap<String, Vec<IssuedCertificate>>>,
}

impl MockDataHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            measurements: Mutex::new(HashMap::new()),
            issued: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_measurement(&self, measurement: Measurement) {
        self.measurements.lock().unwrap().insert(
            (measurement.gsrn.clone(), measurement.begin.timestamp()),
            measurement,
        );
    }

    pub fn add_issued(&self, certificate: IssuedCertificate) {
        self.issued
            .lock()
            .unwrap()
            .entry(certificate.gsrn.clone())
            .or_default()
            .push(certificate);
    }
}

#[async_trait]
impl DataHub for MockDataHub {
    async fn get_consumption(
        &self,
        _access_token: &str,
        gsrn: &str,
        begin: DateTime<Utc>,
    ) -> Result<Option<Measurement>> {
        Ok(self
            .measurements
            .lock()
            .unwrap()
            .get(&(gsrn.to_string(), begin.timestamp()))
            .cloned())
    }

    async fn get_issued_certificates(
        &self,
        _access_token: &str,
        gsrn: &str,
        begin_from: DateTime<Utc>,
        begin_to: DateTime<Utc>,
    ) -> Result<Vec<IssuedCertificate>> {
        Ok(self
            .issued
            .lock()
            .unwrap()
            .get(gsrn)
            .map(|list| {
                list.iter()
                    .filter(|c| c.begin >= begin_from && c.begin < begin_to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Environment
// =============================================================================

pub struct TestEnv {
    pub store: Arc<CertificateStore>,
    pub ledger: Arc<MockLedger>,
    pub datahub: Arc<MockDataHub>,
    pub bus: Arc<EventBus>,
    pub composer: Composer,
    pub ctx: Arc<PipelineContext>,
}

pub fn env() -> TestEnv {
    let store = Arc::new(CertificateStore::open_in_memory().unwrap());
    let ledger = MockLedger::new();
    let datahub = MockDataHub::new();
    let bus = Arc::new(EventBus::new());
    let publisher = Arc::new(EventPublisher::new(Arc::clone(&store), "Unknown").unwrap());

    let composer = Composer::new(
        Arc::clone(&store),
        datahub.clone() as Arc<dyn DataHub>,
        Arc::clone(&bus),
    );
    let ctx = Arc::new(PipelineContext {
        store: Arc::clone(&store),
        ledger: ledger.clone() as Arc<dyn Ledger>,
        publisher,
        bus: Arc::clone(&bus),
    });

    TestEnv {
        store,
        ledger,
        datahub,
        bus,
        composer,
        ctx,
    }
}

// =============================================================================
// Entity seeding
// =============================================================================

/// The production period every fixture certificate covers.
pub fn period_begin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn period_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap()
}

pub fn seed_user(store: &CertificateStore, subject: &str) -> User {
    store
        .with_conn(|conn| {
            users::create_user(
                conn,
                &NewUser {
                    subject: subject.into(),
                    master_extended_key: generate_master_key(),
                    access_token: Some(format!("token-{}", subject)),
                    refresh_token: Some(format!("refresh-{}", subject)),
                    token_expire: Some(Utc::now() + chrono::Duration::days(30)),
                },
            )
        })
        .unwrap()
}

pub fn seed_meter(store: &CertificateStore, user: &User, gsrn: &str, sector: &str) -> Meter {
    store
        .with_conn_mut(|conn| meters::create_meter(conn, user.id, gsrn, sector))
        .unwrap()
}

/// An issued certificate produced by `meter`, addressed through the
/// owner's key schedule so the pipeline can re-derive its key.
pub fn seed_issued_certificate(
    store: &CertificateStore,
    user: &User,
    meter: &Meter,
    amount: u64,
) -> Certificate {
    let address = KeySchedule::for_user(user)
        .unwrap()
        .measurement_address(meter.key_index, period_begin())
        .unwrap();
    store
        .with_conn(|conn| {
            certificates::create_certificate(
                conn,
                &NewCertificate {
                    user_id: user.id,
                    parent_id: None,
                    address,
                    key_index: None,
                    issue_time: period_begin(),
                    expire_time: Utc::now() + chrono::Duration::days(365),
                    begin: period_begin(),
                    end: period_end(),
                    amount,
                    sector: "DK1".into(),
                    technology_code: "T010101".into(),
                    fuel_code: "F01010101".into(),
                    issued: true,
                    stored: true,
                    retired: false,
                    synchronized: true,
                    locked: false,
                    issue_gsrn: Some(meter.gsrn.clone()),
                },
            )
        })
        .unwrap()
}

/// A consumption measurement at `gsrn` for the fixture period.
pub fn measurement(gsrn: &str, amount: u64) -> Measurement {
    Measurement {
        address: format!("meas-{}", gsrn),
        gsrn: gsrn.into(),
        begin: period_begin(),
        end: period_end(),
        sector: "DK1".into(),
        amount,
    }
}
