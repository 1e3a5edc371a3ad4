//! Origin Vault daemon: runs the submission pipeline, the hourly
//! resubmitter and the token-refresh scan against the local mirror.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use origin_vault::{
    config::Args,
    datahub::{DataHub, HttpDataHubClient},
    events::{spawn_logging_listener, EventBus, EventPublisher},
    import::CertificateImporter,
    ledger::HttpLedgerClient,
    pipeline::{spawn_resubmitter, Pipeline, PipelineContext},
    store::{users, CertificateStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("origin_vault={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Origin Vault - certificate core");
    info!("======================================");
    info!("Database: {}", args.database_path.display());
    info!("Ledger: {}", args.ledger_url);
    info!("Datahub: {}", args.datahub_url);
    info!("Workers: {}", args.pipeline_workers);
    info!("Resubmit after: {}h", args.resubmit_after_hours);
    info!("======================================");

    let store = Arc::new(
        CertificateStore::open(&args.database_path).context("Failed to open certificate store")?,
    );
    let ledger =
        Arc::new(HttpLedgerClient::new(&args.ledger_url).context("Failed to build ledger client")?);
    let datahub: Arc<dyn DataHub> = Arc::new(
        HttpDataHubClient::new(&args.datahub_url).context("Failed to build datahub client")?,
    );
    let publisher = Arc::new(
        EventPublisher::new(Arc::clone(&store), &args.unknown_technology_label)
            .context("Failed to build event publisher")?,
    );

    let bus = Arc::new(EventBus::new());
    spawn_logging_listener(&bus);

    let pipeline = Pipeline::start(
        args.pipeline_workers,
        Arc::new(PipelineContext {
            store: Arc::clone(&store),
            ledger,
            publisher: Arc::clone(&publisher),
            bus: Arc::clone(&bus),
        }),
    );

    // Durability across restarts: anything the last run left in
    // PENDING/SUBMITTED goes straight back into the queue.
    let recovered = pipeline.recover().await.context("Boot recovery failed")?;
    if recovered > 0 {
        info!("Recovered {} unfinished batches", recovered);
    }

    spawn_resubmitter(
        pipeline.clone(),
        std::time::Duration::from_secs(3600),
        args.resubmit_threshold(),
    );

    spawn_token_refresh_scan(Arc::clone(&store), args.token_refresh_window());

    let importer = Arc::new(CertificateImporter::new(
        Arc::clone(&store),
        datahub,
        publisher,
        bus,
    ));
    spawn_import_scan(Arc::clone(&store), importer);

    info!("Origin Vault running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    Ok(())
}

/// Hourly pull of freshly issued certificates for every user,
/// covering the trailing thirty days. The merge skips addresses that
/// are already mirrored, so overlapping windows are harmless.
fn spawn_import_scan(
    store: Arc<CertificateStore>,
    importer: Arc<CertificateImporter>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let all = match store.with_conn(users::list_all) {
                Ok(all) => all,
                Err(e) => {
                    error!(error = %e, "Import scan failed to list users");
                    continue;
                }
            };
            let now = Utc::now();
            for user in all {
                if user.access_token.is_none() {
                    continue;
                }
                if let Err(e) = importer
                    .import_user(&user, now - chrono::Duration::days(30), now)
                    .await
                {
                    warn!(subject = %user.subject, error = %e, "Import failed");
                }
            }
        }
    })
}

/// Hourly scan flagging users whose upstream token expires inside the
/// refresh window. The OAuth exchange itself lives outside the core;
/// this surfaces who is due.
fn spawn_token_refresh_scan(
    store: Arc<CertificateStore>,
    window: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match store.with_conn(|conn| users::list_token_refresh_due(conn, Utc::now(), window)) {
                Ok(due) => {
                    for user in due {
                        warn!(subject = %user.subject, "Upstream token refresh due");
                    }
                }
                Err(e) => error!(error = %e, "Token refresh scan failed"),
            }
        }
    })
}
