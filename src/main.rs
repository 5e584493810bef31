//! Evidence Locker HTTP service.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use evidence_locker::catalog::EvidenceCatalog;
use evidence_locker::chain::ChainClient;
use evidence_locker::config::LockerConfig;
use evidence_locker::server::{run_server, AppState};
use evidence_locker::storage::BlobStore;
use evidence_locker::utils::{init_telemetry, StartupChecks};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    let _otel = init_telemetry("evidence-locker").context("failed to initialize telemetry")?;

    let config = LockerConfig::from_env().context("invalid configuration")?;
    StartupChecks::check_data_dir(&config.data_dir).await?;

    let ledger = evidence_locker::open_ledger(&config).await?;
    let chain = Arc::new(ChainClient::new(ledger, config.anchor.clone()));

    let catalog = EvidenceCatalog::new(config.catalog_path())
        .await
        .context("cannot open evidence catalog")?;
    let blobs = BlobStore::new(config.blob_dir())
        .await
        .context("cannot open blob store")?;

    info!(
        max_upload_bytes = config.max_upload_bytes,
        confirm_timeout = ?config.anchor.confirm_timeout,
        readback = config.anchor.readback,
        "Evidence locker configured"
    );

    let state = AppState {
        chain,
        catalog,
        blobs,
        max_upload_bytes: config.max_upload_bytes,
    };
    run_server(state, config.bind_addr).await
}
