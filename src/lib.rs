//! Evidence Locker
//!
//! Fingerprints uploaded evidence files, anchors the digest on an
//! append-only ledger, and verifies stored evidence against it later.
//! - SHA-256 file digests, computed while the upload streams in
//! - EVM contract or local JSON-lines ledger backends
//! - SQLite evidence catalog and on-disk blob store
//! - HTTP service (`server`) and audit CLI (`locker-audit`)

pub mod catalog;
pub mod chain;
pub mod config;
pub mod digest;
pub mod ledger;
pub mod server;
pub mod storage;
pub mod utils;
pub mod verify;

// Re-exports for convenience
pub use chain::{AnchorOutcome, AnchorPolicy, ChainClient};
pub use config::{LedgerConfig, LockerConfig};
pub use digest::{digest_bytes, FileDigest};
pub use ledger::{EvidenceKey, Ledger, LocalLedger, RpcLedger};
pub use server::{build_router, AppState};
pub use verify::{VerificationReport, VerificationStatus};

use std::sync::Arc;

/// Construct the configured ledger backend. RPC backends are checked once so
/// a dead node fails startup rather than the first upload.
pub async fn open_ledger(config: &LockerConfig) -> anyhow::Result<Arc<dyn Ledger>> {
    use anyhow::Context;

    match &config.ledger {
        LedgerConfig::Local { path } => {
            let ledger = LocalLedger::open(path)
                .await
                .with_context(|| format!("cannot open local ledger at {}", path.display()))?;
            tracing::info!(path = %path.display(), records = ledger.len().await, "Using local ledger");
            Ok(Arc::new(ledger))
        }
        LedgerConfig::Rpc { rpc, credential } => {
            let configured_chain = rpc.chain_id;
            let ledger = RpcLedger::new(rpc.clone(), credential.clone())?;
            utils::StartupChecks::check_rpc(&ledger, configured_chain).await?;
            Ok(Arc::new(ledger))
        }
    }
}
