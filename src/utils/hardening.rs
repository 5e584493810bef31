//! Startup checks
//!
//! Run before the listener binds. Failures here stop the process instead of
//! surfacing later as a 500 on the first upload.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::RpcLedger;

pub struct StartupChecks;

impl StartupChecks {
    /// The data directory must exist and accept writes.
    pub async fn check_data_dir(dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create data directory {}", dir.display()))?;

        let scratch = dir.join(format!(".write-check-{}", Uuid::new_v4()));
        tokio::fs::write(&scratch, b"ok")
            .await
            .with_context(|| format!("data directory {} is not writable", dir.display()))?;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            warn!("Could not remove scratch file {}: {}", scratch.display(), e);
        }

        info!("Data directory ready: {}", dir.display());
        Ok(())
    }

    /// The node must answer. A configured chain id that differs from the
    /// node's is allowed but logged, since every signature will use it.
    pub async fn check_rpc(ledger: &RpcLedger, configured: Option<u64>) -> Result<()> {
        let chain_id = ledger.node_chain_id().await.context("ledger node is unreachable")?;
        if let Some(expected) = configured.filter(|c| *c != chain_id) {
            warn!(configured = expected, node = chain_id, "LOCKER_CHAIN_ID differs from the node's chain id");
        }
        info!(chain_id, signer = %ledger.signer_address(), "Ledger node reachable");
        Ok(())
    }
}
