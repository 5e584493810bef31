//! Local append-only ledger.
//!
//! Used when no chain endpoint is configured. Entries are JSON lines in a
//! single file that is only ever appended to; writes are confirmed as soon
//! as the line is flushed.

use alloy_primitives::{keccak256, TxHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    AnchorReceipt, AnchorRequest, EvidenceKey, Ledger, LedgerError, LedgerRecord, PendingAnchor,
    ReceiptStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalEntry {
    seq: u64,
    key: String,
    hash: String,
    uploader_role: String,
    timestamp: u64,
    tx_hash: TxHash,
    recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct LocalState {
    entries: Vec<LocalEntry>,
    by_key: HashMap<String, usize>,
    by_tx: HashMap<TxHash, usize>,
}

impl LocalState {
    fn push(&mut self, entry: LocalEntry) {
        let idx = self.entries.len();
        self.by_key.insert(entry.key.clone(), idx);
        self.by_tx.insert(entry.tx_hash, idx);
        self.entries.push(entry);
    }
}

pub struct LocalLedger {
    path: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalLedger {
    /// A ledger that lives only as long as the process. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Open (or create) a ledger file and replay its entries.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let mut state = LocalState::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let total = content.split_inclusive('\n').count();
                let mut good_len = 0usize;
                for (line_no, line) in content.split_inclusive('\n').enumerate() {
                    if line.trim().is_empty() {
                        good_len += line.len();
                        continue;
                    }
                    match serde_json::from_str::<LocalEntry>(line.trim_end()) {
                        Ok(entry) => {
                            state.push(entry);
                            good_len += line.len();
                        }
                        // A torn final line from a crash mid-append.
                        Err(e) if line_no + 1 == total && !line.ends_with('\n') => {
                            warn!("Truncating incomplete trailing ledger line {}: {}", line_no + 1, e);
                            let file = OpenOptions::new()
                                .write(true)
                                .open(&path)
                                .await
                                .map_err(|e| LedgerError::Storage(e.to_string()))?;
                            file.set_len(good_len as u64)
                                .await
                                .map_err(|e| LedgerError::Storage(e.to_string()))?;
                        }
                        Err(e) => {
                            return Err(LedgerError::Storage(format!(
                                "{}:{}: {}",
                                path.display(),
                                line_no + 1,
                                e
                            )))
                        }
                    }
                }
                // The crash landed between the JSON and its newline; terminate
                // the last entry so the next append starts a fresh line.
                if good_len == content.len() && !content.is_empty() && !content.ends_with('\n') {
                    warn!("Terminating unfinished last ledger line in {}", path.display());
                    let mut file = OpenOptions::new()
                        .append(true)
                        .open(&path)
                        .await
                        .map_err(|e| LedgerError::Storage(e.to_string()))?;
                    file.write_all(b"\n")
                        .await
                        .map_err(|e| LedgerError::Storage(e.to_string()))?;
                    file.sync_data().await.map_err(|e| LedgerError::Storage(e.to_string()))?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LedgerError::Storage(e.to_string())),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
        }

        info!("Local ledger at {} holds {} entries", path.display(), state.entries.len());
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn append_line(&self, entry: &LocalEntry) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry).map_err(|e| LedgerError::Storage(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        file.sync_data().await.map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn synthetic_tx_hash(seq: u64, key: &str, hash: &str) -> TxHash {
    keccak256(format!("local-ledger:{}:{}:{}", seq, key, hash))
}

#[async_trait]
impl Ledger for LocalLedger {
    fn provider(&self) -> &'static str {
        "local-ledger"
    }

    async fn submit(&self, request: &AnchorRequest) -> Result<PendingAnchor, LedgerError> {
        let key = request.key.as_ledger_string();
        let hash = request.hash.to_hex();

        let mut state = self.state.lock().await;
        if state.by_key.contains_key(&key) {
            return Err(LedgerError::AlreadyAnchored(key));
        }

        let seq = state.entries.len() as u64;
        let now = Utc::now();
        let entry = LocalEntry {
            seq,
            tx_hash: synthetic_tx_hash(seq, &key, &hash),
            key,
            hash,
            uploader_role: request.uploader_role.clone(),
            timestamp: now.timestamp().max(0) as u64,
            recorded_at: now,
        };

        // Persist before the entry becomes visible to readers.
        self.append_line(&entry).await?;
        let tx_hash = entry.tx_hash;
        state.push(entry);

        Ok(PendingAnchor {
            tx_hash,
            key: request.key.clone(),
            hash: request.hash,
            submitted_at: now,
        })
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<ReceiptStatus, LedgerError> {
        let state = self.state.lock().await;
        Ok(match state.by_tx.get(tx_hash) {
            Some(idx) => {
                let entry = &state.entries[*idx];
                ReceiptStatus::Mined(AnchorReceipt {
                    tx_hash: entry.tx_hash,
                    block_number: Some(entry.seq),
                    confirmed_at: entry.recorded_at,
                })
            }
            None => ReceiptStatus::Pending,
        })
    }

    async fn lookup(&self, key: &EvidenceKey) -> Result<Option<LedgerRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.by_key.get(&key.as_ledger_string()).map(|idx| {
            let entry = &state.entries[*idx];
            LedgerRecord {
                stored_hash: entry.hash.clone(),
                timestamp: entry.timestamp,
                uploader_role: Some(entry.uploader_role.clone()),
            }
        }))
    }
}
