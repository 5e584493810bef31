//! Ledger Interface
//!
//! The ledger is an external append-only key/value service. It is reached
//! only through `submit`, `receipt` and `lookup`; contract logic is opaque.

pub mod abi;
pub mod local;
pub mod rpc;
pub mod signer;

pub use local::LocalLedger;
pub use rpc::{RpcLedger, RpcLedgerConfig};
pub use signer::LedgerCredential;

use alloy_primitives::TxHash;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::digest::FileDigest;

/// Upper bound on a ledger key. The contract stores arbitrary strings but
/// keys this long are almost certainly malformed input.
pub const MAX_KEY_LEN: usize = 512;

/// The string key a record is stored under: `<caseId>/<evidenceId>`.
///
/// Keys without a `/` are case-only keys, as written by earlier deployments
/// that anchored one file per case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceKey {
    case_id: String,
    evidence_id: Option<String>,
}

impl EvidenceKey {
    pub fn new(case_id: impl Into<String>, evidence_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            evidence_id: Some(evidence_id.into()),
        }
    }

    pub fn case_only(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            evidence_id: None,
        }
    }

    /// Splits on the last `/` so case ids may themselves contain slashes.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LedgerError::InvalidKey("key is empty".into()));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(LedgerError::InvalidKey(format!("key longer than {} bytes", MAX_KEY_LEN)));
        }
        match raw.rsplit_once('/') {
            Some((case, evidence)) if !case.is_empty() && !evidence.is_empty() => {
                Ok(Self::new(case, evidence))
            }
            Some(_) => Err(LedgerError::InvalidKey(format!("malformed key '{}'", raw))),
            None => Ok(Self::case_only(raw)),
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn evidence_id(&self) -> Option<&str> {
        self.evidence_id.as_deref()
    }

    /// The exact string passed to the contract.
    pub fn as_ledger_string(&self) -> String {
        match &self.evidence_id {
            Some(id) => format!("{}/{}", self.case_id, id),
            None => self.case_id.clone(),
        }
    }
}

impl fmt::Display for EvidenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_ledger_string())
    }
}

/// What gets written: key, digest, and who wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorRequest {
    pub key: EvidenceKey,
    pub hash: FileDigest,
    pub uploader_role: String,
}

/// Handle returned by a successful submission, before confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAnchor {
    pub tx_hash: TxHash,
    pub key: EvidenceKey,
    pub hash: FileDigest,
    pub submitted_at: DateTime<Utc>,
}

/// Proof the write was mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub confirmed_at: DateTime<Utc>,
}

/// Mining status of a submitted transaction, from a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Not mined yet, or not known to the node.
    Pending,
    Mined(AnchorReceipt),
    Reverted { tx_hash: TxHash, block_number: Option<u64> },
}

/// A record as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Raw string stored on-chain. Normally a 64-char hex digest.
    pub stored_hash: String,
    /// Ledger-assigned write time, seconds since the epoch.
    pub timestamp: u64,
    /// Only backends that record it return it.
    pub uploader_role: Option<String>,
}

impl LedgerRecord {
    pub fn stored_digest(&self) -> Option<FileDigest> {
        FileDigest::from_hex(&self.stored_hash).ok()
    }

    pub fn anchored_at(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timestamp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Network-level failure reaching the ledger. Safe to retry.
    #[error("ledger transport error: {0}")]
    Transport(String),
    /// The node answered with a non-success HTTP status.
    #[error("ledger returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// JSON-RPC error response.
    #[error("ledger rejected request ({code}): {message}")]
    Rpc { code: i64, message: String },
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
    #[error("key '{0}' is already anchored")]
    AlreadyAnchored(String),
    #[error("invalid ledger key: {0}")]
    InvalidKey(String),
    #[error("malformed ledger response: {0}")]
    Decode(String),
    #[error("could not sign transaction: {0}")]
    Signing(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether a fresh attempt could succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Transport(_) => true,
            LedgerError::Http { status, .. } => *status >= 500 || *status == 429,
            LedgerError::Rpc { message, .. } => {
                let m = message.to_ascii_lowercase();
                m.contains("nonce too low")
                    || m.contains("replacement transaction underpriced")
                    || m.contains("nonce has already been used")
                    || m.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            LedgerError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            LedgerError::Decode(err.to_string())
        } else {
            LedgerError::Transport(err.to_string())
        }
    }
}

/// An append-only evidence ledger backend.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Short name reported to clients as the blockchain provider.
    fn provider(&self) -> &'static str;

    /// Phase one: get the write accepted and return a handle.
    async fn submit(&self, request: &AnchorRequest) -> Result<PendingAnchor, LedgerError>;

    /// Poll mining status once.
    async fn receipt(&self, tx_hash: &TxHash) -> Result<ReceiptStatus, LedgerError>;

    /// Read the record stored under `key`, if any.
    async fn lookup(&self, key: &EvidenceKey) -> Result<Option<LedgerRecord>, LedgerError>;
}
