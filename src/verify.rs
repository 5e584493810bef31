//! Verification
//!
//! Compares an expected digest with what the ledger holds. Every attempt
//! starts unverified and queries the ledger again; nothing here is cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chain::ChainClient;
use crate::digest::FileDigest;
use crate::ledger::{EvidenceKey, LedgerError, LedgerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Verified,
    Mismatch,
    NotFound,
}

impl VerificationStatus {
    pub fn details(&self) -> &'static str {
        match self {
            VerificationStatus::Verified => "Hash matches blockchain record.",
            VerificationStatus::Mismatch => "Hash mismatch! File may have been altered.",
            VerificationStatus::NotFound => "Evidence not found in the blockchain ledger.",
        }
    }
}

/// The ledger-side record as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub uploader_role: Option<String>,
    pub stored_hash: String,
}

impl From<&LedgerRecord> for BlockchainRecord {
    fn from(record: &LedgerRecord) -> Self {
        Self {
            timestamp: record.anchored_at(),
            uploader_role: record.uploader_role.clone(),
            stored_hash: record.stored_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub key: String,
    pub status: VerificationStatus,
    pub expected_hash: FileDigest,
    pub record: Option<BlockchainRecord>,
}

impl VerificationReport {
    pub fn verified(&self) -> bool {
        self.status == VerificationStatus::Verified
    }
}

/// One verification attempt. Consumed by [`VerificationAttempt::conclude`],
/// so a concluded attempt can never be re-classified.
#[derive(Debug, Clone)]
pub struct VerificationAttempt {
    key: EvidenceKey,
    expected: FileDigest,
}

impl VerificationAttempt {
    pub fn new(key: EvidenceKey, expected: FileDigest) -> Self {
        Self { key, expected }
    }

    /// Classify a lookup result. A stored value that isn't a valid digest
    /// can't equal one, so it counts as a mismatch.
    pub fn conclude(self, record: Option<LedgerRecord>) -> VerificationReport {
        let status = match &record {
            None => VerificationStatus::NotFound,
            Some(r) if r.stored_digest() == Some(self.expected) => VerificationStatus::Verified,
            Some(_) => VerificationStatus::Mismatch,
        };
        VerificationReport {
            key: self.key.to_string(),
            status,
            expected_hash: self.expected,
            record: record.as_ref().map(BlockchainRecord::from),
        }
    }
}

/// Run a full attempt against the ledger. Transport failures are errors;
/// a missing record is a normal `NotFound` result.
pub async fn verify_against_ledger(
    chain: &ChainClient,
    key: &EvidenceKey,
    expected: FileDigest,
) -> Result<VerificationReport, LedgerError> {
    let attempt = VerificationAttempt::new(key.clone(), expected);
    let record = chain.lookup(key).await?;
    let report = attempt.conclude(record);
    info!(key = %key, status = ?report.status, "Verification complete");
    Ok(report)
}
