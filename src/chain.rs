//! Chain Client
//!
//! Two-phase anchoring on top of a [`Ledger`] backend:
//! `submit` returns a [`PendingAnchor`] as soon as the write is accepted,
//! `await_confirmation` waits for it to be mined under a deadline.
//! `anchor` chains the two and optionally reads the record back.

use alloy_primitives::TxHash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::digest::FileDigest;
use crate::ledger::{
    AnchorReceipt, AnchorRequest, EvidenceKey, Ledger, LedgerError, LedgerRecord, PendingAnchor,
    ReceiptStatus,
};

/// Bounded exponential backoff for transient submission failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnchorPolicy {
    pub retry: RetryPolicy,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    /// Re-read the record after confirmation and compare hashes.
    pub readback: bool,
}

impl Default for AnchorPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confirm_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            readback: true,
        }
    }
}

/// Result of waiting for a submitted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorOutcome {
    Confirmed(AnchorReceipt),
    /// Deadline passed without a receipt. The write may still land.
    Unconfirmed(PendingAnchor),
}

#[derive(Debug, thiserror::Error)]
pub enum AnchorError {
    /// Non-transient failure before the ledger accepted the write.
    #[error("ledger rejected anchoring: {0}")]
    Rejected(#[source] LedgerError),
    #[error("anchoring failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: LedgerError,
    },
    /// Mined, but the contract call failed. Nothing was stored.
    #[error("anchoring transaction {0} reverted")]
    Reverted(TxHash),
    #[error("ledger error while confirming {tx_hash}: {source}")]
    Confirmation {
        tx_hash: TxHash,
        #[source]
        source: LedgerError,
    },
    #[error("read-back of '{key}' returned {found} instead of {expected}")]
    ReadbackMismatch {
        key: String,
        expected: FileDigest,
        found: String,
    },
    #[error("read-back of '{key}' found no record after confirmation")]
    ReadbackMissing { key: String },
}

impl AnchorError {
    /// Whether the write definitely did not land.
    pub fn is_definite_failure(&self) -> bool {
        matches!(
            self,
            AnchorError::Rejected(_) | AnchorError::RetriesExhausted { .. } | AnchorError::Reverted(_)
        )
    }
}

pub struct ChainClient {
    ledger: Arc<dyn Ledger>,
    policy: AnchorPolicy,
}

impl ChainClient {
    pub fn new(ledger: Arc<dyn Ledger>, policy: AnchorPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn provider(&self) -> &'static str {
        self.ledger.provider()
    }

    pub fn policy(&self) -> &AnchorPolicy {
        &self.policy
    }

    /// Phase one. Transient failures are retried per the policy; anything
    /// else is returned immediately.
    pub async fn submit(&self, request: &AnchorRequest) -> Result<PendingAnchor, AnchorError> {
        let retry = &self.policy.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.ledger.submit(request).await {
                Ok(pending) => {
                    if attempt > 1 {
                        info!(key = %request.key, attempt, "Submission succeeded after retry");
                    }
                    return Ok(pending);
                }
                Err(e) if !e.is_transient() => return Err(AnchorError::Rejected(e)),
                Err(e) if attempt >= max_attempts => {
                    return Err(AnchorError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                Err(e) => {
                    let delay = retry.backoff_for(attempt);
                    warn!(key = %request.key, attempt, ?delay, "Transient ledger error, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Single poll of a pending write.
    pub async fn poll(&self, tx_hash: &TxHash) -> Result<ReceiptStatus, LedgerError> {
        self.ledger.receipt(tx_hash).await
    }

    /// Phase two. Polls until mined or `timeout` elapses. A timeout is not
    /// an error: the write is reported as possibly applied.
    pub async fn await_confirmation(
        &self,
        pending: PendingAnchor,
        timeout: Duration,
    ) -> Result<AnchorOutcome, AnchorError> {
        let tx_hash = pending.tx_hash;
        let poll_interval = self.policy.poll_interval;

        let wait = async {
            loop {
                match self.ledger.receipt(&tx_hash).await {
                    Ok(ReceiptStatus::Mined(receipt)) => return Ok(receipt),
                    Ok(ReceiptStatus::Reverted { tx_hash, .. }) => {
                        return Err(AnchorError::Reverted(tx_hash))
                    }
                    Ok(ReceiptStatus::Pending) => {}
                    // A flaky poll doesn't mean the write failed; keep waiting.
                    Err(e) if e.is_transient() => {
                        warn!(%tx_hash, "Receipt poll failed, will retry: {}", e);
                    }
                    Err(source) => return Err(AnchorError::Confirmation { tx_hash, source }),
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(receipt)) => {
                info!(%tx_hash, block = ?receipt.block_number, "Anchor confirmed");
                Ok(AnchorOutcome::Confirmed(receipt))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(%tx_hash, ?timeout, "Anchor not confirmed before deadline");
                Ok(AnchorOutcome::Unconfirmed(pending))
            }
        }
    }

    /// Submit, wait with the configured timeout, then read back if enabled.
    pub async fn anchor(&self, request: &AnchorRequest) -> Result<AnchorOutcome, AnchorError> {
        let pending = self.submit(request).await?;
        self.confirm(pending).await
    }

    /// Phase two plus read-back, for callers that already hold a handle.
    pub async fn confirm(&self, pending: PendingAnchor) -> Result<AnchorOutcome, AnchorError> {
        let key = pending.key.clone();
        let hash = pending.hash;
        let outcome = self.await_confirmation(pending, self.policy.confirm_timeout).await?;

        if let AnchorOutcome::Confirmed(receipt) = &outcome {
            if self.policy.readback {
                self.read_back(&key, &hash, &receipt.tx_hash).await?;
            }
        }
        Ok(outcome)
    }

    /// Check that the ledger holds `expected` under `key`. A failed lookup is
    /// a `Confirmation` error; an absent or different record is not.
    pub async fn read_back(&self, key: &EvidenceKey, expected: &FileDigest, tx_hash: &TxHash) -> Result<(), AnchorError> {
        let record = self
            .ledger
            .lookup(key)
            .await
            .map_err(|source| AnchorError::Confirmation { tx_hash: *tx_hash, source })?;

        match record {
            Some(r) if r.stored_digest().as_ref() == Some(expected) => Ok(()),
            Some(r) => Err(AnchorError::ReadbackMismatch {
                key: key.to_string(),
                expected: *expected,
                found: r.stored_hash,
            }),
            None => Err(AnchorError::ReadbackMissing { key: key.to_string() }),
        }
    }

    pub async fn lookup(&self, key: &EvidenceKey) -> Result<Option<LedgerRecord>, LedgerError> {
        self.ledger.lookup(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use crate::ledger::LocalLedger;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Ledger whose submit/receipt/lookup answers are scripted per test.
    #[derive(Default)]
    struct ScriptedLedger {
        submit_errors: Mutex<VecDeque<LedgerError>>,
        receipts: Mutex<VecDeque<ReceiptStatus>>,
        lookup_hash: Mutex<Option<String>>,
        submits: AtomicU32,
    }

    #[async_trait]
    impl Ledger for ScriptedLedger {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        async fn submit(&self, request: &AnchorRequest) -> Result<PendingAnchor, LedgerError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.submit_errors.lock().await.pop_front() {
                return Err(e);
            }
            Ok(PendingAnchor {
                tx_hash: TxHash::repeat_byte(0xab),
                key: request.key.clone(),
                hash: request.hash,
                submitted_at: Utc::now(),
            })
        }

        async fn receipt(&self, tx_hash: &TxHash) -> Result<ReceiptStatus, LedgerError> {
            Ok(self.receipts.lock().await.pop_front().unwrap_or(ReceiptStatus::Mined(AnchorReceipt {
                tx_hash: *tx_hash,
                block_number: Some(1),
                confirmed_at: Utc::now(),
            })))
        }

        async fn lookup(&self, _key: &EvidenceKey) -> Result<Option<LedgerRecord>, LedgerError> {
            Ok(self.lookup_hash.lock().await.clone().map(|stored_hash| LedgerRecord {
                stored_hash,
                timestamp: 1,
                uploader_role: None,
            }))
        }
    }

    fn fast_policy() -> AnchorPolicy {
        AnchorPolicy {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            confirm_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            readback: true,
        }
    }

    fn request(data: &[u8]) -> AnchorRequest {
        AnchorRequest {
            key: EvidenceKey::new("CASE-1", "ev"),
            hash: digest_bytes(data),
            uploader_role: "Investigator".into(),
        }
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(700),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(700));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.submit_errors.lock().await.extend([
            LedgerError::Transport("reset".into()),
            LedgerError::Rpc { code: -32000, message: "nonce too low".into() },
        ]);
        let req = request(b"x");
        *ledger.lookup_hash.lock().await = Some(req.hash.to_hex());

        let client = ChainClient::new(ledger.clone(), fast_policy());
        let outcome = client.anchor(&req).await.unwrap();
        assert!(matches!(outcome, AnchorOutcome::Confirmed(_)));
        assert_eq!(ledger.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.submit_errors.lock().await.extend((0..5).map(|_| LedgerError::Transport("down".into())));

        let client = ChainClient::new(ledger.clone(), fast_policy());
        let err = client.submit(&request(b"x")).await.unwrap_err();
        assert!(matches!(err, AnchorError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_definite_failure());
        assert_eq!(ledger.submits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.submit_errors.lock().await.push_back(LedgerError::Rpc {
            code: -32000,
            message: "insufficient funds for gas * price + value".into(),
        });

        let client = ChainClient::new(ledger.clone(), fast_policy());
        let err = client.submit(&request(b"x")).await.unwrap_err();
        assert!(matches!(err, AnchorError::Rejected(_)));
        assert_eq!(ledger.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_unconfirmed_not_failed() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.receipts.lock().await.extend((0..1000).map(|_| ReceiptStatus::Pending));

        let client = ChainClient::new(ledger, fast_policy());
        let req = request(b"slow");
        let pending = client.submit(&req).await.unwrap();
        let outcome = client
            .await_confirmation(pending.clone(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(outcome, AnchorOutcome::Unconfirmed(pending));
    }

    #[tokio::test]
    async fn test_revert_is_an_error() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.receipts.lock().await.extend([
            ReceiptStatus::Pending,
            ReceiptStatus::Reverted { tx_hash: TxHash::repeat_byte(0xab), block_number: Some(3) },
        ]);

        let client = ChainClient::new(ledger, fast_policy());
        let err = client.anchor(&request(b"x")).await.unwrap_err();
        assert!(matches!(err, AnchorError::Reverted(_)));
        assert!(err.is_definite_failure());
    }

    #[tokio::test]
    async fn test_readback_detects_divergence() {
        let ledger = Arc::new(ScriptedLedger::default());
        *ledger.lookup_hash.lock().await = Some(digest_bytes(b"something else").to_hex());

        let client = ChainClient::new(ledger.clone(), fast_policy());
        let err = client.anchor(&request(b"x")).await.unwrap_err();
        assert!(matches!(err, AnchorError::ReadbackMismatch { .. }));
        assert!(!err.is_definite_failure());

        *ledger.lookup_hash.lock().await = None;
        let err = client.anchor(&request(b"x")).await.unwrap_err();
        assert!(matches!(err, AnchorError::ReadbackMissing { .. }));
    }

    #[tokio::test]
    async fn test_readback_can_be_disabled() {
        let ledger = Arc::new(ScriptedLedger::default());
        let mut policy = fast_policy();
        policy.readback = false;

        let client = ChainClient::new(ledger, policy);
        assert!(matches!(client.anchor(&request(b"x")).await.unwrap(), AnchorOutcome::Confirmed(_)));
    }

    #[tokio::test]
    async fn test_local_ledger_end_to_end() {
        let client = ChainClient::new(Arc::new(LocalLedger::in_memory()), fast_policy());
        let req = request(b"bodycam.mp4");
        let outcome = client.anchor(&req).await.unwrap();
        assert!(matches!(outcome, AnchorOutcome::Confirmed(_)));

        let record = client.lookup(&req.key).await.unwrap().unwrap();
        assert_eq!(record.stored_digest(), Some(req.hash));

        // Same key again is refused, not overwritten.
        let err = client.anchor(&request(b"other")).await.unwrap_err();
        assert!(matches!(err, AnchorError::Rejected(LedgerError::AlreadyAnchored(_))));
    }
}
