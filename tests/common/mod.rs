#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use alloy_primitives::TxHash;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::ServiceExt;

use evidence_locker::catalog::EvidenceCatalog;
use evidence_locker::chain::{AnchorPolicy, ChainClient, RetryPolicy};
use evidence_locker::ledger::{
    AnchorRequest, EvidenceKey, Ledger, LedgerError, LedgerRecord, LocalLedger, PendingAnchor, ReceiptStatus,
};
use evidence_locker::server::{build_router, AppState};
use evidence_locker::storage::BlobStore;

pub const BOUNDARY: &str = "----locker-test-boundary";

/// Ledger double backed by an in-memory `LocalLedger`, with switches for
/// the failure modes a remote node can produce.
pub struct MockLedger {
    inner: LocalLedger,
    pub submits: AtomicUsize,
    pub lookups: AtomicUsize,
    transient_failures: AtomicUsize,
    reject: AtomicBool,
    mined: AtomicBool,
    revert: AtomicBool,
    fail_lookups: AtomicBool,
    tampered: Mutex<Option<String>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            inner: LocalLedger::in_memory(),
            submits: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            mined: AtomicBool::new(true),
            revert: AtomicBool::new(false),
            fail_lookups: AtomicBool::new(false),
            tampered: Mutex::new(None),
        }
    }

    /// Fail the next `n` submissions with a transport error.
    pub fn fail_next_submits(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn reject_submits(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// While false, every receipt poll reports the transaction as pending.
    pub fn set_mined(&self, mined: bool) {
        self.mined.store(mined, Ordering::SeqCst);
    }

    /// Mined receipts come back reverted.
    pub fn revert_receipts(&self, revert: bool) {
        self.revert.store(revert, Ordering::SeqCst);
    }

    /// Lookups fail with a transport error.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make every lookup report this stored hash.
    pub async fn tamper(&self, stored_hash: &str) {
        *self.tampered.lock().await = Some(stored_hash.to_string());
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for MockLedger {
    fn provider(&self) -> &'static str {
        "mock-ledger"
    }

    async fn submit(&self, request: &AnchorRequest) -> Result<PendingAnchor, LedgerError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(LedgerError::Rpc {
                code: -32000,
                message: "execution reverted: caller not authorized".into(),
            });
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Transport("connection reset by peer".into()));
        }
        self.inner.submit(request).await
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<ReceiptStatus, LedgerError> {
        if !self.mined.load(Ordering::SeqCst) {
            return Ok(ReceiptStatus::Pending);
        }
        if self.revert.load(Ordering::SeqCst) {
            return Ok(ReceiptStatus::Reverted {
                tx_hash: *tx_hash,
                block_number: Some(1),
            });
        }
        self.inner.receipt(tx_hash).await
    }

    async fn lookup(&self, key: &EvidenceKey) -> Result<Option<LedgerRecord>, LedgerError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(LedgerError::Transport("connection refused".into()));
        }
        let record = self.inner.lookup(key).await?;
        let tampered = self.tampered.lock().await.clone();
        Ok(match (record, tampered) {
            (Some(mut r), Some(hash)) => {
                r.stored_hash = hash;
                Some(r)
            }
            (record, _) => record,
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub ledger: Arc<MockLedger>,
    pub catalog: EvidenceCatalog,
    pub blobs: BlobStore,
    pub max_upload_bytes: u64,
    _dir: TempDir,
}

pub fn fast_policy() -> AnchorPolicy {
    AnchorPolicy {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        confirm_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        readback: true,
    }
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_limit(1024 * 1024).await
    }

    pub async fn with_limit(max_upload_bytes: u64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MockLedger::new());
        let chain = Arc::new(ChainClient::new(ledger.clone(), fast_policy()));
        let catalog = EvidenceCatalog::new(dir.path().join("catalog.db")).await.unwrap();
        let blobs = BlobStore::new(dir.path().join("blobs")).await.unwrap();

        let router = build_router(AppState {
            chain,
            catalog: catalog.clone(),
            blobs: blobs.clone(),
            max_upload_bytes,
        });

        Self {
            router,
            ledger,
            catalog,
            blobs,
            max_upload_bytes,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response: Response<Body> = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn upload(&self, parts: &[Part<'_>]) -> (StatusCode, Value) {
        self.send(multipart_request("/upload", parts)).await
    }

    pub fn blob_count(&self) -> usize {
        std::fs::read_dir(self.blobs.root()).unwrap().count()
    }
}

pub enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes());
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}
