use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Json, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use alloy_primitives::TxHash;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{AnchorState, CatalogError, EvidenceCatalog, EvidenceMetadata};
use crate::chain::{AnchorError, AnchorOutcome, ChainClient};
use crate::digest::{FileDigest, StreamingDigest};
use crate::ledger::{AnchorRequest, EvidenceKey, LedgerError, ReceiptStatus};
use crate::storage::{remove_quietly, BlobError, BlobStore, StoredBlob};
use crate::verify::{verify_against_ledger, BlockchainRecord, VerificationReport, VerificationStatus};

pub const DEFAULT_UPLOADER_ROLE: &str = "Investigator";
/// Room for multipart boundaries and the small text fields around the file.
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;
/// Bound on the single poll behind `GET /api/v1/anchors/{txHash}`.
pub const ANCHOR_POLL_TIMEOUT: Duration = Duration::from_secs(5);

// --- Error Handling ---

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { field: &'static str, message: String },
    #[error("file exceeds the {limit}-byte upload limit")]
    PayloadTooLarge { limit: u64 },
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{source}")]
    Anchor {
        source: AnchorError,
        tx_hash: Option<TxHash>,
        evidence_id: Option<Uuid>,
    },
    #[error("ledger lookup failed: {0}")]
    Ledger(#[from] LedgerError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("storage error: {0}")]
    Blob(BlobError),
}

impl ApiError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ApiError::Validation {
            field,
            message: message.into(),
        }
    }

    fn anchor(source: AnchorError, tx_hash: TxHash, evidence_id: Uuid) -> Self {
        ApiError::Anchor {
            source,
            tx_hash: Some(tx_hash),
            evidence_id: Some(evidence_id),
        }
    }

    fn from_multipart(err: axum::extract::multipart::MultipartError, limit: u64) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge { limit }
        } else {
            ApiError::Multipart(err.body_text())
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } | ApiError::Multipart(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Anchor {
                source: AnchorError::Rejected(inner),
                ..
            } => ledger_status(inner),
            ApiError::Anchor { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Ledger(inner) => ledger_status(inner),
            ApiError::Catalog(_) | ApiError::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn ledger_status(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::AlreadyAnchored(_) => StatusCode::CONFLICT,
        LedgerError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        LedgerError::Signing(_) | LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl From<AnchorError> for ApiError {
    fn from(source: AnchorError) -> Self {
        ApiError::Anchor {
            source,
            tx_hash: None,
            evidence_id: None,
        }
    }
}

/// Catalog state for a row whose anchor attempt ended in `err`.
fn state_after_failure(err: &AnchorError) -> AnchorState {
    match err {
        AnchorError::Confirmation { .. } => AnchorState::Unconfirmed,
        _ => AnchorState::Failed,
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::TooLarge { limit } => ApiError::PayloadTooLarge { limit },
            other => ApiError::Blob(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self);
        }
        let mut body = serde_json::json!({ "success": false, "error": self.to_string() });
        match &self {
            ApiError::Validation { field, .. } => body["field"] = serde_json::json!(field),
            ApiError::Anchor {
                source,
                tx_hash,
                evidence_id,
            } => {
                // `definite` means the write did not land; otherwise it may still.
                body["definite"] = serde_json::json!(source.is_definite_failure());
                if let Some(tx_hash) = tx_hash {
                    body["txHash"] = serde_json::json!(tx_hash);
                }
                if let Some(evidence_id) = evidence_id {
                    body["evidenceId"] = serde_json::json!(evidence_id);
                    body["status"] = serde_json::json!(state_after_failure(source));
                }
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

// --- State ---

#[derive(Clone)]
pub struct AppState {
    pub chain: Arc<ChainClient>,
    pub catalog: EvidenceCatalog,
    pub blobs: BlobStore,
    pub max_upload_bytes: u64,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD)).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload_evidence))
        .route("/api/v1/evidence/upload", post(upload_evidence))
        .route("/api/v1/evidence/verify-file", post(verify_file))
        .route("/api/v1/evidence/{id}", get(get_evidence))
        .route("/api/v1/evidence/{id}/verify", get(verify_evidence))
        .route("/api/v1/cases/{case_id}/evidence", get(list_case_evidence))
        .route("/api/v1/anchors/{tx_hash}", get(anchor_status))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let provider = state.chain.provider();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, ledger = provider, "Evidence locker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "ledger": state.chain.provider(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// --- Upload ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub hash: FileDigest,
    pub tx_hash: TxHash,
    pub evidence_id: Uuid,
    pub ledger_key: String,
    pub status: AnchorState,
}

#[derive(Default)]
struct UploadForm {
    blob: Option<StoredBlob>,
    filename: Option<String>,
    content_type: Option<String>,
    case_id: Option<String>,
    uploader_role: Option<String>,
}

async fn text_field(field: Field<'_>, limit: u64) -> Result<Option<String>, ApiError> {
    let text = field.text().await.map_err(|e| ApiError::from_multipart(e, limit))?;
    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

async fn read_upload_form(
    state: &AppState,
    evidence_id: &Uuid,
    multipart: &mut Multipart,
) -> Result<UploadForm, ApiError> {
    let limit = state.max_upload_bytes;
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from_multipart(e, limit))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                if form.blob.is_some() {
                    return Err(ApiError::validation("file", "Only one file may be uploaded per request"));
                }
                form.filename = field.file_name().map(str::to_string);
                form.content_type = field.content_type().map(str::to_string);

                let mut writer = state.blobs.create(evidence_id, limit).await?;
                loop {
                    let chunk = match field.chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            writer.discard().await;
                            return Err(ApiError::from_multipart(e, limit));
                        }
                    };
                    if let Err(e) = writer.write_chunk(&chunk).await {
                        writer.discard().await;
                        return Err(e.into());
                    }
                }
                form.blob = Some(writer.finish().await?);
            }
            Some("caseId") => form.case_id = text_field(field, limit).await?,
            Some("uploaderRole") => form.uploader_role = text_field(field, limit).await?,
            _ => {}
        }
    }

    Ok(form)
}

/// POST /upload
///
/// Streams the file to the blob store while hashing it, anchors the digest,
/// and waits for confirmation. 202 means the transaction was accepted but
/// not mined before the deadline.
async fn upload_evidence(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let evidence_id = Uuid::new_v4();
    let blob_path = state.blobs.path_for(&evidence_id);

    let form = match read_upload_form(&state, &evidence_id, &mut multipart).await {
        Ok(form) => form,
        Err(e) => {
            remove_quietly(&blob_path).await;
            return Err(e);
        }
    };

    let Some(blob) = form.blob else {
        return Err(ApiError::validation("file", "No file uploaded"));
    };
    let Some(case_id) = form.case_id else {
        remove_quietly(&blob.path).await;
        return Err(ApiError::validation("caseId", "Case ID is required"));
    };
    let uploader_role = form.uploader_role.unwrap_or_else(|| DEFAULT_UPLOADER_ROLE.to_string());

    let key = EvidenceKey::new(case_id.clone(), evidence_id.to_string());
    if let Err(e) = EvidenceKey::parse(&key.as_ledger_string()) {
        remove_quietly(&blob.path).await;
        return Err(ApiError::validation("caseId", e.to_string()));
    }

    info!(%evidence_id, case_id = %case_id, size = blob.size, hash = %blob.digest, "Evidence received");

    let request = AnchorRequest {
        key: key.clone(),
        hash: blob.digest,
        uploader_role: uploader_role.clone(),
    };
    let pending = match state.chain.submit(&request).await {
        Ok(pending) => pending,
        Err(e) => {
            remove_quietly(&blob.path).await;
            return Err(e.into());
        }
    };
    let tx_hash = pending.tx_hash;

    let meta = EvidenceMetadata {
        id: evidence_id,
        case_id,
        filename: form.filename,
        content_type: form.content_type,
        size_bytes: blob.size,
        hash: blob.digest,
        ledger_key: key.as_ledger_string(),
        tx_hash,
        anchor_state: AnchorState::Pending,
        uploader_role,
        uploaded_at: Utc::now(),
        blob_path: blob.path.clone(),
    };
    if let Err(e) = state.catalog.insert(&meta).await {
        // The write is on the ledger already; keep the blob for manual recovery.
        error!(%evidence_id, %tx_hash, "Anchored evidence could not be catalogued: {}", e);
        return Err(e.into());
    }

    let (status, anchor_state, message) = match state.chain.confirm(pending).await {
        Ok(AnchorOutcome::Confirmed(_)) => (
            StatusCode::OK,
            AnchorState::Confirmed,
            "File uploaded and hash stored on blockchain!",
        ),
        Ok(AnchorOutcome::Unconfirmed(_)) => (
            StatusCode::ACCEPTED,
            AnchorState::Unconfirmed,
            "File uploaded; blockchain confirmation is still pending.",
        ),
        Err(e) => {
            settle_quietly(&state.catalog, &evidence_id, state_after_failure(&e)).await;
            return Err(ApiError::anchor(e, tx_hash, evidence_id));
        }
    };
    settle_quietly(&state.catalog, &evidence_id, anchor_state).await;

    Ok((
        status,
        Json(UploadResponse {
            success: true,
            message: message.to_string(),
            hash: blob.digest,
            tx_hash,
            evidence_id,
            ledger_key: key.as_ledger_string(),
            status: anchor_state,
        }),
    ))
}

/// The ledger is the source of truth, so a failed catalog update is logged
/// rather than turned into a failed request.
async fn settle_quietly(catalog: &EvidenceCatalog, id: &Uuid, state: AnchorState) {
    if let Err(e) = catalog.settle(id, state).await {
        error!(evidence_id = %id, state = state.as_str(), "Could not update anchor state: {}", e);
    }
}

// --- Verification ---

#[derive(Debug, Serialize)]
pub struct VerificationDetails {
    pub verified: bool,
    pub status: VerificationStatus,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockchain_record: Option<BlockchainRecord>,
}

impl From<&VerificationReport> for VerificationDetails {
    fn from(report: &VerificationReport) -> Self {
        Self {
            verified: report.verified(),
            status: report.status,
            details: report.status.details().to_string(),
            blockchain_record: report.record.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VerificationResponse {
    pub evidence_id: Uuid,
    pub overall_status: VerificationStatus,
    pub verification_details: VerificationDetails,
    pub computed_hash: FileDigest,
    pub catalog_hash: FileDigest,
    /// `blob` when re-hashed from storage, `catalog` when the blob is gone.
    pub source: &'static str,
    pub ledger_key: String,
    pub tx_hash: TxHash,
    pub blockchain_provider: &'static str,
    pub verified_at: DateTime<Utc>,
}

fn parse_evidence_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::validation("id", format!("'{}' is not a valid evidence id", raw)))
}

async fn load_metadata(state: &AppState, raw_id: &str) -> Result<EvidenceMetadata, ApiError> {
    let id = parse_evidence_id(raw_id)?;
    state
        .catalog
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Evidence {} not found", id)))
}

/// GET /api/v1/evidence/{id}/verify
async fn verify_evidence(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VerificationResponse>, ApiError> {
    let meta = load_metadata(&state, &id).await?;
    let key = EvidenceKey::parse(&meta.ledger_key)?;

    let (computed_hash, source) = match state.blobs.digest_of(&meta.blob_path).await? {
        Some((digest, _)) => {
            if digest != meta.hash {
                warn!(evidence_id = %meta.id, "Stored blob no longer matches its catalogued hash");
            }
            (digest, "blob")
        }
        None => {
            warn!(evidence_id = %meta.id, "Blob missing, verifying catalogued hash");
            (meta.hash, "catalog")
        }
    };

    let report = verify_against_ledger(&state.chain, &key, computed_hash).await?;

    Ok(Json(VerificationResponse {
        evidence_id: meta.id,
        overall_status: report.status,
        verification_details: VerificationDetails::from(&report),
        computed_hash,
        catalog_hash: meta.hash,
        source,
        ledger_key: meta.ledger_key,
        tx_hash: meta.tx_hash,
        blockchain_provider: state.chain.provider(),
        verified_at: Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
pub struct FileVerificationResponse {
    pub ledger_key: String,
    pub overall_status: VerificationStatus,
    pub verification_details: VerificationDetails,
    pub computed_hash: FileDigest,
    pub size_bytes: u64,
    pub blockchain_provider: &'static str,
}

/// POST /api/v1/evidence/verify-file
///
/// Hashes a candidate file against a ledger key. Nothing is stored.
async fn verify_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<FileVerificationResponse>, ApiError> {
    let limit = state.max_upload_bytes;
    let mut digest: Option<(FileDigest, u64)> = None;
    let mut ledger_key: Option<String> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from_multipart(e, limit))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let mut hasher = StreamingDigest::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::from_multipart(e, limit))?
                {
                    if hasher.len() + chunk.len() as u64 > limit {
                        return Err(ApiError::PayloadTooLarge { limit });
                    }
                    hasher.update(&chunk);
                }
                let size = hasher.len();
                digest = Some((hasher.finalize(), size));
            }
            Some("ledgerKey") => ledger_key = text_field(field, limit).await?,
            _ => {}
        }
    }

    let (computed_hash, size_bytes) = digest.ok_or_else(|| ApiError::validation("file", "No file uploaded"))?;
    let ledger_key = ledger_key.ok_or_else(|| ApiError::validation("ledgerKey", "Ledger key is required"))?;
    let key = EvidenceKey::parse(&ledger_key).map_err(|e| ApiError::validation("ledgerKey", e.to_string()))?;

    let report = verify_against_ledger(&state.chain, &key, computed_hash).await?;

    Ok(Json(FileVerificationResponse {
        ledger_key: key.as_ledger_string(),
        overall_status: report.status,
        verification_details: VerificationDetails::from(&report),
        computed_hash,
        size_bytes,
        blockchain_provider: state.chain.provider(),
    }))
}

// --- Catalog queries ---

async fn get_evidence(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EvidenceMetadata>, ApiError> {
    Ok(Json(load_metadata(&state, &id).await?))
}

#[derive(Debug, Serialize)]
pub struct CaseEvidenceResponse {
    pub case_id: String,
    pub count: usize,
    pub evidence: Vec<EvidenceMetadata>,
}

async fn list_case_evidence(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
) -> Result<Json<CaseEvidenceResponse>, ApiError> {
    let evidence = state.catalog.list_for_case(&case_id).await?;
    Ok(Json(CaseEvidenceResponse {
        case_id,
        count: evidence.len(),
        evidence,
    }))
}

#[derive(Debug, Serialize)]
pub struct AnchorStatusResponse {
    pub tx_hash: TxHash,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    pub evidence_ids: Vec<Uuid>,
}

/// GET /api/v1/anchors/{txHash}
///
/// One bounded receipt poll. Rows waiting on this transaction are settled
/// once it is mined or reverted. With read-back on, a mined row is only
/// confirmed after the ledger returns its hash.
async fn anchor_status(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<AnchorStatusResponse>, ApiError> {
    let tx_hash: TxHash = tx_hash
        .parse()
        .map_err(|_| ApiError::validation("txHash", format!("'{}' is not a transaction hash", tx_hash)))?;

    let rows = state.catalog.find_by_tx(&tx_hash).await?;
    let evidence_ids: Vec<Uuid> = rows.iter().map(|m| m.id).collect();

    let receipt = match tokio::time::timeout(ANCHOR_POLL_TIMEOUT, state.chain.poll(&tx_hash)).await {
        Ok(result) => result?,
        Err(_) => ReceiptStatus::Pending,
    };

    let (status, block_number) = match receipt {
        ReceiptStatus::Pending => ("pending", None),
        ReceiptStatus::Reverted { block_number, .. } => {
            for id in &evidence_ids {
                settle_quietly(&state.catalog, id, AnchorState::Failed).await;
            }
            ("reverted", block_number)
        }
        ReceiptStatus::Mined(r) => {
            let mut any_failed = false;
            for meta in &rows {
                let settled = match meta.anchor_state {
                    AnchorState::Pending | AnchorState::Unconfirmed => {
                        let new_state = confirm_mined_row(&state.chain, meta).await?;
                        settle_quietly(&state.catalog, &meta.id, new_state).await;
                        new_state
                    }
                    current => current,
                };
                any_failed |= settled == AnchorState::Failed;
            }
            (if any_failed { "failed" } else { "confirmed" }, r.block_number)
        }
    };

    Ok(Json(AnchorStatusResponse {
        tx_hash,
        status,
        block_number,
        evidence_ids,
    }))
}

/// Confirmed, or Failed when read-back finds no record or a different hash.
/// A lookup that errors leaves the row as it is.
async fn confirm_mined_row(chain: &ChainClient, meta: &EvidenceMetadata) -> Result<AnchorState, ApiError> {
    if !chain.policy().readback {
        return Ok(AnchorState::Confirmed);
    }
    let key = EvidenceKey::parse(&meta.ledger_key)?;
    match chain.read_back(&key, &meta.hash, &meta.tx_hash).await {
        Ok(()) => Ok(AnchorState::Confirmed),
        Err(e @ AnchorError::Confirmation { .. }) => Err(ApiError::anchor(e, meta.tx_hash, meta.id)),
        Err(e) => {
            warn!(evidence_id = %meta.id, tx_hash = %meta.tx_hash, "Read-back failed after mining: {}", e);
            Ok(AnchorState::Failed)
        }
    }
}
