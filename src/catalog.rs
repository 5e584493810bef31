//! Evidence Catalog
//!
//! Write-once metadata for every uploaded file, kept in SQLite. The ledger
//! remains the source of truth for hashes; the catalog remembers where the
//! blob is, what was submitted and which transaction carried it.

use alloy_primitives::TxHash;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::task;
use uuid::Uuid;

use crate::digest::FileDigest;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("catalog task failed: {0}")]
    Join(#[from] task::JoinError),
    #[error("corrupt catalog row {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("evidence {0} already exists")]
    Duplicate(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorState {
    /// Submitted; waiting for confirmation inside the upload request.
    Pending,
    Confirmed,
    /// Confirmation deadline passed; the write may still land.
    Unconfirmed,
    /// Reverted or failed read-back.
    Failed,
}

impl AnchorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorState::Pending => "pending",
            AnchorState::Confirmed => "confirmed",
            AnchorState::Unconfirmed => "unconfirmed",
            AnchorState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AnchorState::Pending),
            "confirmed" => Some(AnchorState::Confirmed),
            "unconfirmed" => Some(AnchorState::Unconfirmed),
            "failed" => Some(AnchorState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub id: Uuid,
    pub case_id: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub hash: FileDigest,
    pub ledger_key: String,
    pub tx_hash: TxHash,
    pub anchor_state: AnchorState,
    pub uploader_role: String,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip)]
    pub blob_path: PathBuf,
}

const SELECT_COLUMNS: &str = "id, case_id, filename, content_type, size_bytes, hash, ledger_key, \
     tx_hash, anchor_state, uploader_role, uploaded_at, blob_path";

fn corrupt(id: &str, reason: impl ToString) -> CatalogError {
    CatalogError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

type RawRow = (
    String, String, Option<String>, Option<String>, i64, String, String, String, String, String,
    String, String,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?,
        row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?,
    ))
}

fn from_raw(raw: RawRow) -> Result<EvidenceMetadata, CatalogError> {
    let (id, case_id, filename, content_type, size, hash, ledger_key, tx_hash, state, role, uploaded_at, blob_path) = raw;
    Ok(EvidenceMetadata {
        id: Uuid::parse_str(&id).map_err(|e| corrupt(&id, e))?,
        case_id,
        filename,
        content_type,
        size_bytes: u64::try_from(size).map_err(|e| corrupt(&id, e))?,
        hash: FileDigest::from_hex(&hash).map_err(|e| corrupt(&id, e))?,
        ledger_key,
        tx_hash: tx_hash.parse().map_err(|e| corrupt(&id, e))?,
        anchor_state: AnchorState::parse(&state).ok_or_else(|| corrupt(&id, format!("state '{}'", state)))?,
        uploader_role: role,
        uploaded_at: DateTime::parse_from_rfc3339(&uploaded_at)
            .map_err(|e| corrupt(&id, e))?
            .with_timezone(&Utc),
        blob_path: PathBuf::from(blob_path),
    })
}

/// SQLite-backed catalog. Each call opens its own connection on the
/// blocking pool, so the handle is cheap to clone into request handlers.
#[derive(Clone)]
pub struct EvidenceCatalog {
    db_path: PathBuf,
}

impl EvidenceCatalog {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS evidence (
                    id TEXT PRIMARY KEY,
                    case_id TEXT NOT NULL,
                    filename TEXT,
                    content_type TEXT,
                    size_bytes INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    ledger_key TEXT NOT NULL UNIQUE,
                    tx_hash TEXT NOT NULL,
                    anchor_state TEXT NOT NULL,
                    uploader_role TEXT NOT NULL,
                    uploaded_at TEXT NOT NULL,
                    blob_path TEXT NOT NULL
                );
                "#,
                [],
            )?;
            conn.execute("CREATE INDEX IF NOT EXISTS idx_evidence_case ON evidence(case_id);", [])?;
            conn.execute("CREATE INDEX IF NOT EXISTS idx_evidence_tx ON evidence(tx_hash);", [])?;
            Ok::<_, CatalogError>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    pub async fn insert(&self, meta: &EvidenceMetadata) -> Result<(), CatalogError> {
        let path = self.db_path.clone();
        let m = meta.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let res = conn.execute(
                "INSERT INTO evidence (id, case_id, filename, content_type, size_bytes, hash, ledger_key, \
                 tx_hash, anchor_state, uploader_role, uploaded_at, blob_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    m.id.to_string(),
                    &m.case_id,
                    &m.filename,
                    &m.content_type,
                    m.size_bytes as i64,
                    m.hash.to_hex(),
                    &m.ledger_key,
                    m.tx_hash.to_string(),
                    m.anchor_state.as_str(),
                    &m.uploader_role,
                    m.uploaded_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    m.blob_path.to_string_lossy().into_owned(),
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(CatalogError::Duplicate(m.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    pub async fn get(&self, id: &Uuid) -> Result<Option<EvidenceMetadata>, CatalogError> {
        let path = self.db_path.clone();
        let id = id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM evidence WHERE id = ?1", SELECT_COLUMNS),
                    params![&id],
                    read_row,
                )
                .optional()?;
            raw.map(from_raw).transpose()
        })
        .await?
    }

    pub async fn find_by_tx(&self, tx_hash: &TxHash) -> Result<Vec<EvidenceMetadata>, CatalogError> {
        self.select_many("tx_hash", tx_hash.to_string()).await
    }

    /// Oldest first.
    pub async fn list_for_case(&self, case_id: &str) -> Result<Vec<EvidenceMetadata>, CatalogError> {
        self.select_many("case_id", case_id.to_string()).await
    }

    async fn select_many(&self, column: &'static str, value: String) -> Result<Vec<EvidenceMetadata>, CatalogError> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM evidence WHERE {} = ?1 ORDER BY uploaded_at ASC, rowid ASC",
                SELECT_COLUMNS, column
            ))?;
            let rows = stmt.query_map(params![&value], read_row)?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(from_raw(raw?)?);
            }
            Ok::<_, CatalogError>(out)
        })
        .await?
    }

    /// Move a row out of `pending`/`unconfirmed`. Settled rows never change;
    /// returns whether a row was updated.
    pub async fn settle(&self, id: &Uuid, state: AnchorState) -> Result<bool, CatalogError> {
        let path = self.db_path.clone();
        let id = id.to_string();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            let changed = conn.execute(
                "UPDATE evidence SET anchor_state = ?1 \
                 WHERE id = ?2 AND anchor_state IN ('pending', 'unconfirmed')",
                params![state.as_str(), &id],
            )?;
            Ok::<_, CatalogError>(changed > 0)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use tempfile::NamedTempFile;

    fn sample(case_id: &str, n: u8) -> EvidenceMetadata {
        let id = Uuid::new_v4();
        EvidenceMetadata {
            id,
            case_id: case_id.to_string(),
            filename: Some(format!("photo-{}.jpg", n)),
            content_type: Some("image/jpeg".into()),
            size_bytes: 1024 * n as u64,
            hash: digest_bytes(&[n]),
            ledger_key: format!("{}/{}", case_id, id),
            tx_hash: TxHash::repeat_byte(n),
            anchor_state: AnchorState::Pending,
            uploader_role: "Investigator".into(),
            uploaded_at: Utc::now(),
            blob_path: PathBuf::from(format!("/tmp/blobs/{}", id)),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let catalog = EvidenceCatalog::new(temp_file.path()).await?;

        let meta = sample("CASE-1", 1);
        catalog.insert(&meta).await?;

        let loaded = catalog.get(&meta.id).await?.expect("row should exist");
        assert_eq!(loaded.hash, meta.hash);
        assert_eq!(loaded.tx_hash, meta.tx_hash);
        assert_eq!(loaded.ledger_key, meta.ledger_key);
        assert_eq!(loaded.blob_path, meta.blob_path);
        assert_eq!(loaded.uploaded_at.timestamp(), meta.uploaded_at.timestamp());

        assert!(catalog.get(&Uuid::new_v4()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_rows_are_write_once() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let catalog = EvidenceCatalog::new(temp_file.path()).await?;

        let meta = sample("CASE-1", 2);
        catalog.insert(&meta).await?;
        let err = catalog.insert(&meta).await.unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(id) if id == meta.id));
        Ok(())
    }

    #[tokio::test]
    async fn test_settle_transitions() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let catalog = EvidenceCatalog::new(temp_file.path()).await?;

        let meta = sample("CASE-1", 3);
        catalog.insert(&meta).await?;

        assert!(catalog.settle(&meta.id, AnchorState::Unconfirmed).await?);
        assert!(catalog.settle(&meta.id, AnchorState::Confirmed).await?);
        // Confirmed is terminal.
        assert!(!catalog.settle(&meta.id, AnchorState::Failed).await?);
        assert_eq!(catalog.get(&meta.id).await?.unwrap().anchor_state, AnchorState::Confirmed);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_for_case_and_by_tx() -> anyhow::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let catalog = EvidenceCatalog::new(temp_file.path()).await?;

        let a = sample("CASE-A", 1);
        let b = sample("CASE-A", 2);
        let c = sample("CASE-B", 3);
        for m in [&a, &b, &c] {
            catalog.insert(m).await?;
        }

        let listed = catalog.list_for_case("CASE-A").await?;
        assert_eq!(listed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![a.id, b.id]);
        assert!(catalog.list_for_case("CASE-Z").await?.is_empty());

        let by_tx = catalog.find_by_tx(&c.tx_hash).await?;
        assert_eq!(by_tx.len(), 1);
        assert_eq!(by_tx[0].id, c.id);
        Ok(())
    }
}
