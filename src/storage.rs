//! Blob storage for uploaded evidence.
//!
//! Files are written under `<root>/<evidence_id>` as they stream in, hashed
//! on the way through. Paths never include client-supplied names.

use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;
use uuid::Uuid;

use crate::digest::{digest_reader, FileDigest, StreamingDigest};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("file exceeds the {limit}-byte upload limit")]
    TooLarge { limit: u64 },
    #[error("blob storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, evidence_id: &Uuid) -> PathBuf {
        self.root.join(evidence_id.to_string())
    }

    /// Start writing a new blob. At most `limit` bytes are accepted.
    pub async fn create(&self, evidence_id: &Uuid, limit: u64) -> Result<BlobWriter, BlobError> {
        let path = self.path_for(evidence_id);
        let file = File::create(&path).await?;
        Ok(BlobWriter {
            file: BufWriter::new(file),
            path,
            digest: StreamingDigest::new(),
            limit,
        })
    }

    /// Re-hash a stored blob. `None` if it no longer exists.
    pub async fn digest_of(&self, path: &Path) -> Result<Option<(FileDigest, u64)>, BlobError> {
        match File::open(path).await {
            Ok(file) => Ok(Some(digest_reader(file).await?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// An in-progress upload. Either `finish` or `discard` it.
pub struct BlobWriter {
    file: BufWriter<File>,
    path: PathBuf,
    digest: StreamingDigest,
    limit: u64,
}

/// A fully written blob and its digest.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub path: PathBuf,
    pub digest: FileDigest,
    pub size: u64,
}

impl BlobWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), BlobError> {
        if self.digest.len() + chunk.len() as u64 > self.limit {
            return Err(BlobError::TooLarge { limit: self.limit });
        }
        self.digest.update(chunk);
        self.file.write_all(chunk).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<StoredBlob, BlobError> {
        if self.digest.is_empty() {
            warn!("Storing empty blob {}", self.path.display());
        }
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        let size = self.digest.len();
        Ok(StoredBlob {
            path: self.path,
            digest: self.digest.finalize(),
            size,
        })
    }

    /// Remove whatever was written so far.
    pub async fn discard(self) {
        let path = self.path.clone();
        drop(self.file);
        remove_quietly(&path).await;
    }
}

/// Delete a blob, logging rather than failing if that doesn't work.
pub async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove blob {}: {}", path.display(), e);
        }
    }
}
