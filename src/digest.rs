//! Digest Computer
//!
//! SHA-256 content fingerprints for evidence files. Every path that produces a
//! file hash (upload streaming, verification re-hash, audit CLI) goes through
//! this module so identical bytes always give an identical digest.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer used when hashing from a reader.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest must be 64 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("digest is not valid hex: {0}")]
    InvalidHex(String),
}

/// A 32-byte SHA-256 digest of a file's contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDigest([u8; 32]);

impl FileDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, no prefix. This is the form written to the ledger.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses 64 hex characters, optionally `0x`-prefixed, in either case.
    pub fn from_hex(input: &str) -> Result<Self, DigestError> {
        let trimmed = input.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if raw.len() != 64 {
            return Err(DigestError::InvalidLength(raw.len()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(raw, &mut out).map_err(|e| DigestError::InvalidHex(e.to_string()))?;
        Ok(Self(out))
    }
}

impl fmt::Display for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileDigest({})", self.to_hex())
    }
}

impl FromStr for FileDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for FileDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for data that arrives in chunks (multipart streams).
#[derive(Clone, Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> FileDigest {
        FileDigest(self.hasher.finalize().into())
    }
}

/// Hash an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> FileDigest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    FileDigest(hasher.finalize().into())
}

/// Hash everything a reader yields without holding it in memory.
pub async fn digest_reader<R>(mut reader: R) -> std::io::Result<(FileDigest, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut digest = StreamingDigest::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    let len = digest.len();
    Ok((digest.finalize(), len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            digest_bytes(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            digest_bytes(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_deterministic() {
        let data = vec![7u8; 10_000];
        assert_eq!(digest_bytes(&data), digest_bytes(&data));
    }

    #[test]
    fn test_distinct_inputs_distinct_digests() {
        assert_ne!(digest_bytes(b"evidence-a"), digest_bytes(b"evidence-b"));
        // Single bit flip
        assert_ne!(digest_bytes(&[0b0000_0000]), digest_bytes(&[0b0000_0001]));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut streaming = StreamingDigest::new();
        for chunk in data.chunks(4093) {
            streaming.update(chunk);
        }
        assert_eq!(streaming.len(), data.len() as u64);
        assert_eq!(streaming.finalize(), digest_bytes(&data));
    }

    #[tokio::test]
    async fn test_reader_matches_one_shot() {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let (digest, len) = digest_reader(&data[..]).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(digest, digest_bytes(&data));
    }

    #[test]
    fn test_hex_parsing() {
        let d = digest_bytes(b"abc");
        let upper = format!("0X{}", d.to_hex().to_uppercase());
        assert_eq!(FileDigest::from_hex(&upper).unwrap(), d);
        assert_eq!(format!("0x{}", d).parse::<FileDigest>().unwrap(), d);
        assert_eq!(FileDigest::from_hex("abcd"), Err(DigestError::InvalidLength(4)));
        assert!(matches!(FileDigest::from_hex(&"zz".repeat(32)), Err(DigestError::InvalidHex(_))));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let d = digest_bytes(b"abc");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: FileDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
