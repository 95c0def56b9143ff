//! Block storage layer.
//!
//! A file is stored as one metadata record plus a run of fixed-size block
//! records, all keyed off the caller's logical key. Uploads are resumable:
//! the metadata record carries the write cursor and the serialized state of
//! the running digest, so a client can stop after any block boundary and
//! continue later, even against a restarted server. Backends implement the
//! [`Storage`] trait; the embedded SQLite store keeps everything in one
//! transactional database, the remote store keeps metadata and blocks as
//! objects in an S3-compatible bucket. Records expire after the configured
//! TTL, refreshed on every metadata write.

pub mod config;
pub mod mock_store;
pub mod remote_store;
pub mod sqlite_store;


use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cumulative::Cumulative;

/// Size of a storage block. Every write must be a multiple of this, except
/// the final write of a file, which may end on any byte.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Cursor value marking a finalized, immutable file.
pub const FILE_COMPLETE: i64 = -1;

/// Cursor value returned by failed writes; never stored.
pub const INVALID_POS: i64 = -2;

/// Errors shared by every storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file exists")]
    Exists,
    #[error("file not found")]
    NotFound,
    #[error("invalid size")]
    InvalidSize,
    #[error("invalid position")]
    InvalidPos,
    #[error("invalid hash")]
    InvalidHash,
    #[error("file incomplete")]
    Incomplete,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Remote(#[from] object_store::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    HexState(#[from] hex::FromHexError),
    #[error(transparent)]
    HashState(#[from] crate::cumulative::InvalidStateError),
}

/// Metadata key for a logical file key.
pub fn info_key(key: &str) -> String {
    format!("{}:i", key)
}

/// Key of block `n` of a logical file.
pub fn block_key(key: &str, n: i64) -> String {
    format!("{}:{}", key, n)
}

/// Prefix covering every record of a logical file.
pub fn prefix_key(key: &str) -> String {
    format!("{}:", key)
}

/// On-disk metadata record. The single-letter field tags are the storage
/// format and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Original file name.
    #[serde(rename = "n")]
    pub name: String,
    /// MIME type, may be empty.
    #[serde(rename = "c")]
    pub content_type: String,
    /// Expected final digest (hex); empty means adopt whatever the upload
    /// computes.
    #[serde(rename = "h")]
    pub hash: String,
    /// Declared total file size.
    #[serde(rename = "l")]
    pub length: i64,
    /// Time of the last metadata write.
    #[serde(rename = "t")]
    pub created: DateTime<Utc>,
    /// Next byte offset the writer must supply, or [`FILE_COMPLETE`].
    #[serde(rename = "p")]
    pub cur_pos: i64,
    /// Serialized continuation state of the running digest (hex); empty
    /// once the file is finalized.
    #[serde(rename = "x")]
    pub cur_hash: String,
}

impl FileMeta {
    /// Fresh record for a file about to receive its first block.
    pub fn new(name: &str, content_type: &str, length: i64, hash: &str) -> Self {
        Self {
            name: name.to_string(),
            content_type: content_type.to_string(),
            hash: hash.to_string(),
            length,
            created: Utc::now(),
            cur_pos: 0,
            cur_hash: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Offset just past the last written byte: the cursor while the file is
    /// open, the declared length once it is complete.
    pub fn highwater(&self) -> i64 {
        if self.cur_pos >= 0 {
            self.cur_pos
        } else {
            self.length
        }
    }
}

/// Number of block records covering `len` bytes.
pub fn block_count(len: i64) -> i64 {
    (len + BLOCK_SIZE as i64 - 1) / BLOCK_SIZE as i64
}

/// File snapshot returned by [`Storage::stat`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub content_type: String,
    pub hash: String,
    pub length: i64,
    /// Next write offset, or [`FILE_COMPLETE`].
    pub next: i64,
    pub created: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileInfo {
    pub fn from_meta(meta: &FileMeta, expires_at: DateTime<Utc>) -> Self {
        Self {
            name: meta.name.clone(),
            content_type: meta.content_type.clone(),
            hash: meta.hash.clone(),
            length: meta.length,
            next: meta.cur_pos,
            created: meta.created,
            expires_at,
        }
    }
}

/// Diagnostic record returned by [`Storage::scan`].
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub key: String,
    pub size: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Trait defining the block storage interface.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a new file by writing its metadata record. Fails with
    /// [`StorageError::Exists`] if the key already holds a live file.
    /// `hash` is the expected final digest; `None` accepts whatever the
    /// upload computes.
    async fn create_file(
        &self,
        key: &str,
        name: &str,
        content_type: &str,
        length: i64,
        hash: Option<&[u8]>,
    ) -> Result<(), StorageError>;

    /// Append `data` at `pos`, which must be block-aligned and equal to
    /// the file's current cursor. Returns the next expected offset, or
    /// [`FILE_COMPLETE`] when this write reached the declared length.
    async fn write_at(&self, key: &str, pos: i64, data: &[u8]) -> Result<i64, StorageError>;

    /// Fill `buf` with file contents starting at `pos`, clamped to the end
    /// of the file. Only legal once the file is complete. Returns the
    /// number of bytes copied.
    async fn read_at(&self, key: &str, buf: &mut [u8], pos: i64) -> Result<usize, StorageError>;

    /// Metadata snapshot for a live file.
    async fn stat(&self, key: &str) -> Result<FileInfo, StorageError>;

    /// Remove the metadata record and every block. Absent keys are not an
    /// error.
    async fn delete_file(&self, key: &str) -> Result<(), StorageError>;

    /// Enumerate records from `prefix`, for diagnostics.
    async fn scan(&self, prefix: &str) -> Result<Vec<ScanEntry>, StorageError>;

    /// Reap expired records where the backend supports it.
    async fn gc(&self) -> Result<(), StorageError>;

    /// Release backend resources. Called once at shutdown.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Validate a write request against the current metadata record. The
/// `pos == cur_pos` check is the single serialization point between racing
/// writers.
pub(crate) fn check_write(meta: &FileMeta, pos: i64, len: usize) -> Result<(), StorageError> {
    if meta.cur_pos < 0 {
        return Err(StorageError::Exists);
    }
    if pos != meta.cur_pos {
        return Err(StorageError::InvalidPos);
    }
    if pos + len as i64 > meta.length {
        return Err(StorageError::InvalidSize);
    }
    // A write shorter than a whole number of blocks is only legal when it
    // ends exactly at the declared length.
    if len % BLOCK_SIZE != 0 && pos + len as i64 != meta.length {
        return Err(StorageError::InvalidSize);
    }
    Ok(())
}

/// Fold a validated write into the metadata record: resume the carried
/// digest, fold every block of `data`, then either advance the cursor or
/// finalize the file when the write reaches the declared length. Refreshes
/// `created` (and with it the TTL window). Returns the new cursor value.
pub(crate) fn fold_write(meta: &mut FileMeta, data: &[u8]) -> Result<i64, StorageError> {
    let mut hash = Cumulative::new();
    hash.unmarshal(&hex::decode(&meta.cur_hash)?)?;

    for chunk in data.chunks(BLOCK_SIZE) {
        hash.write(chunk);
    }

    if meta.cur_pos + data.len() as i64 == meta.length {
        let digest = hex::encode(hash.sum(&[]));
        if meta.hash.is_empty() {
            meta.hash = digest;
        } else if meta.hash != digest {
            return Err(StorageError::InvalidHash);
        }
        meta.cur_pos = FILE_COMPLETE;
        meta.cur_hash = String::new();
    } else {
        meta.cur_hash = hex::encode(hash.marshal());
        meta.cur_pos += data.len() as i64;
    }

    meta.created = Utc::now();
    Ok(meta.cur_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding() {
        assert_eq!(info_key("abc"), "abc:i");
        assert_eq!(block_key("abc", 0), "abc:0");
        assert_eq!(block_key("abc", 12), "abc:12");
        assert_eq!(prefix_key("abc"), "abc:");

        // Every derived key sorts under the file prefix.
        assert!(info_key("abc").starts_with(&prefix_key("abc")));
        assert!(block_key("abc", 7).starts_with(&prefix_key("abc")));
    }

    #[test]
    fn test_meta_round_trip_preserves_zero_cursor() {
        let meta = FileMeta::new("a.bin", "application/octet-stream", 40000, "");
        let encoded = meta.encode().unwrap();
        let decoded = FileMeta::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.cur_pos, 0);
    }

    #[test]
    fn test_meta_uses_short_field_tags() {
        let mut meta = FileMeta::new("a.bin", "text/plain", 5, "0011");
        meta.cur_hash = "ff".to_string();
        let text = String::from_utf8(meta.encode().unwrap()).unwrap();

        for tag in ["\"n\":", "\"c\":", "\"h\":", "\"l\":", "\"t\":", "\"p\":", "\"x\":"] {
            assert!(text.contains(tag), "missing tag {} in {}", tag, text);
        }
        // Zero cursor is written out, not skipped.
        assert!(text.contains("\"p\":0"));
    }

    #[test]
    fn test_block_count() {
        let b = BLOCK_SIZE as i64;
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(b), 1);
        assert_eq!(block_count(b + 1), 2);
        assert_eq!(block_count(40000), 3);
    }

    #[test]
    fn test_check_write_rules() {
        let b = BLOCK_SIZE;
        let mut meta = FileMeta::new("f", "", (2 * b + 100) as i64, "");

        // Aligned write at the cursor is fine.
        assert!(check_write(&meta, 0, b).is_ok());
        // Wrong offset.
        assert!(matches!(
            check_write(&meta, b as i64, b),
            Err(StorageError::InvalidPos)
        ));
        // Over the declared length.
        assert!(matches!(
            check_write(&meta, 0, 3 * b),
            Err(StorageError::InvalidSize)
        ));
        // Partial write that does not end at the declared length.
        assert!(matches!(
            check_write(&meta, 0, 100),
            Err(StorageError::InvalidSize)
        ));

        // Partial write forming the tail is fine.
        meta.cur_pos = 2 * b as i64;
        assert!(check_write(&meta, 2 * b as i64, 100).is_ok());

        // Nothing can be appended to a complete file.
        meta.cur_pos = FILE_COMPLETE;
        assert!(matches!(check_write(&meta, 0, b), Err(StorageError::Exists)));
    }

    #[test]
    fn test_fold_write_advances_and_carries_state() {
        let b = BLOCK_SIZE;
        let mut meta = FileMeta::new("f", "", (b + 100) as i64, "");

        let first = vec![1u8; b];
        let next = fold_write(&mut meta, &first).unwrap();
        assert_eq!(next, b as i64);
        assert_eq!(meta.cur_pos, b as i64);
        assert!(!meta.cur_hash.is_empty());

        let second = vec![2u8; 100];
        let next = fold_write(&mut meta, &second).unwrap();
        assert_eq!(next, FILE_COMPLETE);
        assert_eq!(meta.cur_pos, FILE_COMPLETE);
        assert!(meta.cur_hash.is_empty());

        // The adopted digest equals the one-shot fold of both blocks.
        let mut whole = Cumulative::new();
        whole.write(&first);
        whole.write(&second);
        assert_eq!(meta.hash, hex::encode(whole.sum(&[])));
    }

    #[test]
    fn test_fold_write_rejects_digest_mismatch() {
        let expected = hex::encode(md5::compute(b"world").0);
        let mut meta = FileMeta::new("f", "", 5, &expected);

        let err = fold_write(&mut meta, b"hello").unwrap_err();
        assert!(matches!(err, StorageError::InvalidHash));
    }

    #[test]
    fn test_fold_write_accepts_matching_digest() {
        let expected = hex::encode(md5::compute(b"hello").0);
        let mut meta = FileMeta::new("f", "", 5, &expected);

        let next = fold_write(&mut meta, b"hello").unwrap();
        assert_eq!(next, FILE_COMPLETE);
        assert_eq!(meta.hash, expected);
    }
}
