//! Mock implementation of the Storage trait for testing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::storage::{
    check_write, fold_write, FileInfo, FileMeta, ScanEntry, Storage, StorageError, BLOCK_SIZE,
    FILE_COMPLETE,
};

struct Entry {
    meta: FileMeta,
    expires_at: DateTime<Utc>,
    blocks: HashMap<i64, Vec<u8>>,
}

/// In-memory storage with the same record layout and TTL behavior as the
/// real backends.
pub struct MockBlockStore {
    files: Mutex<HashMap<String, Entry>>,
    ttl: chrono::Duration,
}

impl MockBlockStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::MAX),
        }
    }

    /// Number of live files in the store.
    pub fn file_count(&self) -> usize {
        let now = Utc::now();
        let files = self.files.lock().unwrap();
        files.values().filter(|e| e.expires_at > now).count()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.files.lock().unwrap().clear();
    }
}

impl Default for MockBlockStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl Storage for MockBlockStore {
    async fn create_file(
        &self,
        key: &str,
        name: &str,
        content_type: &str,
        length: i64,
        hash: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        if length < 0 {
            return Err(StorageError::InvalidSize);
        }

        let mut files = self.files.lock().unwrap();
        if let Some(entry) = files.get(key) {
            if entry.expires_at > Utc::now() {
                return Err(StorageError::Exists);
            }
        }

        let hash = hash.map(hex::encode).unwrap_or_default();
        files.insert(
            key.to_string(),
            Entry {
                meta: FileMeta::new(name, content_type, length, &hash),
                expires_at: Utc::now() + self.ttl,
                blocks: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn write_at(&self, key: &str, pos: i64, data: &[u8]) -> Result<i64, StorageError> {
        if pos < 0 || pos % BLOCK_SIZE as i64 != 0 {
            return Err(StorageError::InvalidPos);
        }

        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(key)
            .filter(|e| e.expires_at > Utc::now())
            .ok_or(StorageError::NotFound)?;

        check_write(&entry.meta, pos, data.len())?;

        let mut block = pos / BLOCK_SIZE as i64;
        for chunk in data.chunks(BLOCK_SIZE) {
            entry.blocks.insert(block, chunk.to_vec());
            block += 1;
        }

        let next = fold_write(&mut entry.meta, data)?;
        entry.expires_at = Utc::now() + self.ttl;
        Ok(next)
    }

    async fn read_at(&self, key: &str, buf: &mut [u8], pos: i64) -> Result<usize, StorageError> {
        if pos < 0 {
            return Err(StorageError::InvalidPos);
        }

        let files = self.files.lock().unwrap();
        let entry = files
            .get(key)
            .filter(|e| e.expires_at > Utc::now())
            .ok_or(StorageError::NotFound)?;

        if entry.meta.cur_pos != FILE_COMPLETE {
            return Err(StorageError::Incomplete);
        }
        if pos > entry.meta.length {
            return Err(StorageError::InvalidPos);
        }

        let mut want = buf.len().min((entry.meta.length - pos) as usize);
        let mut block = pos / BLOCK_SIZE as i64;
        let mut offs = (pos % BLOCK_SIZE as i64) as usize;
        let mut filled = 0;

        while want > 0 {
            let data = entry.blocks.get(&block).ok_or(StorageError::NotFound)?;
            let chunk = &data[offs.min(data.len())..];
            offs = 0;

            let n = chunk.len().min(want);
            if n == 0 {
                return Err(StorageError::NotFound);
            }

            buf[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
            want -= n;
            block += 1;
        }

        Ok(filled)
    }

    async fn stat(&self, key: &str) -> Result<FileInfo, StorageError> {
        let files = self.files.lock().unwrap();
        let entry = files
            .get(key)
            .filter(|e| e.expires_at > Utc::now())
            .ok_or(StorageError::NotFound)?;

        Ok(FileInfo::from_meta(&entry.meta, entry.expires_at))
    }

    async fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        self.files.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ScanEntry>, StorageError> {
        let files = self.files.lock().unwrap();
        let mut entries = Vec::new();

        for (key, entry) in files.iter() {
            entries.push(ScanEntry {
                key: crate::storage::info_key(key),
                size: entry.meta.encode().map(|d| d.len()).unwrap_or(0) as i64,
                expires_at: Some(entry.expires_at),
            });
            for (n, data) in entry.blocks.iter() {
                entries.push(ScanEntry {
                    key: crate::storage::block_key(key, *n),
                    size: data.len() as i64,
                    expires_at: Some(entry.expires_at),
                });
            }
        }

        entries.retain(|e| e.key.starts_with(prefix));
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn gc(&self) -> Result<(), StorageError> {
        let now = Utc::now();
        self.files.lock().unwrap().retain(|_, e| e.expires_at > now);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
