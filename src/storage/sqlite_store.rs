//! Embedded SQLite implementation of the Storage trait.
//!
//! Metadata and block records share one key/value table. Every logical
//! operation runs inside a single transaction, so a metadata update and the
//! block writes of one call commit or roll back together. Expiry is a
//! per-row attribute: reads filter out expired rows and `gc` reaps them.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};

use crate::storage::{
    block_count, block_key, check_write, fold_write, info_key, FileInfo, FileMeta, ScanEntry,
    Storage, StorageError, BLOCK_SIZE, FILE_COMPLETE,
};

const DB_FILE: &str = "store.sqlite";

/// An instance of the storage service backed by an embedded SQLite
/// database.
pub struct SqliteBlockStore {
    conn: Mutex<Connection>,
    ttl: chrono::Duration,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_time(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl SqliteBlockStore {
    /// Open the data folder and return an instance of the storage service.
    pub fn open(data_path: &Path, read_only: bool, ttl: Duration) -> Result<Self, StorageError> {
        let db_path = data_path.join(DB_FILE);

        let conn = if read_only {
            Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            if let Err(e) = std::fs::create_dir_all(data_path) {
                warn!("cannot create data folder {}: {}", data_path.display(), e);
            }
            let conn = Connection::open(&db_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS store (
                    key        TEXT PRIMARY KEY,
                    value      BLOB NOT NULL,
                    expires_at INTEGER NOT NULL
                )",
                [],
            )?;
            conn
        };

        info!("opened sqlite store at {}", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::MAX),
        })
    }

    fn expires(&self) -> i64 {
        now_ms() + self.ttl.num_milliseconds()
    }

    /// Fetch a record, treating expired rows as absent.
    fn get_live(tx: &Transaction, key: &str) -> Result<Option<(Vec<u8>, i64)>, rusqlite::Error> {
        tx.query_row(
            "SELECT value, expires_at FROM store WHERE key = ?1 AND expires_at > ?2",
            params![key, now_ms()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
    }

    fn put(tx: &Transaction, key: &str, value: &[u8], expires_at: i64) -> Result<(), rusqlite::Error> {
        // REPLACE also covers writing over an expired row that gc has not
        // reaped yet.
        tx.execute(
            "INSERT OR REPLACE INTO store (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteBlockStore {
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

        let hash = hash.map(hex::encode).unwrap_or_default();
        let meta = FileMeta::new(name, content_type, length, &hash);
        let data = meta.encode()?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let ikey = info_key(key);
        if Self::get_live(&tx, &ikey)?.is_some() {
            return Err(StorageError::Exists);
        }

        Self::put(&tx, &ikey, &data, self.expires())?;
        tx.commit()?;
        Ok(())
    }

    async fn write_at(&self, key: &str, pos: i64, data: &[u8]) -> Result<i64, StorageError> {
        if pos < 0 || pos % BLOCK_SIZE as i64 != 0 {
            warn!("{}: write at misaligned position {}", key, pos);
            return Err(StorageError::InvalidPos);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let ikey = info_key(key);
        let (raw, _) = Self::get_live(&tx, &ikey)?.ok_or(StorageError::NotFound)?;
        let mut meta = FileMeta::decode(&raw)?;

        check_write(&meta, pos, data.len())?;

        let expires = self.expires();
        let mut block = pos / BLOCK_SIZE as i64;
        for chunk in data.chunks(BLOCK_SIZE) {
            Self::put(&tx, &block_key(key, block), chunk, expires)?;
            block += 1;
        }

        let next = fold_write(&mut meta, data)?;
        Self::put(&tx, &ikey, &meta.encode()?, expires)?;
        tx.commit()?;
        Ok(next)
    }

    async fn read_at(&self, key: &str, buf: &mut [u8], pos: i64) -> Result<usize, StorageError> {
        if pos < 0 {
            return Err(StorageError::InvalidPos);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let (raw, _) = Self::get_live(&tx, &info_key(key))?.ok_or(StorageError::NotFound)?;
        let meta = FileMeta::decode(&raw)?;

        if meta.cur_pos != FILE_COMPLETE {
            return Err(StorageError::Incomplete);
        }
        if pos > meta.length {
            return Err(StorageError::InvalidPos);
        }

        let mut want = buf.len().min((meta.length - pos) as usize);
        let mut block = pos / BLOCK_SIZE as i64;
        // The intra-block offset only applies to the first block read.
        let mut offs = (pos % BLOCK_SIZE as i64) as usize;
        let mut filled = 0;

        while want > 0 {
            let (data, _) =
                Self::get_live(&tx, &block_key(key, block))?.ok_or(StorageError::NotFound)?;

            let chunk = &data[offs.min(data.len())..];
            offs = 0;

            let n = chunk.len().min(want);
            if n == 0 {
                // A short or empty block inside the file means corruption.
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
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let (raw, expires_at) = Self::get_live(&tx, &info_key(key))?.ok_or(StorageError::NotFound)?;
        let meta = FileMeta::decode(&raw)?;

        Ok(FileInfo::from_meta(
            &meta,
            expiry_time(expires_at).unwrap_or(DateTime::<Utc>::MIN_UTC),
        ))
    }

    async fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let ikey = info_key(key);
        let Some((raw, _)) = Self::get_live(&tx, &ikey)? else {
            return Ok(());
        };
        let meta = FileMeta::decode(&raw)?;

        tx.execute("DELETE FROM store WHERE key = ?1", params![ikey])?;

        for i in 0..block_count(meta.highwater()) {
            if let Err(e) = tx.execute("DELETE FROM store WHERE key = ?1", params![block_key(key, i)]) {
                warn!("{}: delete block {}: {}", key, i, e);
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ScanEntry>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, length(value), expires_at FROM store WHERE key >= ?1 ORDER BY key",
        )?;

        let rows = stmt.query_map(params![prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, size, expires_at) = row?;
            if !prefix.is_empty() && !key.starts_with(prefix) {
                break;
            }
            entries.push(ScanEntry {
                key,
                size,
                expires_at: expiry_time(expires_at),
            });
        }

        Ok(entries)
    }

    async fn gc(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let reaped = conn.execute("DELETE FROM store WHERE expires_at <= ?1", params![now_ms()])?;
        if reaped > 0 {
            info!("gc reaped {} expired records", reaped);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        // The connection is released when the store is dropped.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, ttl: Duration) -> SqliteBlockStore {
        SqliteBlockStore::open(dir.path(), false, ttl).unwrap()
    }

    #[tokio::test]
    async fn test_create_stat_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));

        store
            .create_file("k", "k.bin", "application/octet-stream", 10, None)
            .await
            .unwrap();

        let info = store.stat("k").await.unwrap();
        assert_eq!(info.name, "k.bin");
        assert_eq!(info.length, 10);
        assert_eq!(info.next, 0);
        assert!(info.expires_at > Utc::now());

        store.delete_file("k").await.unwrap();
        assert!(matches!(
            store.stat("k").await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_records_expire_on_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_millis(50));

        store.create_file("k", "k", "", 5, None).await.unwrap();
        assert!(store.stat("k").await.is_ok());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            store.stat("k").await,
            Err(StorageError::NotFound)
        ));

        // The key can be taken again once the old record has lapsed.
        store.create_file("k", "k2", "", 7, None).await.unwrap();
        assert_eq!(store.stat("k").await.unwrap().name, "k2");
    }

    #[tokio::test]
    async fn test_gc_reaps_expired_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_millis(50));

        store.create_file("k", "k", "", 5, None).await.unwrap();
        store.write_at("k", 0, b"hello").await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        store.gc().await.unwrap();

        assert!(store.scan("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_reports_all_records_of_a_file() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, Duration::from_secs(60));

        let len = BLOCK_SIZE as i64 + 100;
        store.create_file("k", "k", "", len, None).await.unwrap();
        store.write_at("k", 0, &vec![1u8; BLOCK_SIZE]).await.unwrap();
        store
            .write_at("k", BLOCK_SIZE as i64, &vec![2u8; 100])
            .await
            .unwrap();

        let entries = store.scan("k:").await.unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["k:0", "k:1", "k:i"]);

        let block0 = entries.iter().find(|e| e.key == "k:0").unwrap();
        assert_eq!(block0.size, BLOCK_SIZE as i64);
        assert!(block0.expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_read_only_store_rejects_writes() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir, Duration::from_secs(60));
            store.create_file("k", "k", "", 5, None).await.unwrap();
            store.write_at("k", 0, b"hello").await.unwrap();
        }

        let store = SqliteBlockStore::open(dir.path(), true, Duration::from_secs(60)).unwrap();
        let mut buf = vec![0u8; 5];
        assert_eq!(store.read_at("k", &mut buf, 0).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");

        assert!(store.create_file("x", "x", "", 5, None).await.is_err());
    }

    #[tokio::test]
    async fn test_write_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let first = vec![3u8; BLOCK_SIZE];
        {
            let store = open_store(&dir, Duration::from_secs(60));
            store
                .create_file("k", "k", "", BLOCK_SIZE as i64 + 5, None)
                .await
                .unwrap();
            assert_eq!(
                store.write_at("k", 0, &first).await.unwrap(),
                BLOCK_SIZE as i64
            );
        }

        // A resuming client asks where to continue after a restart.
        let store = open_store(&dir, Duration::from_secs(60));
        let info = store.stat("k").await.unwrap();
        assert_eq!(info.next, BLOCK_SIZE as i64);

        assert_eq!(
            store
                .write_at("k", BLOCK_SIZE as i64, b"tail!")
                .await
                .unwrap(),
            FILE_COMPLETE
        );

        let mut buf = vec![0u8; BLOCK_SIZE + 5];
        assert_eq!(
            store.read_at("k", &mut buf, 0).await.unwrap(),
            BLOCK_SIZE + 5
        );
        assert_eq!(&buf[..BLOCK_SIZE], &first[..]);
        assert_eq!(&buf[BLOCK_SIZE..], b"tail!");
    }
}
