//! Remote implementation of the Storage trait on an S3-compatible object
//! store.
//!
//! Metadata and blocks are objects under a common prefix. The store offers
//! no cross-object transaction, so a write commits its blocks first and the
//! metadata record last: a crash in between leaves orphan blocks, the next
//! `stat` still shows the old cursor, and the client re-uploads from there.
//! That is safe because block puts are idempotent (same key, same bytes)
//! and a resumed writer that skipped ahead is rejected by the cursor check.
//! Metadata writes are conditional: creation requires the object to be
//! absent, updates compare the version read at the start of the call, so
//! two racing writers at one cursor cannot both advance it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{info, warn};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetRange, ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion,
};

use crate::storage::{
    block_key, check_write, fold_write, info_key, prefix_key, FileInfo, FileMeta, ScanEntry,
    Storage, StorageError, BLOCK_SIZE, FILE_COMPLETE,
};

/// An instance of the storage service backed by a remote object store.
pub struct RemoteBlockStore {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    ttl: chrono::Duration,
}

/// Metadata record together with the object version used for conditional
/// updates.
struct InfoEntry {
    meta: FileMeta,
    version: UpdateVersion,
    expires_at: DateTime<Utc>,
}

impl InfoEntry {
    fn expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl RemoteBlockStore {
    /// Open `location` of the form `bucket` or `bucket/prefix` with
    /// credentials taken from the environment.
    pub fn open(location: &str, ttl: Duration) -> Result<Self, StorageError> {
        let (bucket, prefix) = match location.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix),
            None => (location, ""),
        };

        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;

        info!("opened object store bucket {} prefix {:?}", bucket, prefix);
        Ok(Self::with_store(Arc::new(store), prefix, ttl))
    }

    /// Build on an existing object store client. Tests use this with the
    /// in-memory store.
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: &str, ttl: Duration) -> Self {
        Self {
            store,
            prefix: ObjectPath::from(prefix),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::MAX),
        }
    }

    fn object_path(&self, record_key: &str) -> ObjectPath {
        self.prefix.child(record_key)
    }

    fn list_prefix(&self) -> Option<&ObjectPath> {
        let raw: &str = self.prefix.as_ref();
        if raw.is_empty() {
            None
        } else {
            Some(&self.prefix)
        }
    }

    /// Fetch the metadata record and the version needed to update it.
    async fn get_info(&self, key: &str) -> Result<InfoEntry, StorageError> {
        let path = self.object_path(&info_key(key));
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Err(StorageError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };

        let raw = result.bytes().await?;
        let meta = FileMeta::decode(&raw)?;
        let expires_at = meta.created + self.ttl;

        Ok(InfoEntry {
            meta,
            version,
            expires_at,
        })
    }

    /// Like `get_info`, but a record past its TTL reads as absent.
    async fn get_live_info(&self, key: &str) -> Result<InfoEntry, StorageError> {
        let entry = self.get_info(key).await?;
        if entry.expired() {
            return Err(StorageError::NotFound);
        }
        Ok(entry)
    }

    async fn put_info(
        &self,
        key: &str,
        meta: &FileMeta,
        mode: PutMode,
    ) -> Result<(), StorageError> {
        let payload = PutPayload::from(Bytes::from(meta.encode()?));
        let opts = PutOptions {
            mode,
            ..Default::default()
        };

        match self
            .store
            .put_opts(&self.object_path(&info_key(key)), payload, opts)
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => Err(StorageError::Exists),
            // Losing the version compare means another writer advanced the
            // cursor first; the caller must re-sync via stat.
            Err(object_store::Error::Precondition { .. }) => Err(StorageError::InvalidPos),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Storage for RemoteBlockStore {
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

        match self.put_info(key, &meta, PutMode::Create).await {
            Err(StorageError::Exists) => {
                // Reclaim the slot if the stored record has lapsed; the
                // store has no TTL of its own.
                match self.get_info(key).await {
                    Ok(old) if old.expired() => {
                        self.put_info(key, &meta, PutMode::Update(old.version)).await
                    }
                    Ok(_) => Err(StorageError::Exists),
                    Err(StorageError::NotFound) => Err(StorageError::Exists),
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    async fn write_at(&self, key: &str, pos: i64, data: &[u8]) -> Result<i64, StorageError> {
        if pos < 0 || pos % BLOCK_SIZE as i64 != 0 {
            warn!("{}: write at misaligned position {}", key, pos);
            return Err(StorageError::InvalidPos);
        }

        let entry = self.get_live_info(key).await?;
        let mut meta = entry.meta;

        check_write(&meta, pos, data.len())?;

        // Blocks first, metadata last.
        let mut block = pos / BLOCK_SIZE as i64;
        for chunk in data.chunks(BLOCK_SIZE) {
            let payload = PutPayload::from(Bytes::copy_from_slice(chunk));
            self.store
                .put(&self.object_path(&block_key(key, block)), payload)
                .await?;
            block += 1;
        }

        let next = fold_write(&mut meta, data)?;
        self.put_info(key, &meta, PutMode::Update(entry.version)).await?;
        Ok(next)
    }

    async fn read_at(&self, key: &str, buf: &mut [u8], pos: i64) -> Result<usize, StorageError> {
        if pos < 0 {
            return Err(StorageError::InvalidPos);
        }

        let entry = self.get_live_info(key).await?;
        let meta = entry.meta;

        if meta.cur_pos != FILE_COMPLETE {
            return Err(StorageError::Incomplete);
        }
        if pos > meta.length {
            return Err(StorageError::InvalidPos);
        }

        let mut want = buf.len().min((meta.length - pos) as usize);
        let mut block = pos / BLOCK_SIZE as i64;
        // The intra-block offset only applies to the first block: fetch its
        // tail with a range read, every later block whole.
        let mut offs = (pos % BLOCK_SIZE as i64) as usize;
        let mut filled = 0;

        while want > 0 {
            let path = self.object_path(&block_key(key, block));

            let fetch = if offs > 0 {
                let range = if want < BLOCK_SIZE - offs {
                    GetRange::Bounded(offs..offs + want)
                } else {
                    GetRange::Offset(offs)
                };
                let opts = GetOptions {
                    range: Some(range),
                    ..Default::default()
                };
                self.store.get_opts(&path, opts).await
            } else {
                self.store.get(&path).await
            };
            offs = 0;

            let data = match fetch {
                Ok(result) => result.bytes().await?,
                Err(object_store::Error::NotFound { .. }) => return Err(StorageError::NotFound),
                Err(e) => return Err(e.into()),
            };

            let n = data.len().min(want);
            if n == 0 {
                // A short or empty block inside the file means corruption.
                return Err(StorageError::NotFound);
            }

            buf[filled..filled + n].copy_from_slice(&data[..n]);
            filled += n;
            want -= n;
            block += 1;
        }

        Ok(filled)
    }

    async fn stat(&self, key: &str) -> Result<FileInfo, StorageError> {
        let entry = self.get_live_info(key).await?;
        Ok(FileInfo::from_meta(&entry.meta, entry.expires_at))
    }

    async fn delete_file(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&self.object_path(&info_key(key))).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        // Sweep every object of the logical key, including orphan blocks
        // left by interrupted writes.
        let want = prefix_key(key);
        let mut listing = self.store.list(self.list_prefix());

        while let Some(item) = listing.next().await {
            let object = match item {
                Ok(object) => object,
                Err(e) => {
                    warn!("{}: listing blocks: {}", key, e);
                    break;
                }
            };

            let Some(name) = object.location.filename() else {
                continue;
            };
            if !name.starts_with(&want) {
                continue;
            }

            if let Err(e) = self.store.delete(&object.location).await {
                warn!("{}: delete {}: {}", key, object.location, e);
            }
        }

        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<ScanEntry>, StorageError> {
        let mut entries = Vec::new();
        let mut listing = self.store.list(self.list_prefix());

        while let Some(item) = listing.next().await {
            let object = item?;
            let Some(name) = object.location.filename() else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            entries.push(ScanEntry {
                key: name.to_string(),
                size: object.size as i64,
                expires_at: Some(object.last_modified + self.ttl),
            });
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn gc(&self) -> Result<(), StorageError> {
        // Physical reaping is delegated to the bucket lifecycle rules.
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn memory_store(ttl: Duration) -> RemoteBlockStore {
        RemoteBlockStore::with_store(Arc::new(InMemory::new()), "data", ttl)
    }

    #[tokio::test]
    async fn test_create_is_conditional() {
        let store = memory_store(Duration::from_secs(60));

        store.create_file("k", "k", "", 5, None).await.unwrap();
        assert!(matches!(
            store.create_file("k", "k", "", 5, None).await,
            Err(StorageError::Exists)
        ));
    }

    #[tokio::test]
    async fn test_expired_record_reads_as_absent_and_can_be_reclaimed() {
        let store = memory_store(Duration::from_millis(50));

        store.create_file("k", "old", "", 5, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(matches!(
            store.stat("k").await,
            Err(StorageError::NotFound)
        ));

        store.create_file("k", "new", "", 7, None).await.unwrap();
        assert_eq!(store.stat("k").await.unwrap().name, "new");
    }

    #[tokio::test]
    async fn test_write_and_range_read() {
        let store = memory_store(Duration::from_secs(60));
        let b = BLOCK_SIZE;

        let body: Vec<u8> = (0..2 * b + 100).map(|i| (i % 251) as u8).collect();
        store
            .create_file("k", "k.bin", "application/octet-stream", body.len() as i64, None)
            .await
            .unwrap();

        assert_eq!(
            store.write_at("k", 0, &body[..b]).await.unwrap(),
            b as i64
        );
        assert_eq!(
            store.write_at("k", b as i64, &body[b..2 * b]).await.unwrap(),
            2 * b as i64
        );
        assert_eq!(
            store.write_at("k", 2 * b as i64, &body[2 * b..]).await.unwrap(),
            FILE_COMPLETE
        );

        // Partial first block, bounded inside it.
        let mut buf = vec![0u8; 200];
        assert_eq!(store.read_at("k", &mut buf, 100).await.unwrap(), 200);
        assert_eq!(&buf, &body[100..300]);

        // Partial first block spanning into the next one.
        let mut buf = vec![0u8; 100];
        let pos = b as i64 - 50;
        assert_eq!(store.read_at("k", &mut buf, pos).await.unwrap(), 100);
        assert_eq!(&buf, &body[b - 50..b + 50]);

        // Oversized buffer is clamped to the file end.
        let mut buf = vec![0u8; 3 * b];
        let pos = 2 * b as i64;
        assert_eq!(store.read_at("k", &mut buf, pos).await.unwrap(), 100);
        assert_eq!(&buf[..100], &body[2 * b..]);
    }

    #[tokio::test]
    async fn test_delete_sweeps_orphan_blocks() {
        let raw = Arc::new(InMemory::new());
        let store = RemoteBlockStore::with_store(raw.clone(), "data", Duration::from_secs(60));

        let b = BLOCK_SIZE;
        store
            .create_file("k", "k", "", (2 * b) as i64, None)
            .await
            .unwrap();
        store.write_at("k", 0, &vec![1u8; b]).await.unwrap();

        // An orphan block from an interrupted write of a past life.
        raw.put(
            &ObjectPath::from("data").child(block_key("k", 7).as_str()),
            PutPayload::from(Bytes::from_static(b"orphan")),
        )
        .await
        .unwrap();

        // A neighbour key sharing a string prefix must survive the sweep.
        store.create_file("k2", "k2", "", 5, None).await.unwrap();

        store.delete_file("k").await.unwrap();

        let keys: Vec<String> = store
            .scan("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["k2:i".to_string()]);

        // Idempotent.
        store.delete_file("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_writer_loses_the_version_compare() {
        let raw = Arc::new(InMemory::new());
        let a = RemoteBlockStore::with_store(raw.clone(), "data", Duration::from_secs(60));
        let b = RemoteBlockStore::with_store(raw, "data", Duration::from_secs(60));

        let block = vec![1u8; BLOCK_SIZE];
        a.create_file("k", "k", "", (2 * BLOCK_SIZE) as i64, None)
            .await
            .unwrap();

        // Writer A advances the cursor first.
        a.write_at("k", 0, &block).await.unwrap();

        // Writer B, still at the old cursor, must not advance it again.
        assert!(matches!(
            b.write_at("k", 0, &block).await,
            Err(StorageError::InvalidPos)
        ));
    }
}
