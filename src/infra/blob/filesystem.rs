//! Filesystem blob store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<key[0..2]>/<key>.meta.json   tags, size, digest, timestamp
//! <root>/<key[0..2]>/<key>.bin         content
//! <root>/.staging/                      in-flight writes
//! ```
//!
//! Both files are written to `.staging`, fsynced and renamed into place with
//! the data file last. The data file's presence is what makes a blob visible,
//! so a reader never observes content without its metadata or a partial body.
//!
//! A put runs on its own task and holds the lock of its key's shard, so a
//! caller that stops waiting cannot leave a half-accounted write behind and
//! concurrent puts of one key store and charge it once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{AppError, BlobKey, BlobMetadata, BlobRef, BlobStore, BlobStoreError};

const STAGING_DIR: &str = ".staging";
const DATA_SUFFIX: &str = ".bin";
const META_SUFFIX: &str = ".meta.json";
const SHARDS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    tags: BlobMetadata,
    size_bytes: u64,
    content_sha256: String,
    stored_at: DateTime<Utc>,
}

impl Sidecar {
    fn into_ref(self, key: BlobKey) -> BlobRef {
        BlobRef {
            key,
            item_id: self.tags.item_id,
            filename: self.tags.filename,
            size_bytes: self.size_bytes,
            media_type: self.tags.media_type,
            content_sha256: self.content_sha256,
            stored_at: self.stored_at,
        }
    }
}

pub struct FsBlobStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    quota_bytes: Option<u64>,
    used_bytes: AtomicU64,
    in_flight: AtomicUsize,
    shard_locks: Vec<Mutex<()>>,
}

/// Bytes charged against the quota, handed back on drop unless committed.
struct Reservation<'a> {
    used_bytes: &'a AtomicU64,
    size: u64,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Saturating so a release never wraps the counter.
        let _ = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(self.size))
            });
    }
}

/// Counts a put from the moment it is accepted until its task finishes.
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FsBlobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// Leftover staging files from an interrupted write are removed and the
    /// bytes already stored are counted against `quota_bytes`.
    pub async fn open(root: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self, AppError> {
        let root = root.into();
        let used = prepare_root(&root).await?;
        info!(root = %root.display(), used_bytes = used, quota_bytes, "Blob store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                quota_bytes,
                used_bytes: AtomicU64::new(used),
                in_flight: AtomicUsize::new(0),
                shard_locks: (0..SHARDS).map(|_| Mutex::new(())).collect(),
            }),
        })
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.used_bytes.load(Ordering::Acquire)
    }

    /// Puts accepted but not yet finished, including ones whose caller gave up.
    pub fn writes_in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Keys reaching the store from persisted references are re-checked before
    /// they are turned into paths.
    fn check_key(key: &BlobKey) -> Result<(), BlobStoreError> {
        match BlobKey::parse(key.as_str()) {
            Some(_) => Ok(()),
            None => Err(BlobStoreError::InvalidKey(key.to_string())),
        }
    }
}

impl Inner {
    fn shard(key: &BlobKey) -> &str {
        &key.as_str()[..2]
    }

    fn shard_dir(&self, key: &BlobKey) -> PathBuf {
        self.root.join(Self::shard(key))
    }

    fn shard_lock(&self, key: &BlobKey) -> &Mutex<()> {
        let index = usize::from_str_radix(Self::shard(key), 16).unwrap_or_default();
        &self.shard_locks[index % SHARDS]
    }

    fn data_path(&self, key: &BlobKey) -> PathBuf {
        self.shard_dir(key).join(format!("{key}{DATA_SUFFIX}"))
    }

    fn meta_path(&self, key: &BlobKey) -> PathBuf {
        self.shard_dir(key).join(format!("{key}{META_SUFFIX}"))
    }

    fn reserve(&self, size: u64) -> Result<Reservation<'_>, BlobStoreError> {
        match self.quota_bytes {
            Some(quota) => {
                self.used_bytes
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                        used.checked_add(size).filter(|total| *total <= quota)
                    })
                    .map_err(|used| {
                        BlobStoreError::QuotaExceeded(format!(
                            "{size} bytes requested, {} of {quota} bytes free",
                            quota.saturating_sub(used)
                        ))
                    })?;
            }
            None => {
                self.used_bytes.fetch_add(size, Ordering::AcqRel);
            }
        }

        Ok(Reservation {
            used_bytes: &self.used_bytes,
            size,
            committed: false,
        })
    }

    async fn existing(&self, key: &BlobKey) -> Result<Option<BlobRef>, BlobStoreError> {
        if !tokio::fs::try_exists(self.data_path(key)).await? {
            return Ok(None);
        }
        let raw = tokio::fs::read(self.meta_path(key)).await?;
        let sidecar: Sidecar = serde_json::from_slice(&raw)
            .map_err(|e| BlobStoreError::CorruptMetadata(format!("{key}: {e}")))?;
        Ok(Some(sidecar.into_ref(key.clone())))
    }

    async fn put(
        &self,
        key: BlobKey,
        content: Bytes,
        metadata: BlobMetadata,
    ) -> Result<BlobRef, BlobStoreError> {
        let _shard = self.shard_lock(&key).lock().await;

        if let Some(existing) = self.existing(&key).await? {
            debug!("Blob already stored");
            return Ok(existing);
        }

        let size = content.len() as u64;
        let reservation = self.reserve(size)?;

        let sidecar = Sidecar {
            tags: metadata,
            size_bytes: size,
            content_sha256: hex::encode(Sha256::digest(&content)),
            stored_at: Utc::now(),
        };

        if let Err(e) = self.write(&key, &content, &sidecar).await {
            warn!(error = %e, "Blob write failed");
            return Err(e);
        }

        reservation.commit();
        debug!("Blob stored");
        Ok(sidecar.into_ref(key))
    }

    async fn write(
        &self,
        key: &BlobKey,
        content: &[u8],
        sidecar: &Sidecar,
    ) -> Result<(), BlobStoreError> {
        let staging = self.root.join(STAGING_DIR);
        let nonce = Uuid::new_v4();
        let meta_tmp = staging.join(format!("{key}-{nonce}{META_SUFFIX}"));
        let data_tmp = staging.join(format!("{key}-{nonce}{DATA_SUFFIX}"));

        let meta = serde_json::to_vec(sidecar)
            .map_err(|e| BlobStoreError::CorruptMetadata(e.to_string()))?;

        let result = async {
            write_synced(&meta_tmp, &meta).await?;
            write_synced(&data_tmp, content).await?;
            tokio::fs::create_dir_all(self.shard_dir(key)).await?;
            tokio::fs::rename(&meta_tmp, self.meta_path(key)).await?;
            tokio::fs::rename(&data_tmp, self.data_path(key)).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&meta_tmp).await;
            let _ = tokio::fs::remove_file(&data_tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let root = &self.inner.root;
        let staging = tokio::fs::metadata(root.join(STAGING_DIR))
            .await
            .map_err(BlobStoreError::from)?;
        if !staging.is_dir() {
            return Err(BlobStoreError::Unavailable(format!(
                "{} is not a directory",
                root.display()
            ))
            .into());
        }
        if staging.permissions().readonly() {
            return Err(BlobStoreError::Unavailable("blob root is read-only".to_string()).into());
        }
        Ok(())
    }

    #[instrument(skip(self, content, metadata), fields(blob_key = %key, size = content.len()))]
    async fn put(
        &self,
        key: &BlobKey,
        content: Bytes,
        metadata: &BlobMetadata,
    ) -> Result<BlobRef, AppError> {
        Self::check_key(key)?;
        if content.is_empty() {
            return Err(BlobStoreError::EmptyInput.into());
        }

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let in_flight = InFlight(Arc::clone(&self.inner));
        let (key, metadata) = (key.clone(), metadata.clone());

        let task = tokio::spawn(
            async move {
                let result = in_flight.0.put(key, content, metadata).await;
                drop(in_flight);
                result
            }
            .in_current_span(),
        );

        match task.await {
            Ok(result) => result.map_err(AppError::from),
            Err(e) => Err(BlobStoreError::Unavailable(format!("blob write task failed: {e}")).into()),
        }
    }

    #[instrument(skip(self), fields(blob_key = %key))]
    async fn get(&self, key: &BlobKey) -> Result<Option<Bytes>, AppError> {
        Self::check_key(key)?;
        match tokio::fs::read(self.inner.data_path(key)).await {
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobStoreError::from(e).into()),
        }
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

/// Creates the root and staging directories, clears stale staging files and
/// returns the number of content bytes already stored.
async fn prepare_root(root: &Path) -> Result<u64, BlobStoreError> {
    let staging = root.join(STAGING_DIR);
    tokio::fs::create_dir_all(&staging).await?;

    let mut stale = tokio::fs::read_dir(&staging).await?;
    while let Some(entry) = stale.next_entry().await? {
        warn!(path = %entry.path().display(), "Removing interrupted blob write");
        tokio::fs::remove_file(entry.path()).await?;
    }

    let mut used = 0u64;
    let mut shards = tokio::fs::read_dir(root).await?;
    while let Some(shard) = shards.next_entry().await? {
        if shard.file_name() == STAGING_DIR || !shard.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(shard.path()).await?;
        while let Some(file) = files.next_entry().await? {
            if file.file_name().to_string_lossy().ends_with(DATA_SUFFIX) {
                used += file.metadata().await?.len();
            }
        }
    }
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;

    struct TempRoot(PathBuf);

    impl TempRoot {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("item-service-blobs-{}", Uuid::new_v4())))
        }
    }

    impl Drop for TempRoot {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn metadata(item_id: Uuid) -> BlobMetadata {
        BlobMetadata {
            item_id,
            filename: format!("{item_id}.png"),
            media_type: "image/png".to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        let item_id = Uuid::new_v4();
        let content = Bytes::from_static(b"\x89PNG\r\n\x1a\nimage");
        let key = BlobKey::derive(item_id, &content);

        let blob = store.put(&key, content.clone(), &metadata(item_id)).await.unwrap();
        assert_eq!(blob.key, key);
        assert_eq!(blob.item_id, item_id);
        assert_eq!(blob.size_bytes, content.len() as u64);
        assert_eq!(blob.content_sha256, hex::encode(Sha256::digest(&content)));

        assert_eq!(store.get(&key).await.unwrap(), Some(content));
        assert_eq!(store.used_bytes(), blob.size_bytes);
    }

    #[tokio::test]
    async fn test_sidecar_carries_item_id_tag() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        let item_id = Uuid::new_v4();
        let key = BlobKey::derive(item_id, b"abc");

        store
            .put(&key, Bytes::from_static(b"abc"), &metadata(item_id))
            .await
            .unwrap();

        let raw = std::fs::read(store.inner.meta_path(&key)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["tags"]["itemId"], item_id.to_string());
    }

    #[tokio::test]
    async fn test_malformed_key_rejected() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        let key: BlobKey = serde_json::from_str("\"../../etc/passwd\"").unwrap();

        let err = store.get(&key).await.unwrap_err();
        assert!(matches!(err, AppError::BlobStore(BlobStoreError::InvalidKey(_))));
        let err = store
            .put(&key, Bytes::from_static(b"abc"), &metadata(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BlobStore(BlobStoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_get_missing_blob() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        let key = BlobKey::derive(Uuid::new_v4(), b"never stored");

        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        let item_id = Uuid::new_v4();
        let key = BlobKey::derive(item_id, b"");

        let err = store.put(&key, Bytes::new(), &metadata(item_id)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyInput);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        let item_id = Uuid::new_v4();
        let content = Bytes::from_static(b"same content");
        let key = BlobKey::derive(item_id, &content);

        let first = store.put(&key, content.clone(), &metadata(item_id)).await.unwrap();
        let second = store.put(&key, content, &metadata(item_id)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.used_bytes(), first.size_bytes);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, Some(10)).await.unwrap();
        let item_id = Uuid::new_v4();

        let small = Bytes::from_static(b"12345678");
        store
            .put(&BlobKey::derive(item_id, &small), small, &metadata(item_id))
            .await
            .unwrap();

        let big = Bytes::from_static(b"abcdef");
        let key = BlobKey::derive(item_id, &big);
        let err = store.put(&key, big, &metadata(item_id)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(store.used_bytes(), 8);
    }

    #[tokio::test]
    async fn test_reservation_released_unless_committed() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, Some(100)).await.unwrap();

        let reservation = store.inner.reserve(40).unwrap();
        assert_eq!(store.used_bytes(), 40);
        drop(reservation);
        assert_eq!(store.used_bytes(), 0);

        store.inner.reserve(40).unwrap().commit();
        assert_eq!(store.used_bytes(), 40);
        assert!(store.inner.reserve(61).is_err());
        assert_eq!(store.used_bytes(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_of_one_key_charge_once() {
        let root = TempRoot::new();
        let store = Arc::new(FsBlobStore::open(&root.0, Some(1_000_000)).await.unwrap());
        let item_id = Uuid::new_v4();
        let content = Bytes::from(vec![7u8; 200_000]);
        let key = BlobKey::derive(item_id, &content);

        let puts: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let (key, content) = (key.clone(), content.clone());
                tokio::spawn(async move { store.put(&key, content, &metadata(item_id)).await })
            })
            .collect();

        let mut refs = Vec::new();
        for put in puts {
            refs.push(put.await.unwrap().unwrap());
        }
        assert!(refs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(store.used_bytes(), 200_000);

        let reopened = FsBlobStore::open(&root.0, Some(1_000_000)).await.unwrap();
        assert_eq!(reopened.used_bytes(), store.used_bytes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_puts_keep_usage_in_step_with_disk() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, Some(64_000_000)).await.unwrap();
        let item_id = Uuid::new_v4();

        let mut keys = Vec::new();
        for step in 0..16u8 {
            let content = Bytes::from(vec![step; 1_000_000]);
            let key = BlobKey::derive(item_id, &content);
            let deadline = std::time::Duration::from_micros(u64::from(step) * 150);
            let _ = tokio::time::timeout(deadline, store.put(&key, content, &metadata(item_id))).await;
            keys.push(key);
        }

        for _ in 0..500 {
            if store.writes_in_flight() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(store.writes_in_flight(), 0);

        let mut on_disk = 0u64;
        for key in &keys {
            if let Some(content) = store.get(key).await.unwrap() {
                on_disk += content.len() as u64;
            }
        }
        assert_eq!(store.used_bytes(), on_disk);
        assert_eq!(
            std::fs::read_dir(root.0.join(STAGING_DIR)).unwrap().count(),
            0
        );

        let reopened = FsBlobStore::open(&root.0, Some(64_000_000)).await.unwrap();
        assert_eq!(reopened.used_bytes(), on_disk);
    }

    #[tokio::test]
    async fn test_reopen_counts_usage_and_clears_staging() {
        let root = TempRoot::new();
        let item_id = Uuid::new_v4();
        let content = Bytes::from_static(b"persisted bytes");
        let key = BlobKey::derive(item_id, &content);

        {
            let store = FsBlobStore::open(&root.0, None).await.unwrap();
            store.put(&key, content.clone(), &metadata(item_id)).await.unwrap();
        }
        std::fs::write(root.0.join(STAGING_DIR).join("half-written.bin"), b"junk").unwrap();

        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        assert_eq!(store.used_bytes(), content.len() as u64);
        assert_eq!(store.get(&key).await.unwrap(), Some(content));
        assert_eq!(
            std::fs::read_dir(root.0.join(STAGING_DIR)).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let root = TempRoot::new();
        let store = FsBlobStore::open(&root.0, None).await.unwrap();
        assert!(store.health_check().await.is_ok());

        std::fs::remove_dir_all(&root.0).unwrap();
        assert!(store.health_check().await.is_err());
    }
}
