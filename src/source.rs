//! Blob acquisition
//!
//! The peer network that discovers and transfers blobs lives outside this
//! crate; it is consumed through the [`BlobSource`] trait ("give me the
//! bytes for this hash, however long that takes"). [`BlobFetcher`] layers
//! the local store over a source: resident blobs are returned immediately,
//! misses go to the source with per-hash single-flight so concurrent
//! requests for the same blob do not race, and fetched bytes are verified
//! against the claimed hash before anyone sees them.
//!
//! Whether a fetched blob is retained in the store is decided by the
//! `save_blobs` runtime flag at fetch time, so flipping the flag affects
//! subsequent fetches without disturbing blobs already on disk.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::blob::blob_hash;
use crate::blob_store::BlobStore;
use crate::error::StoreError;

/// External collaborator that can produce blob bytes by hash
///
/// Implementations may block on network I/O; callers treat a pending fetch
/// as a suspended operation, not an error.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch_blob(&self, hash: &str) -> Result<Bytes, StoreError>;
}

/// Source with nothing to offer; every miss is unavailable
///
/// Used by nodes that only serve locally published streams.
pub struct NullSource;

#[async_trait]
impl BlobSource for NullSource {
    async fn fetch_blob(&self, hash: &str) -> Result<Bytes, StoreError> {
        Err(StoreError::BlobUnavailable(hash.to_string()))
    }
}

/// In-memory source, used by tests as a stand-in for the peer network
#[derive(Default)]
pub struct MemorySource {
    blobs: DashMap<String, Bytes>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the source with a blob
    pub fn insert(&self, hash: String, data: impl Into<Bytes>) {
        self.blobs.insert(hash, data.into());
    }

    /// Remove a blob from the source
    pub fn remove(&self, hash: &str) {
        self.blobs.remove(hash);
    }
}

#[async_trait]
impl BlobSource for MemorySource {
    async fn fetch_blob(&self, hash: &str) -> Result<Bytes, StoreError> {
        self.blobs
            .get(hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::BlobUnavailable(hash.to_string()))
    }
}

/// Runtime-toggleable behavior flags shared across the daemon
///
/// Backed by atomics so toggles apply to subsequent operations without
/// restarting anything or revisiting state already on disk.
pub struct RuntimeFlags {
    save_blobs: AtomicBool,
    streaming_only: AtomicBool,
}

impl RuntimeFlags {
    pub fn new(save_blobs: bool, streaming_only: bool) -> Self {
        Self {
            save_blobs: AtomicBool::new(save_blobs),
            streaming_only: AtomicBool::new(streaming_only),
        }
    }

    pub fn save_blobs(&self) -> bool {
        self.save_blobs.load(Ordering::Relaxed)
    }

    pub fn set_save_blobs(&self, value: bool) {
        self.save_blobs.store(value, Ordering::Relaxed);
    }

    pub fn streaming_only(&self) -> bool {
        self.streaming_only.load(Ordering::Relaxed)
    }

    pub fn set_streaming_only(&self, value: bool) {
        self.streaming_only.store(value, Ordering::Relaxed);
    }
}

/// Store-first blob lookup with single-flight network fetch
pub struct BlobFetcher {
    store: Arc<BlobStore>,
    source: Arc<dyn BlobSource>,
    flags: Arc<RuntimeFlags>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl BlobFetcher {
    pub fn new(store: Arc<BlobStore>, source: Arc<dyn BlobSource>, flags: Arc<RuntimeFlags>) -> Self {
        Self {
            store,
            source,
            flags,
            inflight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Get blob bytes, fetching from the source on a local miss
    ///
    /// Fetched bytes whose hash does not match are rejected and never
    /// stored; retrying is the source's business, not ours.
    pub async fn fetch(&self, hash: &str) -> Result<Bytes, StoreError> {
        if let Some(data) = self.store.get(hash).await? {
            return Ok(data);
        }

        let gate = self
            .inflight
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another request may have completed the fetch while we waited
        if let Some(data) = self.store.get(hash).await? {
            self.inflight.remove(hash);
            return Ok(data);
        }

        let result = self.fetch_verified(hash).await;
        self.inflight.remove(hash);
        result
    }

    async fn fetch_verified(&self, hash: &str) -> Result<Bytes, StoreError> {
        debug!(hash = %hash, "Fetching blob from source");
        let data = self.source.fetch_blob(hash).await?;

        let computed = blob_hash(&data);
        if computed != hash {
            warn!(expected = %hash, actual = %computed, "Rejected blob with wrong hash");
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: computed,
            });
        }

        if self.flags.save_blobs() {
            self.store.put(hash, &data).await?;
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_persists_when_saving() {
        let source = Arc::new(MemorySource::new());
        let data = Bytes::from_static(b"remote blob");
        let hash = blob_hash(&data);
        source.insert(hash.clone(), data.clone());

        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(true, true));
        let fetcher = BlobFetcher::new(store.clone(), source, flags);

        let fetched = fetcher.fetch(&hash).await.unwrap();
        assert_eq!(fetched, data);
        assert!(store.contains(&hash).await);
    }

    #[tokio::test]
    async fn test_fetch_transient_when_not_saving() {
        let source = Arc::new(MemorySource::new());
        let data = Bytes::from_static(b"transient blob");
        let hash = blob_hash(&data);
        source.insert(hash.clone(), data.clone());

        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(false, true));
        let fetcher = BlobFetcher::new(store.clone(), source, flags);

        let fetched = fetcher.fetch(&hash).await.unwrap();
        assert_eq!(fetched, data);
        assert!(!store.contains(&hash).await);
    }

    #[tokio::test]
    async fn test_fetch_rejects_corrupt_source() {
        let source = Arc::new(MemorySource::new());
        let good = Bytes::from_static(b"expected content");
        let hash = blob_hash(&good);
        source.insert(hash.clone(), Bytes::from_static(b"tampered content"));

        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(true, true));
        let fetcher = BlobFetcher::new(store.clone(), source, flags);

        let err = fetcher.fetch(&hash).await.unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(!store.contains(&hash).await);
    }

    #[tokio::test]
    async fn test_fetch_miss_is_unavailable() {
        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(true, true));
        let fetcher = BlobFetcher::new(store, Arc::new(NullSource), flags);

        let missing = blob_hash(b"nowhere");
        let err = fetcher.fetch(&missing).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobUnavailable(_)));
    }

    #[tokio::test]
    async fn test_toggle_save_blobs_applies_to_next_fetch() {
        let source = Arc::new(MemorySource::new());
        let data = Bytes::from_static(b"toggled blob");
        let hash = blob_hash(&data);
        source.insert(hash.clone(), data.clone());

        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(false, true));
        let fetcher = BlobFetcher::new(store.clone(), source, flags.clone());

        fetcher.fetch(&hash).await.unwrap();
        assert!(!store.contains(&hash).await);

        flags.set_save_blobs(true);
        fetcher.fetch(&hash).await.unwrap();
        assert!(store.contains(&hash).await);
    }
}
