//! Content-addressed blob storage
//!
//! Stores blobs in a single flat directory using hex SHA-256 hashes as
//! filenames. The file count of that directory is an observable invariant:
//! one file per resident blob, nothing else, so callers (and tests) can
//! audit residency by listing it.
//!
//! Writes are verify-then-rename: the ciphertext is hashed before anything
//! touches disk, written to a temp file, and renamed into place, so a crash
//! never leaves a partial blob visible under a valid hash.

use crate::blob::blob_hash;
use crate::error::StoreError;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Blob storage manager
pub struct BlobStore {
    /// Directory holding one file per blob
    blob_dir: PathBuf,
}

impl BlobStore {
    /// Create a blob store over the given directory
    pub async fn new<P: AsRef<Path>>(blob_dir: P) -> Result<Self, StoreError> {
        let blob_dir = blob_dir.as_ref().to_path_buf();
        fs::create_dir_all(&blob_dir).await?;

        info!(path = %blob_dir.display(), "Initialized blob store");

        Ok(Self { blob_dir })
    }

    /// Create a blob store in a throwaway temp directory (for tests)
    pub async fn new_memory() -> Result<Self, StoreError> {
        let temp_dir = std::env::temp_dir().join(format!("blobstream-{}", uuid::Uuid::new_v4()));
        Self::new(temp_dir).await
    }

    /// Path of the blob file for a hash
    pub fn blob_path(&self, hash: &str) -> PathBuf {
        self.blob_dir.join(hash)
    }

    /// Store a blob under its claimed hash
    ///
    /// Verifies the content against the claimed hash before writing; a
    /// mismatch rejects the blob without touching disk. Re-storing an
    /// existing blob is a no-op.
    pub async fn put(&self, hash: &str, data: &[u8]) -> Result<(), StoreError> {
        let computed = blob_hash(data);
        if computed != hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: computed,
            });
        }

        let blob_path = self.blob_path(hash);
        if fs::metadata(&blob_path).await.is_ok() {
            debug!(hash = %hash, "Blob already resident");
            return Ok(());
        }

        let tmp_path = self
            .blob_dir
            .join(format!(".{}.tmp-{}", hash, uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp_path, &blob_path).await?;

        debug!(hash = %hash, size = data.len(), "Stored blob");
        Ok(())
    }

    /// Retrieve a blob by hash; `None` when not resident
    pub async fn get(&self, hash: &str) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.blob_path(hash)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a blob is resident
    pub async fn contains(&self, hash: &str) -> bool {
        fs::metadata(self.blob_path(hash)).await.is_ok()
    }

    /// Delete a blob; deleting an absent blob is not an error
    pub async fn delete(&self, hash: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => {
                debug!(hash = %hash, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate the hashes of all resident blobs
    ///
    /// Used at startup to reconcile stream records against what actually
    /// survived on disk. Temp files from interrupted writes are skipped.
    pub async fn enumerate_resident(&self) -> Result<HashSet<String>, StoreError> {
        let mut hashes = HashSet::new();
        let mut entries = fs::read_dir(&self.blob_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                hashes.insert(name);
            }
        }
        Ok(hashes)
    }

    /// Count of resident blob files
    pub async fn resident_count(&self) -> Result<usize, StoreError> {
        Ok(self.enumerate_resident().await?.len())
    }

    /// Storage statistics
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut total_blobs = 0u64;
        let mut total_bytes = 0u64;

        let mut entries = fs::read_dir(&self.blob_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit()) {
                total_blobs += 1;
                if let Ok(metadata) = entry.metadata().await {
                    total_bytes += metadata.len();
                }
            }
        }

        Ok(StoreStats {
            total_blobs,
            total_bytes,
        })
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_blobs: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"some ciphertext";
        let hash = blob_hash(data);
        store.put(&hash, data).await.unwrap();

        let retrieved = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(&retrieved[..], data);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let missing = blob_hash(b"never stored");
        assert!(store.get(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_hash_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let claimed = blob_hash(b"claimed content");
        let err = store.put(&claimed, b"actual content").await.unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));

        // Nothing was written
        assert_eq!(store.resident_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"idempotent";
        let hash = blob_hash(data);
        store.put(&hash, data).await.unwrap();
        store.put(&hash, data).await.unwrap();

        assert_eq!(store.resident_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let data = b"to delete";
        let hash = blob_hash(data);
        store.put(&hash, data).await.unwrap();

        store.delete(&hash).await.unwrap();
        store.delete(&hash).await.unwrap();
        assert!(!store.contains(&hash).await);
    }

    #[tokio::test]
    async fn test_enumerate_resident() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::new(temp_dir.path()).await.unwrap();

        let mut expected = HashSet::new();
        for i in 0..3u8 {
            let data = vec![i; 10];
            let hash = blob_hash(&data);
            store.put(&hash, &data).await.unwrap();
            expected.insert(hash);
        }

        assert_eq!(store.enumerate_resident().await.unwrap(), expected);
    }
}
