//! Stream reconstruction and range reads
//!
//! [`StreamReader`] turns a served-byte range into decrypted output using
//! only the descriptor and the blob fetcher. For each intersecting blob it
//! pulls the ciphertext (possibly suspending on the network source),
//! decrypts, zero-pads the tail up to the blob's served length, and slices
//! out the requested sub-range. Output is produced blob-by-blob as a
//! `Stream` of [`Bytes`] frames so a multi-megabyte read never sits fully
//! in memory.
//!
//! Deletion of the owning stream is observed between blobs: an in-flight
//! read fails with `StreamDeleted` instead of completing against data that
//! is being removed.

use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use std::sync::Arc;
use tokio::sync::watch;

use crate::blob::{decrypt_chunk, CIPHER_BLOCK_BYTES, KEY_BYTES};
use crate::descriptor::{served_blob_len, BlobSlice, StreamDescriptor};
use crate::error::StoreError;
use crate::source::BlobFetcher;

/// Range reader over one stream
pub struct StreamReader {
    descriptor: Arc<StreamDescriptor>,
    fetcher: Arc<BlobFetcher>,
    key: [u8; KEY_BYTES],
    deleted: watch::Receiver<bool>,
}

impl StreamReader {
    pub fn new(
        descriptor: Arc<StreamDescriptor>,
        fetcher: Arc<BlobFetcher>,
        deleted: watch::Receiver<bool>,
    ) -> Result<Self, StoreError> {
        let key = descriptor.key_bytes()?;
        Ok(Self {
            descriptor,
            fetcher,
            key,
            deleted,
        })
    }

    fn check_live(&self) -> Result<(), StoreError> {
        if *self.deleted.borrow() {
            return Err(StoreError::StreamDeleted(
                self.descriptor.suggested_file_name.clone(),
            ));
        }
        Ok(())
    }

    /// Fetch and decrypt one blob, returning its true (unpadded) plaintext
    pub async fn read_blob(&self, blob_index: usize) -> Result<Bytes, StoreError> {
        self.check_live()?;

        let info = &self.descriptor.blobs[blob_index];
        let mut deleted = self.deleted.clone();

        let ciphertext = tokio::select! {
            result = self.fetcher.fetch(&info.blob_hash) => result?,
            _ = deleted.wait_for(|gone| *gone) => {
                return Err(StoreError::StreamDeleted(
                    self.descriptor.suggested_file_name.clone(),
                ));
            }
        };

        let iv: [u8; CIPHER_BLOCK_BYTES] = self.descriptor.iv_bytes(blob_index)?;
        let plaintext = decrypt_chunk(&self.key, &iv, &ciphertext)?;

        if plaintext.len() as u64 != info.plaintext_length {
            return Err(StoreError::InvalidDescriptor(format!(
                "blob {} decrypted to {} bytes, descriptor records {}",
                info.blob_hash,
                plaintext.len(),
                info.plaintext_length
            )));
        }

        Ok(Bytes::from(plaintext))
    }

    /// Read one blob's served sub-range: plaintext zero-padded out to the
    /// blob's served length, then sliced to `[slice.start, slice.end)`.
    async fn read_served_slice(&self, slice: &BlobSlice) -> Result<Bytes, StoreError> {
        let plaintext = self.read_blob(slice.blob_index).await?;
        let served = served_blob_len(plaintext.len() as u64);
        debug_assert!(slice.end <= served);

        let start = slice.start as usize;
        let end = slice.end as usize;
        let mut out = BytesMut::with_capacity(end - start);
        if start < plaintext.len() {
            out.extend_from_slice(&plaintext[start..end.min(plaintext.len())]);
        }
        // Zero padding past the true plaintext, up to the served boundary
        out.resize(end - start, 0);
        Ok(out.freeze())
    }

    /// Read a served-byte range into one buffer (small ranges, tests)
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes, StoreError> {
        let mut out = BytesMut::with_capacity(end.saturating_sub(start) as usize);
        for slice in self.descriptor.blob_slices(start, end) {
            out.extend_from_slice(&self.read_served_slice(&slice).await?);
        }
        Ok(out.freeze())
    }

    /// Stream a served-byte range as one `Bytes` frame per blob
    ///
    /// The stream ends after the range is exhausted, or directly after
    /// yielding an error.
    pub fn into_stream(
        self,
        start: u64,
        end: u64,
    ) -> impl Stream<Item = Result<Bytes, StoreError>> + Send {
        let slices = self.descriptor.blob_slices(start, end);
        futures_util::stream::unfold(
            (self, slices.into_iter(), false),
            |(reader, mut slices, failed)| async move {
                if failed {
                    return None;
                }
                let slice = slices.next()?;
                let item = reader.read_served_slice(&slice).await;
                let failed = item.is_err();
                Some((item, (reader, slices, failed)))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::blob_hash;
    use crate::blob_store::BlobStore;
    use crate::source::{MemorySource, NullSource, RuntimeFlags};
    use futures_util::StreamExt;

    async fn reader_for(
        data: &[u8],
    ) -> (StreamReader, Arc<StreamDescriptor>, watch::Sender<bool>) {
        let (descriptor, blobs) = StreamDescriptor::create_stream(data, "test.bin").unwrap();
        let descriptor = Arc::new(descriptor);

        let source = Arc::new(MemorySource::new());
        for (hash, ciphertext) in blobs {
            source.insert(hash, ciphertext);
        }

        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(false, true));
        let fetcher = Arc::new(BlobFetcher::new(store, source, flags));

        let (deleted_tx, deleted_rx) = watch::channel(false);
        let reader = StreamReader::new(descriptor.clone(), fetcher, deleted_rx).unwrap();
        (reader, descriptor, deleted_tx)
    }

    #[tokio::test]
    async fn test_full_read_pads_with_zeros() {
        let (reader, descriptor, _tx) = reader_for(b"hi").await;
        assert_eq!(descriptor.served_size(), 15);

        let body = reader.read_range(0, 15).await.unwrap();
        assert_eq!(&body[..2], b"hi");
        assert_eq!(&body[2..], &[0u8; 13][..]);
    }

    #[tokio::test]
    async fn test_aligned_tail_serves_exact_bytes() {
        let data = b"123456789abcdef";
        let (reader, descriptor, _tx) = reader_for(data).await;
        assert_eq!(descriptor.served_size(), 15);

        let body = reader.read_range(0, 15).await.unwrap();
        assert_eq!(&body[..], data);
    }

    #[tokio::test]
    async fn test_sub_range_within_blob() {
        let (reader, _descriptor, _tx) = reader_for(b"0123456789").await;

        let body = reader.read_range(2, 6).await.unwrap();
        assert_eq!(&body[..], b"2345");
    }

    #[tokio::test]
    async fn test_sub_range_into_padding() {
        // 10 data bytes, served size 15: range [8, 15) is 2 data + 5 zeros
        let (reader, _descriptor, _tx) = reader_for(b"0123456789").await;

        let body = reader.read_range(8, 15).await.unwrap();
        assert_eq!(&body[..], &[b'8', b'9', 0, 0, 0, 0, 0][..]);
    }

    #[tokio::test]
    async fn test_streamed_frames_concatenate_to_read() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let (reader, descriptor, _tx) = reader_for(&data).await;
        let total = descriptor.served_size();

        let frames: Vec<_> = reader.into_stream(0, total).collect().await;
        let mut assembled = Vec::new();
        for frame in frames {
            assembled.extend_from_slice(&frame.unwrap());
        }

        assert_eq!(assembled.len() as u64, total);
        assert_eq!(&assembled[..data.len()], &data[..]);
        assert!(assembled[data.len()..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_deleted_stream_fails_read() {
        let (reader, _descriptor, deleted_tx) = reader_for(b"going away").await;
        deleted_tx.send(true).unwrap();

        let err = reader.read_range(0, 15).await.unwrap_err();
        assert!(matches!(err, StoreError::StreamDeleted(_)));
    }

    #[tokio::test]
    async fn test_delete_cancels_blocked_fetch() {
        // A source with no blobs and a fetcher that would block forever is
        // modeled by NullSource erroring; deletion must win the race when
        // signaled before the read starts.
        let (descriptor, _) = StreamDescriptor::create_stream(b"hi", "x.bin").unwrap();
        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(false, true));
        let fetcher = Arc::new(BlobFetcher::new(store, Arc::new(NullSource), flags));

        let (deleted_tx, deleted_rx) = watch::channel(true);
        let reader = StreamReader::new(Arc::new(descriptor), fetcher, deleted_rx).unwrap();
        drop(deleted_tx);

        let err = reader.read_range(0, 15).await.unwrap_err();
        assert!(matches!(err, StoreError::StreamDeleted(_)));
    }

    #[tokio::test]
    async fn test_missing_blob_is_unavailable() {
        let (descriptor, _) = StreamDescriptor::create_stream(b"hi", "x.bin").unwrap();
        let store = Arc::new(BlobStore::new_memory().await.unwrap());
        let flags = Arc::new(RuntimeFlags::new(false, true));
        let fetcher = Arc::new(BlobFetcher::new(store, Arc::new(NullSource), flags));

        let (_tx, deleted_rx) = watch::channel(false);
        let reader = StreamReader::new(Arc::new(descriptor), fetcher, deleted_rx).unwrap();

        let err = reader.read_range(0, 15).await.unwrap_err();
        assert!(matches!(err, StoreError::BlobUnavailable(_)));
    }
}
