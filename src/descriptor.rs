//! Stream descriptors and chunking
//!
//! A stream descriptor is the ordered manifest of the encrypted blobs that
//! compose one logical byte stream: per-blob content hash, IV, plaintext
//! length, and sequence index, plus the stream key and a suggested file
//! name. The descriptor serializes to JSON and is itself stored as a blob;
//! its hash (`sd_hash`) is the stream's identity. Once published it is
//! immutable: total size and chunk boundaries never change for a given
//! `sd_hash`.
//!
//! ## Served size vs raw size
//!
//! Every blob except the last holds exactly [`MAX_CHUNK_BYTES`] plaintext
//! bytes. Decrypted output is served padded out to the next length
//! congruent to 15 (mod 16) with zero bytes: a blob recording `L` plaintext
//! bytes serves `L + (15 - L % 16)` bytes. Full chunks are already at that
//! boundary (`MAX_CHUNK_BYTES % 16 == 15`), so in practice only the tail of
//! a stream is ever padded. Range requests and `Content-Length` are
//! computed against the padded (served) size; materialized files contain
//! only the raw plaintext.

use serde::{Deserialize, Serialize};

use crate::blob::{
    blob_hash, encrypt_chunk, generate_iv, generate_key, CIPHER_BLOCK_BYTES, KEY_BYTES,
    MAX_CHUNK_BYTES,
};
use crate::error::StoreError;

/// One blob's entry in a stream descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Hex SHA-256 of the blob ciphertext
    pub blob_hash: String,
    /// Hex AES IV for this blob
    pub iv: String,
    /// True plaintext length of this chunk
    pub plaintext_length: u64,
    /// 0-based, contiguous position in the stream
    pub sequence_index: u32,
}

/// Manifest of the blobs composing one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Hex AES-256 key shared by all blobs of the stream
    pub key: String,
    /// File name to use when the stream is materialized
    pub suggested_file_name: String,
    /// Blob entries ordered by `sequence_index`
    pub blobs: Vec<BlobInfo>,
}

/// A sub-range of one blob's served bytes, produced by range planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSlice {
    /// Index into `StreamDescriptor::blobs`
    pub blob_index: usize,
    /// Start offset within the blob's served bytes
    pub start: u64,
    /// End offset (exclusive) within the blob's served bytes
    pub end: u64,
}

/// Served length of a blob recording `plaintext_len` bytes: the next value
/// congruent to 15 (mod 16), padded with zeros past the true plaintext.
pub fn served_blob_len(plaintext_len: u64) -> u64 {
    if plaintext_len == 0 {
        0
    } else {
        plaintext_len + (15 - plaintext_len % 16)
    }
}

impl StreamDescriptor {
    /// Chunk and encrypt a plaintext into blobs, producing the descriptor
    /// and the ordered `(hash, ciphertext)` pairs to store.
    pub fn create_stream(
        plaintext: &[u8],
        suggested_file_name: &str,
    ) -> Result<(StreamDescriptor, Vec<(String, Vec<u8>)>), StoreError> {
        let key = generate_key();
        let mut blobs = Vec::new();
        let mut encrypted = Vec::new();

        for (index, chunk) in plaintext.chunks(MAX_CHUNK_BYTES).enumerate() {
            let iv = generate_iv();
            let ciphertext = encrypt_chunk(&key, &iv, chunk)?;
            let hash = blob_hash(&ciphertext);

            blobs.push(BlobInfo {
                blob_hash: hash.clone(),
                iv: hex::encode(iv),
                plaintext_length: chunk.len() as u64,
                sequence_index: index as u32,
            });
            encrypted.push((hash, ciphertext));
        }

        let descriptor = StreamDescriptor {
            key: hex::encode(key),
            suggested_file_name: suggested_file_name.to_string(),
            blobs,
        };
        Ok((descriptor, encrypted))
    }

    /// Serialize to the canonical JSON bytes stored as the sd blob
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a descriptor from sd blob bytes, validating its invariants
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        let descriptor: StreamDescriptor = serde_json::from_slice(data)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Hash of the serialized descriptor: the stream's identity
    pub fn sd_hash(&self) -> Result<String, StoreError> {
        Ok(blob_hash(&self.to_bytes()?))
    }

    /// Check index contiguity and chunk-size invariants
    pub fn validate(&self) -> Result<(), StoreError> {
        for (i, info) in self.blobs.iter().enumerate() {
            if info.sequence_index as usize != i {
                return Err(StoreError::InvalidDescriptor(format!(
                    "blob at position {} has sequence_index {}",
                    i, info.sequence_index
                )));
            }
            let is_last = i == self.blobs.len() - 1;
            if !is_last && info.plaintext_length != MAX_CHUNK_BYTES as u64 {
                return Err(StoreError::InvalidDescriptor(format!(
                    "non-terminal blob {} has length {}",
                    i, info.plaintext_length
                )));
            }
            if info.plaintext_length > MAX_CHUNK_BYTES as u64 {
                return Err(StoreError::InvalidDescriptor(format!(
                    "blob {} exceeds chunk capacity: {}",
                    i, info.plaintext_length
                )));
            }
        }
        Ok(())
    }

    /// Total raw plaintext size (what a materialized file contains)
    pub fn raw_size(&self) -> u64 {
        self.blobs.iter().map(|b| b.plaintext_length).sum()
    }

    /// Total served size (what `Content-Length` reports)
    pub fn served_size(&self) -> u64 {
        self.blobs
            .iter()
            .map(|b| served_blob_len(b.plaintext_length))
            .sum()
    }

    /// Decode the stream key
    pub fn key_bytes(&self) -> Result<[u8; KEY_BYTES], StoreError> {
        let raw = hex::decode(&self.key)
            .map_err(|e| StoreError::InvalidDescriptor(format!("bad key hex: {}", e)))?;
        raw.try_into()
            .map_err(|_| StoreError::InvalidDescriptor("key is not 32 bytes".into()))
    }

    /// Decode one blob's IV
    pub fn iv_bytes(&self, blob_index: usize) -> Result<[u8; CIPHER_BLOCK_BYTES], StoreError> {
        let raw = hex::decode(&self.blobs[blob_index].iv)
            .map_err(|e| StoreError::InvalidDescriptor(format!("bad iv hex: {}", e)))?;
        raw.try_into()
            .map_err(|_| StoreError::InvalidDescriptor("iv is not 16 bytes".into()))
    }

    /// Map a served-byte range `[start, end)` to per-blob sub-ranges
    ///
    /// Walks the prefix sums of the served blob lengths and returns the
    /// intersecting blobs in sequence order. Streams are bounded to ~a few
    /// thousand blobs, so the linear walk is fine.
    pub fn blob_slices(&self, start: u64, end: u64) -> Vec<BlobSlice> {
        let mut slices = Vec::new();
        let mut offset = 0u64;

        for (blob_index, info) in self.blobs.iter().enumerate() {
            let served = served_blob_len(info.plaintext_length);
            let blob_start = offset;
            let blob_end = offset + served;
            offset = blob_end;

            if blob_end <= start {
                continue;
            }
            if blob_start >= end {
                break;
            }

            slices.push(BlobSlice {
                blob_index,
                start: start.max(blob_start) - blob_start,
                end: end.min(blob_end) - blob_start,
            });
        }

        slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::decrypt_chunk;

    const C: u64 = MAX_CHUNK_BYTES as u64;

    /// Descriptor with the given per-blob plaintext lengths (dummy hashes)
    fn synthetic(lengths: &[u64]) -> StreamDescriptor {
        StreamDescriptor {
            key: hex::encode([0u8; 32]),
            suggested_file_name: "synthetic".into(),
            blobs: lengths
                .iter()
                .enumerate()
                .map(|(i, &len)| BlobInfo {
                    blob_hash: format!("{:064x}", i),
                    iv: hex::encode([0u8; 16]),
                    plaintext_length: len,
                    sequence_index: i as u32,
                })
                .collect(),
        }
    }

    #[test]
    fn test_served_blob_len_literals() {
        assert_eq!(served_blob_len(0), 0);
        assert_eq!(served_blob_len(2), 15);
        assert_eq!(served_blob_len(15), 15);
        assert_eq!(served_blob_len(16), 31);
        assert_eq!(served_blob_len(C), C);
        assert_eq!(served_blob_len(C - 1), C);
        assert_eq!(served_blob_len(C - 15), C);
        assert_eq!(served_blob_len(C - 16), C - 16);
    }

    #[test]
    fn test_served_blob_len_is_15_mod_16() {
        for len in 1..=4096u64 {
            let served = served_blob_len(len);
            assert_eq!(served % 16, 15, "len {}", len);
            assert!(served >= len);
            assert!(served - len < 16);
        }
    }

    #[test]
    fn test_served_size_single_blob_stream() {
        assert_eq!(synthetic(&[2]).served_size(), 15);
        assert_eq!(synthetic(&[15]).served_size(), 15);
    }

    #[test]
    fn test_served_size_four_blob_literals() {
        // Four full chunks: no padding anywhere
        assert_eq!(synthetic(&[C, C, C, C]).served_size(), 4 * C);
        // Short tails within the last cipher block pad up to 4C
        for short in [1, 2, 14, 15] {
            let desc = synthetic(&[C, C, C, C - short]);
            assert_eq!(desc.served_size(), 4 * C, "short {}", short);
            assert_eq!(desc.raw_size(), 4 * C - short);
        }
        // A tail one full block short is already aligned: no padding
        let desc = synthetic(&[C, C, C, C - 16]);
        assert_eq!(desc.served_size(), 4 * C - 16);
    }

    #[test]
    fn test_create_stream_single_blob() {
        let data = b"hi";
        let (descriptor, blobs) = StreamDescriptor::create_stream(data, "hi.bin").unwrap();

        assert_eq!(descriptor.blobs.len(), 1);
        assert_eq!(descriptor.blobs[0].plaintext_length, 2);
        assert_eq!(descriptor.blobs[0].sequence_index, 0);
        assert_eq!(descriptor.raw_size(), 2);
        assert_eq!(descriptor.served_size(), 15);

        let (hash, ciphertext) = &blobs[0];
        assert_eq!(*hash, blob_hash(ciphertext));
        assert_eq!(descriptor.blobs[0].blob_hash, *hash);

        let key = descriptor.key_bytes().unwrap();
        let iv = descriptor.iv_bytes(0).unwrap();
        assert_eq!(decrypt_chunk(&key, &iv, ciphertext).unwrap(), data);
    }

    #[test]
    fn test_create_stream_chunks_at_capacity() {
        // 2 full chunks plus a 3-byte tail
        let data = vec![7u8; MAX_CHUNK_BYTES * 2 + 3];
        let (descriptor, blobs) = StreamDescriptor::create_stream(&data, "big.bin").unwrap();

        assert_eq!(descriptor.blobs.len(), 3);
        assert_eq!(blobs.len(), 3);
        assert_eq!(descriptor.blobs[0].plaintext_length, C);
        assert_eq!(descriptor.blobs[1].plaintext_length, C);
        assert_eq!(descriptor.blobs[2].plaintext_length, 3);
        assert_eq!(descriptor.raw_size(), data.len() as u64);
        descriptor.validate().unwrap();
    }

    #[test]
    fn test_descriptor_round_trip_and_sd_hash() {
        let (descriptor, _) = StreamDescriptor::create_stream(b"round trip", "rt.bin").unwrap();
        let bytes = descriptor.to_bytes().unwrap();
        let parsed = StreamDescriptor::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.sd_hash().unwrap(), descriptor.sd_hash().unwrap());
        assert_eq!(parsed.blobs[0].blob_hash, descriptor.blobs[0].blob_hash);
    }

    #[test]
    fn test_validate_rejects_bad_descriptors() {
        let mut gap = synthetic(&[C, 5]);
        gap.blobs[1].sequence_index = 2;
        assert!(gap.validate().is_err());

        let short_middle = synthetic(&[C - 1, 5]);
        assert!(short_middle.validate().is_err());
    }

    #[test]
    fn test_blob_slices_full_range() {
        let desc = synthetic(&[C, C, 100]);
        let total = desc.served_size();
        let slices = desc.blob_slices(0, total);

        assert_eq!(
            slices,
            vec![
                BlobSlice { blob_index: 0, start: 0, end: C },
                BlobSlice { blob_index: 1, start: 0, end: C },
                BlobSlice { blob_index: 2, start: 0, end: served_blob_len(100) },
            ]
        );
    }

    #[test]
    fn test_blob_slices_crossing_boundary() {
        let desc = synthetic(&[C, C, 100]);
        let slices = desc.blob_slices(C - 10, C + 20);

        assert_eq!(
            slices,
            vec![
                BlobSlice { blob_index: 0, start: C - 10, end: C },
                BlobSlice { blob_index: 1, start: 0, end: 20 },
            ]
        );
    }

    #[test]
    fn test_blob_slices_within_one_blob() {
        let desc = synthetic(&[C, C, 100]);
        let slices = desc.blob_slices(C + 5, C + 25);
        assert_eq!(
            slices,
            vec![BlobSlice { blob_index: 1, start: 5, end: 25 }]
        );
    }

    #[test]
    fn test_blob_slices_empty_past_end() {
        let desc = synthetic(&[15]);
        assert!(desc.blob_slices(15, 30).is_empty());
    }
}
