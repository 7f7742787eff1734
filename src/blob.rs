//! Blob encryption and content addressing
//!
//! A blob is an immutable, content-addressed ciphertext chunk. Each blob
//! holds at most [`MAX_CHUNK_BYTES`] plaintext bytes, encrypted with
//! AES-256-CBC and PKCS#7 padding under a per-stream key and a per-blob IV.
//! A full chunk therefore encrypts to exactly [`MAX_BLOB_BYTES`] bytes of
//! ciphertext.
//!
//! Blob identity is the SHA-256 of the ciphertext, rendered as lowercase
//! hex. The hex string doubles as the blob's filename in the store.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Maximum ciphertext bytes per blob file (2MB)
pub const MAX_BLOB_BYTES: usize = 2 * 1024 * 1024;

/// Maximum plaintext bytes per blob. One byte below [`MAX_BLOB_BYTES`] so
/// that PKCS#7 padding of a full chunk lands exactly on the blob limit.
pub const MAX_CHUNK_BYTES: usize = MAX_BLOB_BYTES - 1;

/// AES cipher block size in bytes
pub const CIPHER_BLOCK_BYTES: usize = 16;

/// AES-256 key length in bytes
pub const KEY_BYTES: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Compute the hex SHA-256 hash of a byte slice
pub fn blob_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Generate a random AES-256 stream key
pub fn generate_key() -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate a random per-blob IV
pub fn generate_iv() -> [u8; CIPHER_BLOCK_BYTES] {
    let mut iv = [0u8; CIPHER_BLOCK_BYTES];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt one plaintext chunk into blob ciphertext
///
/// The chunk must fit in a single blob (`plaintext.len() <= MAX_CHUNK_BYTES`).
pub fn encrypt_chunk(
    key: &[u8; KEY_BYTES],
    iv: &[u8; CIPHER_BLOCK_BYTES],
    plaintext: &[u8],
) -> Result<Vec<u8>, StoreError> {
    if plaintext.len() > MAX_CHUNK_BYTES {
        return Err(StoreError::Crypto(format!(
            "chunk of {} bytes exceeds blob capacity {}",
            plaintext.len(),
            MAX_CHUNK_BYTES
        )));
    }

    let cipher = Aes256CbcEnc::new(key.into(), iv.into());
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt blob ciphertext back into the plaintext chunk
///
/// Strips the PKCS#7 padding; the returned length is the true plaintext
/// length recorded in the stream descriptor.
pub fn decrypt_chunk(
    key: &[u8; KEY_BYTES],
    iv: &[u8; CIPHER_BLOCK_BYTES],
    ciphertext: &[u8],
) -> Result<Vec<u8>, StoreError> {
    let cipher = Aes256CbcDec::new(key.into(), iv.into());
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| StoreError::Crypto(format!("unpad failed: {}", e)))
}
