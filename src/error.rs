//! Error types for blobstream

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob not available locally or from any source: {0}")]
    BlobUnavailable(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Range not satisfiable: start {start} >= size {size}")]
    RangeNotSatisfiable { start: u64, size: u64 },

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Stream no longer available: {0}")]
    StreamDeleted(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Decryption error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
