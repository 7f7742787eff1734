//! Blobstream - encrypted chunked-stream storage with HTTP range serving
//!
//! Content is stored as a sequence of fixed-capacity encrypted blobs,
//! addressed by content hash, and reconstructed on demand to satisfy HTTP
//! range requests. Repeated or restarted access never produces duplicate
//! materialized files and never re-downloads data already on disk.
//!
//! ## Architecture
//!
//! - **Blob**: immutable AES-256-CBC ciphertext chunk, identity = SHA-256
//! - **Stream descriptor**: ordered blob manifest, itself stored as a blob
//! - **Blob store**: flat content-addressed directory, one file per blob
//! - **Stream reader**: byte range -> blobs -> decrypt -> exact bytes
//! - **Stream manager**: download / materialize / delete lifecycle with
//!   restart-stable on-disk state
//!
//! Peer discovery and transfer are not part of this crate; they plug in
//! behind the [`source::BlobSource`] trait, as name resolution does behind
//! [`manager::NameResolver`].
//!
//! ## Storage layout
//!
//! ```text
//! ~/.local/share/blobstream/
//! ├── blobs/           # one file per blob, named by hex SHA-256
//! ├── downloads/       # materialized stream files
//! ├── registry.sled/   # durable stream records and name bindings
//! └── config.toml      # configuration
//! ```

pub mod blob;
pub mod blob_store;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod http;
pub mod manager;
pub mod reader;
pub mod registry;
pub mod source;

// Re-exports
pub use blob_store::BlobStore;
pub use config::Config;
pub use descriptor::{BlobInfo, StreamDescriptor};
pub use error::StoreError;
pub use http::HttpServer;
pub use manager::{NameResolver, RegistryResolver, StreamListing, StreamManager, StreamStatus};
pub use reader::StreamReader;
pub use registry::{StreamRecord, StreamRegistry};
pub use source::{BlobFetcher, BlobSource, RuntimeFlags};
