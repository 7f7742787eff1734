//! Stream lifecycle management
//!
//! Owns every known stream from first resolution to deletion:
//!
//! - `Downloading` - descriptor known, some blobs not yet resident
//! - `Available` - every blob resident (or stream is served transiently)
//! - `FileSaved` - plaintext materialized to a single file on disk
//! - `Deleted` - reachable from any state; in-flight reads fail cleanly
//!
//! The two invariants everything here serves: a stream's plaintext is
//! materialized **at most once** (concurrent triggers collapse into one
//! writer behind a per-stream lock, all callers share one completion
//! signal), and a restart reconstructs state purely from durable evidence
//! (registry records, blob files, materialized files) without creating a
//! single new file or re-downloading a resident blob.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::blob::blob_hash;
use crate::blob_store::BlobStore;
use crate::descriptor::StreamDescriptor;
use crate::error::StoreError;
use crate::reader::StreamReader;
use crate::registry::{StreamRecord, StreamRegistry};
use crate::source::{BlobFetcher, BlobSource, RuntimeFlags};

/// Lifecycle state of a managed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamStatus {
    Downloading,
    Available,
    FileSaved,
    Deleted,
}

#[derive(Debug)]
struct Materialized {
    download_directory: Option<PathBuf>,
    full_path: Option<PathBuf>,
}

/// Runtime aggregate for one stream
pub struct ManagedStream {
    pub sd_hash: String,
    pub descriptor: Arc<StreamDescriptor>,
    pub name: Option<String>,
    pub added_on: DateTime<Utc>,
    paths: RwLock<Materialized>,
    /// Materialization critical section: at most one writer per stream
    write_lock: Mutex<()>,
    finished_tx: watch::Sender<bool>,
    deleted_tx: watch::Sender<bool>,
}

impl ManagedStream {
    fn from_record(record: StreamRecord) -> Self {
        let materialized = record.full_path.is_some();
        let (finished_tx, _) = watch::channel(materialized);
        let (deleted_tx, _) = watch::channel(false);
        Self {
            sd_hash: record.sd_hash,
            descriptor: Arc::new(record.descriptor),
            name: record.name,
            added_on: record.added_on,
            paths: RwLock::new(Materialized {
                download_directory: record.download_directory,
                full_path: record.full_path,
            }),
            write_lock: Mutex::new(()),
            finished_tx,
            deleted_tx,
        }
    }

    pub async fn full_path(&self) -> Option<PathBuf> {
        self.paths.read().await.full_path.clone()
    }

    pub async fn download_directory(&self) -> Option<PathBuf> {
        self.paths.read().await.download_directory.clone()
    }

    async fn set_paths(&self, directory: &Path, full_path: &Path) {
        let mut paths = self.paths.write().await;
        paths.download_directory = Some(directory.to_path_buf());
        paths.full_path = Some(full_path.to_path_buf());
    }

    /// Signal that flips to `true` once the full file is flushed and closed
    pub fn finished_writing(&self) -> watch::Receiver<bool> {
        self.finished_tx.subscribe()
    }

    /// Signal that flips to `true` when the stream is deleted
    pub fn deleted(&self) -> watch::Receiver<bool> {
        self.deleted_tx.subscribe()
    }

    pub fn is_deleted(&self) -> bool {
        *self.deleted_tx.borrow()
    }

    fn mark_deleted(&self) {
        self.deleted_tx.send_replace(true);
    }
}

/// One row of the stream listing exposed to the control surface
#[derive(Debug, Clone, Serialize)]
pub struct StreamListing {
    pub sd_hash: String,
    pub name: Option<String>,
    pub status: StreamStatus,
    pub download_directory: Option<PathBuf>,
    pub full_path: Option<PathBuf>,
    pub blobs_in_stream: usize,
    pub blobs_remaining: usize,
    pub added_on: DateTime<Utc>,
}

/// External collaborator resolving a human name to a stream identity
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<String>, StoreError>;
}

/// Resolver backed by the local registry's name bindings
pub struct RegistryResolver {
    registry: Arc<StreamRegistry>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl NameResolver for RegistryResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.registry.resolve_name(name)
    }
}

/// Fixed in-memory resolver, used by tests as the external claim system
#[derive(Default)]
pub struct MemoryResolver {
    names: DashMap<String, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, sd_hash: &str) {
        self.names.insert(name.to_string(), sd_hash.to_string());
    }
}

#[async_trait]
impl NameResolver for MemoryResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.names.get(name).map(|entry| entry.value().clone()))
    }
}

/// Owner of all stream lifecycles
pub struct StreamManager {
    store: Arc<BlobStore>,
    fetcher: Arc<BlobFetcher>,
    registry: Arc<StreamRegistry>,
    flags: Arc<RuntimeFlags>,
    download_dir: PathBuf,
    streams: DashMap<String, Arc<ManagedStream>>,
}

impl StreamManager {
    pub fn new(
        store: Arc<BlobStore>,
        source: Arc<dyn BlobSource>,
        registry: Arc<StreamRegistry>,
        flags: Arc<RuntimeFlags>,
        download_dir: PathBuf,
    ) -> Self {
        let fetcher = Arc::new(BlobFetcher::new(store.clone(), source, flags.clone()));
        Self {
            store,
            fetcher,
            registry,
            flags,
            download_dir,
            streams: DashMap::new(),
        }
    }

    pub fn flags(&self) -> &Arc<RuntimeFlags> {
        &self.flags
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Load durable records and reconcile them against the filesystem
    ///
    /// Never creates files and never fetches blobs; a record pointing at a
    /// materialized file that no longer exists is downgraded in place.
    pub async fn start(&self) -> Result<(), StoreError> {
        let records = self.registry.list_streams()?;
        let resident = self.store.enumerate_resident().await?;

        for mut record in records {
            if let Some(path) = record.full_path.clone() {
                if fs::metadata(&path).await.is_err() {
                    warn!(
                        sd_hash = %record.sd_hash,
                        path = %path.display(),
                        "Materialized file missing, downgrading record"
                    );
                    record.full_path = None;
                    record.download_directory = None;
                    self.registry.put_stream(&record)?;
                }
            }
            self.insert_stream(record);
        }

        info!(
            streams = self.streams.len(),
            resident_blobs = resident.len(),
            "Stream manager started"
        );
        Ok(())
    }

    /// Drop in-memory state and flush the registry
    ///
    /// On-disk blobs, records and files are left exactly as they are; a
    /// later [`StreamManager::start`] over the same directories rebuilds
    /// identical state.
    pub async fn stop(&self) -> Result<(), StoreError> {
        self.streams.clear();
        self.registry.flush()?;
        info!("Stream manager stopped");
        Ok(())
    }

    fn insert_stream(&self, record: StreamRecord) -> Arc<ManagedStream> {
        let stream = Arc::new(ManagedStream::from_record(record));
        // First insert wins so racing opens share one write lock
        self.streams
            .entry(stream.sd_hash.clone())
            .or_insert(stream)
            .value()
            .clone()
    }

    /// Get the managed stream for an sd_hash, fetching and parsing the
    /// descriptor blob if this node has never seen the stream.
    pub async fn open_stream(
        &self,
        sd_hash: &str,
        name: Option<&str>,
    ) -> Result<Arc<ManagedStream>, StoreError> {
        if let Some(entry) = self.streams.get(sd_hash) {
            return Ok(entry.value().clone());
        }
        if let Some(record) = self.registry.get_stream(sd_hash)? {
            return Ok(self.insert_stream(record));
        }

        let sd_bytes = self.fetcher.fetch(sd_hash).await?;
        let descriptor = StreamDescriptor::from_bytes(&sd_bytes)?;

        let record = StreamRecord {
            sd_hash: sd_hash.to_string(),
            name: name.map(str::to_string),
            descriptor,
            download_directory: None,
            full_path: None,
            added_on: Utc::now(),
        };
        self.registry.put_stream(&record)?;

        info!(
            sd_hash = %sd_hash,
            blobs = record.descriptor.blobs.len(),
            size = record.descriptor.raw_size(),
            "Opened stream"
        );
        Ok(self.insert_stream(record))
    }

    /// Chunk, encrypt and register local content as a new stream
    pub async fn publish(
        &self,
        data: &[u8],
        name: &str,
        file_name: &str,
    ) -> Result<Arc<ManagedStream>, StoreError> {
        let (descriptor, blobs) = StreamDescriptor::create_stream(data, file_name)?;
        for (hash, ciphertext) in &blobs {
            self.store.put(hash, ciphertext).await?;
        }

        let sd_bytes = descriptor.to_bytes()?;
        let sd_hash = blob_hash(&sd_bytes);
        self.store.put(&sd_hash, &sd_bytes).await?;

        let record = StreamRecord {
            sd_hash: sd_hash.clone(),
            name: Some(name.to_string()),
            descriptor,
            download_directory: None,
            full_path: None,
            added_on: Utc::now(),
        };
        self.registry.bind_name(name, &sd_hash)?;
        self.registry.put_stream(&record)?;

        info!(
            sd_hash = %sd_hash,
            name = %name,
            blobs = blobs.len(),
            size = data.len(),
            "Published stream"
        );
        Ok(self.insert_stream(record))
    }

    /// Range reader over a managed stream
    pub fn reader(&self, stream: &ManagedStream) -> Result<StreamReader, StoreError> {
        StreamReader::new(stream.descriptor.clone(), self.fetcher.clone(), stream.deleted())
    }

    /// Count of this stream's data blobs not currently resident
    pub async fn blobs_remaining(&self, stream: &ManagedStream) -> usize {
        let mut remaining = 0;
        for info in &stream.descriptor.blobs {
            if !self.store.contains(&info.blob_hash).await {
                remaining += 1;
            }
        }
        remaining
    }

    /// Materialize the stream's full plaintext to a single file, exactly once
    ///
    /// Writes the **raw** plaintext (`raw_size()` bytes, no served-size
    /// padding) to a temp file and renames it into place, so readers never
    /// observe a partial file. Repeated triggers, concurrent or not, leave
    /// the existing complete file untouched and return its path.
    pub async fn ensure_materialized(
        &self,
        stream: &ManagedStream,
        directory: Option<&Path>,
    ) -> Result<PathBuf, StoreError> {
        let _guard = stream.write_lock.lock().await;

        if stream.is_deleted() {
            return Err(StoreError::StreamDeleted(stream.sd_hash.clone()));
        }

        let raw_size = stream.descriptor.raw_size();

        if let Some(path) = stream.full_path().await {
            if let Ok(meta) = fs::metadata(&path).await {
                if meta.len() == raw_size {
                    debug!(sd_hash = %stream.sd_hash, "Already materialized");
                    return Ok(path);
                }
            }
        }

        let directory = directory
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.download_dir.clone());
        fs::create_dir_all(&directory).await?;
        let final_path = directory.join(&stream.descriptor.suggested_file_name);

        // Adopt a complete file left behind by a previous run instead of
        // writing a duplicate
        if let Ok(meta) = fs::metadata(&final_path).await {
            if meta.len() == raw_size {
                self.record_materialized(stream, &directory, &final_path).await?;
                debug!(sd_hash = %stream.sd_hash, "Adopted existing file");
                return Ok(final_path);
            }
        }

        let tmp_path = directory.join(format!(
            ".{}.tmp-{}",
            stream.descriptor.suggested_file_name,
            uuid::Uuid::new_v4()
        ));
        if let Err(e) = self.write_plaintext(stream, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        fs::rename(&tmp_path, &final_path).await?;

        self.record_materialized(stream, &directory, &final_path).await?;
        info!(
            sd_hash = %stream.sd_hash,
            path = %final_path.display(),
            size = raw_size,
            "Materialized stream"
        );
        Ok(final_path)
    }

    async fn write_plaintext(&self, stream: &ManagedStream, path: &Path) -> Result<(), StoreError> {
        let reader = self.reader(stream)?;
        let mut file = fs::File::create(path).await?;
        for index in 0..stream.descriptor.blobs.len() {
            let plaintext = reader.read_blob(index).await?;
            file.write_all(&plaintext).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn record_materialized(
        &self,
        stream: &ManagedStream,
        directory: &Path,
        full_path: &Path,
    ) -> Result<(), StoreError> {
        stream.set_paths(directory, full_path).await;
        if let Some(mut record) = self.registry.get_stream(&stream.sd_hash)? {
            record.download_directory = Some(directory.to_path_buf());
            record.full_path = Some(full_path.to_path_buf());
            self.registry.put_stream(&record)?;
        }
        stream.finished_tx.send_replace(true);
        Ok(())
    }

    /// Explicit save-to-file request for an already known stream
    pub async fn save_file(
        &self,
        sd_hash: &str,
        directory: Option<&Path>,
    ) -> Result<PathBuf, StoreError> {
        let stream = self
            .streams
            .get(sd_hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::StreamNotFound(sd_hash.to_string()))?;
        self.ensure_materialized(&stream, directory).await
    }

    /// Delete a stream: its record, the blobs only it references, and
    /// (when asked) its materialized file. Blobs or files belonging to
    /// other streams are never touched.
    pub async fn delete_stream(
        &self,
        sd_hash: &str,
        delete_from_download_dir: bool,
    ) -> Result<(), StoreError> {
        let (_, stream) = self
            .streams
            .remove(sd_hash)
            .ok_or_else(|| StoreError::StreamNotFound(sd_hash.to_string()))?;
        stream.mark_deleted();

        // Everything still referenced by the remaining streams stays put
        let mut shared: HashSet<String> = HashSet::new();
        for entry in self.streams.iter() {
            shared.insert(entry.value().sd_hash.clone());
            for info in &entry.value().descriptor.blobs {
                shared.insert(info.blob_hash.clone());
            }
        }

        if !shared.contains(sd_hash) {
            self.store.delete(sd_hash).await?;
        }
        for info in &stream.descriptor.blobs {
            if !shared.contains(&info.blob_hash) {
                self.store.delete(&info.blob_hash).await?;
            }
        }

        if delete_from_download_dir {
            if let Some(path) = stream.full_path().await {
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.registry.delete_stream(sd_hash)?;
        info!(sd_hash = %sd_hash, "Deleted stream");
        Ok(())
    }

    async fn listing_for(&self, stream: &ManagedStream) -> StreamListing {
        let blobs_remaining = self.blobs_remaining(stream).await;
        let full_path = stream.full_path().await;
        let status = if stream.is_deleted() {
            StreamStatus::Deleted
        } else if full_path.is_some() {
            StreamStatus::FileSaved
        } else if blobs_remaining == 0 {
            StreamStatus::Available
        } else {
            StreamStatus::Downloading
        };

        StreamListing {
            sd_hash: stream.sd_hash.clone(),
            name: stream.name.clone(),
            status,
            download_directory: stream.download_directory().await,
            full_path,
            blobs_in_stream: stream.descriptor.blobs.len(),
            blobs_remaining,
            added_on: stream.added_on,
        }
    }

    /// List every managed stream, oldest first
    pub async fn list_streams(&self) -> Vec<StreamListing> {
        let streams: Vec<Arc<ManagedStream>> =
            self.streams.iter().map(|entry| entry.value().clone()).collect();
        let mut listings = Vec::with_capacity(streams.len());
        for stream in streams {
            listings.push(self.listing_for(&stream).await);
        }
        listings.sort_by_key(|l| l.added_on);
        listings
    }

    /// Read the full plaintext of a stream (tests, small content)
    pub async fn read_all(&self, stream: &ManagedStream) -> Result<Bytes, StoreError> {
        let reader = self.reader(stream)?;
        reader.read_range(0, stream.descriptor.served_size()).await
    }
}
