//! Durable stream records
//!
//! Tracks, across restarts:
//! - Which streams this node knows about (descriptor embedded, so a
//!   streaming-only node with zero resident blobs still knows its streams)
//! - Where each stream was materialized, if it was
//! - The name bindings used by the built-in resolver
//!
//! Records are JSON values in sled trees. Residency and file existence are
//! never trusted from a record; the manager re-checks the filesystem on
//! startup.

use crate::descriptor::StreamDescriptor;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::{Path, PathBuf};
use tracing::info;

/// Durable state of one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Hash of the serialized descriptor (stream identity)
    pub sd_hash: String,
    /// Name this stream was resolved or published under
    pub name: Option<String>,
    /// Full manifest, embedded so restart never needs the sd blob
    pub descriptor: StreamDescriptor,
    /// Directory holding the materialized file, when one exists
    pub download_directory: Option<PathBuf>,
    /// Materialized plaintext file, when one exists
    pub full_path: Option<PathBuf>,
    /// When this stream was first registered
    pub added_on: DateTime<Utc>,
}

/// Stream record database
pub struct StreamRegistry {
    db: Db,
    streams: sled::Tree,
    names: sled::Tree,
}

impl StreamRegistry {
    /// Open or create the registry database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let streams = db.open_tree("streams")?;
        let names = db.open_tree("names")?;
        info!(path = %path.as_ref().display(), "Opened stream registry");
        Ok(Self { db, streams, names })
    }

    /// Open a registry in a throwaway temp directory (for tests)
    pub fn open_memory() -> Result<Self, StoreError> {
        let path = std::env::temp_dir().join(format!("blobstream-registry-{}", uuid::Uuid::new_v4()));
        Self::open(path)
    }

    /// Store (or replace) a stream record
    pub fn put_stream(&self, record: &StreamRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.streams.insert(record.sd_hash.as_bytes(), value)?;
        Ok(())
    }

    /// Get a stream record by sd_hash
    pub fn get_stream(&self, sd_hash: &str) -> Result<Option<StreamRecord>, StoreError> {
        match self.streams.get(sd_hash.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Delete a stream record; absent records are not an error
    pub fn delete_stream(&self, sd_hash: &str) -> Result<(), StoreError> {
        self.streams.remove(sd_hash.as_bytes())?;
        Ok(())
    }

    /// List all stream records
    pub fn list_streams(&self) -> Result<Vec<StreamRecord>, StoreError> {
        let mut records = Vec::new();
        for item in self.streams.iter() {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    /// Bind a name to an sd_hash
    ///
    /// Bindings model the external claim system and outlive stream
    /// deletion: a deleted stream's name still resolves, and a later read
    /// re-fetches through the blob source.
    pub fn bind_name(&self, name: &str, sd_hash: &str) -> Result<(), StoreError> {
        self.names.insert(name.as_bytes(), sd_hash.as_bytes())?;
        Ok(())
    }

    /// Resolve a bound name to its sd_hash
    pub fn resolve_name(&self, name: &str) -> Result<Option<String>, StoreError> {
        match self.names.get(name.as_bytes())? {
            Some(value) => Ok(Some(
                String::from_utf8(value.to_vec())
                    .map_err(|e| StoreError::Internal(format!("bad name binding: {}", e)))?,
            )),
            None => Ok(None),
        }
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(sd_hash: &str) -> StreamRecord {
        let (descriptor, _) = StreamDescriptor::create_stream(b"registry test", "r.bin").unwrap();
        StreamRecord {
            sd_hash: sd_hash.to_string(),
            name: Some("foo".into()),
            descriptor,
            download_directory: None,
            full_path: None,
            added_on: Utc::now(),
        }
    }

    #[test]
    fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StreamRegistry::open(temp_dir.path().join("registry")).unwrap();

        let rec = record("abc123");
        registry.put_stream(&rec).unwrap();

        let loaded = registry.get_stream("abc123").unwrap().unwrap();
        assert_eq!(loaded.sd_hash, "abc123");
        assert_eq!(loaded.name.as_deref(), Some("foo"));
        assert_eq!(
            loaded.descriptor.raw_size(),
            rec.descriptor.raw_size()
        );

        registry.delete_stream("abc123").unwrap();
        assert!(registry.get_stream("abc123").unwrap().is_none());
        // Idempotent
        registry.delete_stream("abc123").unwrap();
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("registry");

        {
            let registry = StreamRegistry::open(&path).unwrap();
            registry.put_stream(&record("persisted")).unwrap();
            registry.bind_name("foo", "persisted").unwrap();
            registry.flush().unwrap();
        }

        let registry = StreamRegistry::open(&path).unwrap();
        assert!(registry.get_stream("persisted").unwrap().is_some());
        assert_eq!(
            registry.resolve_name("foo").unwrap().as_deref(),
            Some("persisted")
        );
        assert_eq!(registry.list_streams().unwrap().len(), 1);
    }

    #[test]
    fn test_name_binding_outlives_stream() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StreamRegistry::open(temp_dir.path().join("registry")).unwrap();

        registry.put_stream(&record("gone")).unwrap();
        registry.bind_name("foo", "gone").unwrap();
        registry.delete_stream("gone").unwrap();

        assert_eq!(registry.resolve_name("foo").unwrap().as_deref(), Some("gone"));
    }
}
