//! Index record storage.
//!
//! Records live in RocksDB keyed by chunk ID, with JSON values. The index
//! dimension is stored alongside so a reopen with a different model is caught.

use std::path::Path;

use chrono::{DateTime, Utc};
use rag_types::{ChunkId, ChunkMetadata};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::VectorError;

/// Column family for index records
pub const CF_INDEX_RECORDS: &str = "index_records";

/// Column family for index-wide settings
pub const CF_INDEX_META: &str = "index_meta";

const DIMENSION_KEY: &[u8] = b"dimension";

/// A stored vector and its chunk metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub chunk_id: ChunkId,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
    pub indexed_at: DateTime<Utc>,
}

/// RocksDB-backed record store.
pub struct RecordStore {
    db: DB,
    read_only: bool,
}

impl RecordStore {
    /// Open or create record storage.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VectorError> {
        let path = path.as_ref();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_INDEX_RECORDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_INDEX_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        info!(path = ?path, "Opened index record storage");
        Ok(Self {
            db,
            read_only: false,
        })
    }

    /// Open existing storage without taking the write lock. Writes fail
    /// with `ReadOnly`.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, VectorError> {
        let path = path.as_ref();
        let db = DB::open_cf_for_read_only(
            &Options::default(),
            path,
            [CF_INDEX_RECORDS, CF_INDEX_META],
            false,
        )?;

        info!(path = ?path, "Opened index record storage read-only");
        Ok(Self {
            db,
            read_only: true,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn writable(&self) -> Result<(), VectorError> {
        if self.read_only {
            return Err(VectorError::ReadOnly);
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, VectorError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| VectorError::Index(format!("column family {name} missing")))
    }

    /// Dimension recorded by a previous open, if any.
    pub fn dimension(&self) -> Result<Option<usize>, VectorError> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_INDEX_META)?, DIMENSION_KEY)? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VectorError::Serialization("corrupt dimension entry".to_string()))?;
        Ok(Some(u64::from_be_bytes(raw) as usize))
    }

    pub fn set_dimension(&self, dimension: usize) -> Result<(), VectorError> {
        self.writable()?;
        self.db.put_cf(
            self.cf(CF_INDEX_META)?,
            DIMENSION_KEY,
            (dimension as u64).to_be_bytes(),
        )?;
        Ok(())
    }

    pub fn put(&self, record: &IndexRecord) -> Result<(), VectorError> {
        self.writable()?;
        let value = serde_json::to_vec(record)?;
        self.db.put_cf(
            self.cf(CF_INDEX_RECORDS)?,
            record.chunk_id.as_str().as_bytes(),
            value,
        )?;
        debug!(chunk_id = %record.chunk_id.short(), "Stored index record");
        Ok(())
    }

    pub fn delete(&self, chunk_id: &ChunkId) -> Result<(), VectorError> {
        self.writable()?;
        self.db
            .delete_cf(self.cf(CF_INDEX_RECORDS)?, chunk_id.as_str().as_bytes())?;
        Ok(())
    }

    /// Load every record. Unreadable entries are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<IndexRecord>, VectorError> {
        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_INDEX_RECORDS)?, IteratorMode::Start)
        {
            let (key, value) = item?;
            match serde_json::from_slice::<IndexRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "Skipping unreadable index record"
                ),
            }
        }
        Ok(records)
    }
}
