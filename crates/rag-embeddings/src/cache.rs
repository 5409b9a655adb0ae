//! Embedding cache.
//!
//! Maps `(model_version, fingerprint)` to a vector. An in-memory LRU sits in
//! front of an optional RocksDB column family so repeated texts never reach
//! the provider twice, even across process restarts.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EmbeddingError;

/// Column family holding persisted cache entries
pub const CF_EMBEDDING_CACHE: &str = "embedding_cache";

/// Vectors closer than this per component are considered identical.
const VECTOR_TOLERANCE: f32 = 1e-6;

/// A cached vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    /// Estimated entry count on disk (None when memory-only)
    pub persisted_entries: Option<u64>,
}

/// Two-layer embedding cache.
pub struct EmbeddingCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    db: Option<DB>,
    ttl: Option<chrono::Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a memory-only cache.
    pub fn in_memory(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            db: None,
            ttl: ttl.and_then(|d| chrono::Duration::from_std(d).ok()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open or create a persistent cache at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
        ttl: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let path = path.as_ref();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf = ColumnFamilyDescriptor::new(CF_EMBEDDING_CACHE, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf])?;

        info!(path = ?path, capacity, "Opened embedding cache");
        let mut cache = Self::in_memory(capacity, ttl);
        cache.db = Some(db);
        Ok(cache)
    }

    fn cf<'a>(&self, db: &'a DB) -> Result<&'a ColumnFamily, EmbeddingError> {
        db.cf_handle(CF_EMBEDDING_CACHE).ok_or_else(|| {
            EmbeddingError::Storage(format!("column family {CF_EMBEDDING_CACHE} missing"))
        })
    }

    fn key(fingerprint: &str, model_version: &str) -> String {
        format!("{model_version}\0{fingerprint}")
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, LruCache<String, CacheEntry>>, EmbeddingError> {
        self.memory
            .lock()
            .map_err(|e| EmbeddingError::Storage(format!("Cache lock error: {e}")))
    }

    /// Look up a live entry, promoting disk hits into memory.
    ///
    /// Must be called with the memory lock held.
    fn lookup(
        &self,
        memory: &mut LruCache<String, CacheEntry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, EmbeddingError> {
        if let Some(entry) = memory.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.clone()));
            }
            memory.pop(key);
        }

        let Some(db) = &self.db else {
            return Ok(None);
        };
        let cf = self.cf(db)?;
        let Some(bytes) = db.get_cf(cf, key.as_bytes())? else {
            return Ok(None);
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Dropping unreadable cache entry");
                db.delete_cf(cf, key.as_bytes())?;
                return Ok(None);
            }
        };
        if entry.is_expired(now) {
            db.delete_cf(cf, key.as_bytes())?;
            return Ok(None);
        }
        memory.put(key.to_string(), entry.clone());
        Ok(Some(entry))
    }

    /// Get the cached vector for a fingerprint under a model version.
    pub fn get(
        &self,
        fingerprint: &str,
        model_version: &str,
    ) -> Result<Option<Vec<f32>>, EmbeddingError> {
        let key = Self::key(fingerprint, model_version);
        let mut memory = self.lock()?;
        let found = self.lookup(&mut memory, &key, Utc::now())?;
        drop(memory);

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.vector))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a vector.
    ///
    /// Writing the same vector again is a no-op; writing a different vector
    /// under an existing key fails with `CacheConflict`.
    pub fn put(
        &self,
        fingerprint: &str,
        model_version: &str,
        vector: &[f32],
    ) -> Result<(), EmbeddingError> {
        let key = Self::key(fingerprint, model_version);
        let now = Utc::now();
        let mut memory = self.lock()?;

        if let Some(existing) = self.lookup(&mut memory, &key, now)? {
            if same_vector(&existing.vector, vector) {
                return Ok(());
            }
            warn!(fingerprint = %fingerprint, model = %model_version, "Cache conflict");
            return Err(EmbeddingError::CacheConflict(fingerprint.to_string()));
        }

        let entry = CacheEntry {
            vector: vector.to_vec(),
            created_at: now,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };

        if let Some(db) = &self.db {
            let value = serde_json::to_vec(&entry)?;
            db.put_cf(self.cf(db)?, key.as_bytes(), value)?;
        }
        memory.put(key, entry);
        debug!(fingerprint = %fingerprint, "Cached embedding");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let memory_entries = self.memory.lock().map(|m| m.len()).unwrap_or(0);
        let persisted_entries = self.db.as_ref().and_then(|db| {
            let cf = db.cf_handle(CF_EMBEDDING_CACHE)?;
            db.property_int_value_cf(cf, "rocksdb.estimate-num-keys")
                .ok()
                .flatten()
        });
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries,
            persisted_entries,
        }
    }
}

fn same_vector(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= VECTOR_TOLERANCE)
}
