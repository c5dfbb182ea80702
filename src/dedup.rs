use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use seahash::hash;

use crate::error::StorageError;
use crate::model::TrackFeature;

pub const DEFAULT_CAPACITY: usize = 500_000;

/// Fingerprint of an assembled feature.
///
/// Hashes the feature's identity (prefixed name, uuid and unix second), the
/// same bytes that address its primary record, so two reports of one entity
/// within the same second collapse to one.
pub fn fingerprint(feature: &TrackFeature) -> u64 {
    hash(feature.primary_key().as_bytes())
}

/// Bounded memory of recently admitted fingerprints.
///
/// Entries only leave by capacity eviction. A check followed by a record is
/// not atomic; two racing batches may both admit the same feature.
pub struct Deduplicator {
    seen: Mutex<LruCache<u64, ()>>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { seen: Mutex::new(LruCache::new(cap)) }
    }

    pub fn is_duplicate(&self, fingerprint: u64) -> Result<bool, StorageError> {
        let mut seen = self.seen.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(seen.get(&fingerprint).is_some())
    }

    pub fn record(&self, fingerprint: u64) -> Result<(), StorageError> {
        let mut seen = self.seen.lock().map_err(|_| StorageError::Poisoned)?;
        seen.put(fingerprint, ());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
