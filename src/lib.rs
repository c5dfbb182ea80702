pub mod archive;
pub mod config;
pub mod dedup;
pub mod error;
pub mod format;
pub mod index;
pub mod manager;
pub mod model;
pub mod parser;
pub mod persist;
pub mod query;
pub mod server;
pub mod storage;
pub mod validate;

use std::fmt;
use std::fs;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{error, info, warn};

pub use crate::config::Config;
pub use crate::error::{Result, StoreError};
pub use crate::model::{LastKnown, Metadata, TrackFeature, VisitRecord};
pub use crate::query::{VisitFilter, VisitsResponse};

use crate::archive::ArchiveSinks;
use crate::dedup::Deduplicator;
use crate::error::StorageError;
use crate::index::GeoTimeIndex;
use crate::storage::{CompactionStats, KeyValueStore, Keyspace};

pub const LAST_KNOWN_KEY: &[u8] = b"lastknown";
pub const METADATA_KEY: &[u8] = b"metadata";

/// The track store: primary records, visit indexes, dedup cache and the
/// last-known pointer, over one segment file.
pub struct TrackDb {
    config: Config,
    store: KeyValueStore,
    dedup: Deduplicator,
    last_known: RwLock<LastKnown>,
    sinks: ArchiveSinks,
}

impl fmt::Debug for TrackDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackDb")
            .field("data_dir", &self.config.data_dir)
            .field("store", &self.store)
            .field("dedup_entries", &self.dedup.len())
            .finish()
    }
}

impl TrackDb {
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let store = KeyValueStore::open(&config.segment_path(), config.strict_durability)?;

        let last_known = match store.get(Keyspace::Meta, LAST_KNOWN_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "unreadable last-known record, starting empty");
                LastKnown::new()
            }),
            None => LastKnown::new(),
        };

        info!(
            path = %config.segment_path().display(),
            tracks = store.len(Keyspace::Tracks)?,
            visits = store.len(Keyspace::Visits)?,
            entities = last_known.len(),
            testing = config.testing,
            "track store opened"
        );

        Ok(Self {
            dedup: Deduplicator::new(config.dedup_capacity),
            sinks: ArchiveSinks::new(&config),
            last_known: RwLock::new(last_known),
            store,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    pub fn index(&self) -> GeoTimeIndex<'_> {
        GeoTimeIndex::new(&self.store)
    }

    /// Decodes a payload in any accepted encoding and stores it as one batch.
    pub fn populate(&self, payload: &[u8]) -> Result<usize> {
        let raw = format::normalize(payload)?;
        self.store_batch(raw)
    }

    /// Like [`TrackDb::populate`], returning the stored features.
    pub fn populate_features(&self, payload: &[u8]) -> Result<Vec<TrackFeature>> {
        let raw = format::normalize(payload)?;
        self.store_batch_features(raw)
    }

    pub fn last_known(&self) -> Result<LastKnown> {
        let lk = self.last_known.read().map_err(|_| StorageError::Poisoned)?;
        Ok(lk.clone())
    }

    pub fn metadata(&self) -> Result<Option<Metadata>> {
        match self.store.get(Keyspace::Meta, METADATA_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Primary record by its `name+uuid+unixSeconds` key.
    pub fn get_track(&self, key: &str) -> Result<Option<TrackFeature>> {
        match self.store.get(Keyspace::Tracks, key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removes every track stored under the testing prefix, with its visits
    /// and last-known entry. Returns the number of track records removed.
    pub fn delete_testing_data(&self) -> Result<usize> {
        let prefix = self.config.testing_prefix.as_bytes();
        if prefix.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for key in self.store.keys_with_prefix(Keyspace::Tracks, prefix)? {
            if self.store.delete(Keyspace::Tracks, &key)? {
                removed += 1;
            }
        }

        let index = self.index();
        let mut doomed = Vec::new();
        let mut cursor = self.store.cursor(Keyspace::Visits);
        let mut item = cursor.first()?;
        while let Some((_, value)) = item {
            if let Ok(visit) = serde_json::from_slice::<VisitRecord>(&value) {
                if visit.track_key.as_bytes().starts_with(prefix) {
                    doomed.push(visit);
                }
            }
            item = cursor.next_entry()?;
        }
        for visit in &doomed {
            index.remove_visit(visit)?;
        }

        let snapshot = {
            let mut lk = self.last_known.write().map_err(|_| StorageError::Poisoned)?;
            lk.retain(|name, _| !name.starts_with(&self.config.testing_prefix));
            lk.clone()
        };
        self.store.put(Keyspace::Meta, LAST_KNOWN_KEY, &serde_json::to_vec(&snapshot)?)?;

        info!(tracks = removed, visits = doomed.len(), "testing data deleted");
        Ok(removed)
    }

    pub fn compact(&self) -> Result<CompactionStats> {
        let stats = self.store.compact()?;
        info!(
            live = stats.live_entries,
            before = stats.bytes_before,
            after = stats.bytes_after,
            "compaction complete"
        );
        Ok(stats)
    }

    /// Blocks until archive workers of finished batches are done.
    pub fn flush_archives(&self) {
        self.sinks.wait_idle();
    }

    fn write_last_known(&self, feature: &TrackFeature) {
        let snapshot = match self.last_known.write() {
            Ok(mut lk) => {
                lk.insert(feature.name.clone(), feature.clone());
                lk.clone()
            }
            Err(_) => {
                error!("last-known lock poisoned");
                return;
            }
        };
        let written = serde_json::to_vec(&snapshot)
            .map_err(StorageError::from)
            .and_then(|bytes| self.store.put(Keyspace::Meta, LAST_KNOWN_KEY, &bytes));
        if let Err(e) = written {
            error!(name = %feature.name, error = %e, "could not persist last-known");
        }
    }

    fn write_metadata(&self, updated_by: &str, points: usize) {
        let written = self.store.len(Keyspace::Tracks).and_then(|key_count| {
            let md = Metadata {
                key_count,
                last_updated_at: Utc::now(),
                last_updated_by: updated_by.to_string(),
                last_updated_points: points,
            };
            let bytes = serde_json::to_vec(&md)?;
            self.store.put(Keyspace::Meta, METADATA_KEY, &bytes)
        });
        if let Err(e) = written {
            error!(error = %e, "could not persist metadata");
        }
    }
}
