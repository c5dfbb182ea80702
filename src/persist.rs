use ordered_float::OrderedFloat;
use tracing::{debug, error, info, warn};

use crate::dedup::fingerprint;
use crate::error::{Result, StorageError, StoreError};
use crate::model::{RawFeature, TrackFeature, VisitRecord};
use crate::storage::Keyspace;
use crate::validate::{validate, validate_batch};
use crate::TrackDb;

/// Canonical write order: unix second ascending, then accuracy ascending, so
/// the most accurate of several same-second reports is written first.
pub fn sort_batch(features: &mut [TrackFeature]) {
    features.sort_by_key(|f| (f.unix_seconds(), OrderedFloat(f.accuracy)));
}

impl TrackDb {
    /// Stores one batch, returning how many features were written.
    pub fn store_batch(&self, raw: Vec<RawFeature>) -> Result<usize> {
        self.store_batch_features(raw).map(|stored| stored.len())
    }

    /// Validates, orders, deduplicates and persists one batch.
    ///
    /// Invalid features, duplicates and per-feature write failures are logged
    /// and skipped. A batch spanning more than one entity is rejected before
    /// anything is written. Returns the features actually written.
    pub fn store_batch_features(&self, raw: Vec<RawFeature>) -> Result<Vec<TrackFeature>> {
        if raw.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        let received = raw.len();

        let mut features: Vec<TrackFeature> = raw
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| match validate(r) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(index = i, error = %e, "dropping invalid feature");
                    None
                }
            })
            .collect();
        let Some(latest) = features.last().cloned() else {
            return Err(StoreError::EmptyBatch);
        };
        validate_batch(&features)?;

        let latest = self.assemble(latest);
        sort_batch(&mut features);

        let sinks = self.sinks.open_batch();
        let mut stored = Vec::with_capacity(features.len());
        for feature in features {
            let feature = self.assemble(feature);
            let fp = fingerprint(&feature);
            if self.dedup.is_duplicate(fp)? {
                let dup = StoreError::Duplicate { key: feature.primary_key() };
                debug!(error = %dup, "skipping feature");
                continue;
            }
            if let Err(e) = self.persist_feature(&feature) {
                error!(key = %feature.primary_key(), error = %e, "store point error");
                continue;
            }
            self.dedup.record(fp)?;
            sinks.send(&feature);
            stored.push(feature);
        }
        drop(sinks);

        self.write_last_known(&latest);
        self.write_metadata(&latest.name, stored.len());

        info!(
            name = %latest.name,
            received,
            stored = stored.len(),
            "batch stored"
        );
        Ok(stored)
    }

    /// Applies the testing prefix to the entity name.
    fn assemble(&self, mut feature: TrackFeature) -> TrackFeature {
        if self.config.testing {
            feature.name = format!("{}{}", self.config.testing_prefix, feature.name);
        }
        feature
    }

    fn persist_feature(&self, feature: &TrackFeature) -> std::result::Result<(), StorageError> {
        let value = serde_json::to_vec(feature)?;
        self.store.put(Keyspace::Tracks, feature.primary_key().as_bytes(), &value)?;
        self.index().index_visit(&VisitRecord::from_feature(feature))
    }
}
