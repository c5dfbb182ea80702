//! Composite keys for the visit keyspaces and the bounded scans over them.
//!
//! Both encodings are big-endian with non-negative components, so unsigned
//! byte order equals numeric order of the leading fields.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::StorageError;
use crate::model::{time_nanos, VisitRecord};
use crate::storage::{KeyValueStore, Keyspace};

const LAT_OFFSET: f64 = 90.0;
const LNG_OFFSET: f64 = 180.0;

/// Length of the `(lat, lng, nanos)` prefix of a [`GeoKey`].
pub const GEO_PREFIX_LEN: usize = 24;

/// `BE(nanos) ‖ '+' ‖ uuid ‖ 0x00 ‖ track_key`
///
/// The owning track key keeps visits of testing-prefixed tracks apart from
/// production visits of the same entity and time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitKey {
    pub nanos: u64,
    pub uuid: String,
    pub track_key: String,
}

impl VisitKey {
    pub fn for_visit(visit: &VisitRecord) -> Self {
        Self {
            nanos: time_nanos(&visit.reported_time),
            uuid: visit.uuid.clone(),
            track_key: visit.track_key.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(10 + self.uuid.len() + self.track_key.len());
        key.extend_from_slice(&self.nanos.to_be_bytes());
        key.push(b'+');
        push_owner(&mut key, &self.uuid, &self.track_key);
        key
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 || bytes[8] != b'+' {
            return None;
        }
        let nanos = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let (uuid, track_key) = split_owner(&bytes[9..])?;
        Some(Self { nanos, uuid, track_key })
    }
}

fn push_owner(key: &mut Vec<u8>, uuid: &str, track_key: &str) {
    key.extend_from_slice(uuid.as_bytes());
    key.push(0);
    key.extend_from_slice(track_key.as_bytes());
}

fn split_owner(tail: &[u8]) -> Option<(String, String)> {
    let sep = tail.iter().position(|b| *b == 0)?;
    let uuid = std::str::from_utf8(&tail[..sep]).ok()?.to_string();
    let track_key = std::str::from_utf8(&tail[sep + 1..]).ok()?.to_string();
    Some((uuid, track_key))
}

/// `BE(bits(lat+90)) ‖ BE(bits(lng+180)) ‖ BE(nanos) ‖ uuid ‖ 0x00 ‖ track_key`
#[derive(Debug, Clone, PartialEq)]
pub struct GeoKey {
    pub lat: f64,
    pub lng: f64,
    pub nanos: u64,
    pub uuid: String,
    pub track_key: String,
}

impl GeoKey {
    pub fn for_visit(visit: &VisitRecord) -> Self {
        Self {
            lat: visit.lat,
            lng: visit.lng,
            nanos: time_nanos(&visit.reported_time),
            uuid: visit.uuid.clone(),
            track_key: visit.track_key.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut key = Self::bound(self.lat, self.lng, self.nanos);
        push_owner(&mut key, &self.uuid, &self.track_key);
        key
    }

    /// The fixed-width prefix used as a seek target or an upper bound.
    pub fn bound(lat: f64, lng: f64, nanos: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(GEO_PREFIX_LEN);
        key.extend_from_slice(&(lat + LAT_OFFSET).to_bits().to_be_bytes());
        key.extend_from_slice(&(lng + LNG_OFFSET).to_bits().to_be_bytes());
        key.extend_from_slice(&nanos.to_be_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (lat_off, lng_off, nanos) = decode_prefix(bytes)?;
        let (uuid, track_key) = split_owner(&bytes[GEO_PREFIX_LEN..])?;
        Some(Self {
            lat: lat_off - LAT_OFFSET,
            lng: lng_off - LNG_OFFSET,
            nanos,
            uuid,
            track_key,
        })
    }
}

/// Offset coordinates and time, compared in the same space they were encoded in.
fn decode_prefix(bytes: &[u8]) -> Option<(f64, f64, u64)> {
    if bytes.len() < GEO_PREFIX_LEN {
        return None;
    }
    let lat = f64::from_bits(u64::from_be_bytes(bytes[0..8].try_into().ok()?));
    let lng = f64::from_bits(u64::from_be_bytes(bytes[8..16].try_into().ok()?));
    let nanos = u64::from_be_bytes(bytes[16..24].try_into().ok()?);
    Some((lat, lng, nanos))
}

/// Visits produced by a scan, with the number of keys iterated.
#[derive(Debug, Default)]
pub struct Scan {
    pub visits: Vec<VisitRecord>,
    pub scanned: usize,
}

/// Secondary visit indexes: by reported time and by coordinates.
pub struct GeoTimeIndex<'a> {
    store: &'a KeyValueStore,
}

impl<'a> GeoTimeIndex<'a> {
    pub fn new(store: &'a KeyValueStore) -> Self {
        Self { store }
    }

    pub fn index_visit(&self, visit: &VisitRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(visit)?;
        self.store.put(Keyspace::Visits, &VisitKey::for_visit(visit).encode(), &value)?;
        self.store.put(Keyspace::VisitsByCoord, &GeoKey::for_visit(visit).encode(), &value)?;
        Ok(())
    }

    pub fn remove_visit(&self, visit: &VisitRecord) -> Result<(), StorageError> {
        self.store.delete(Keyspace::Visits, &VisitKey::for_visit(visit).encode())?;
        self.store.delete(Keyspace::VisitsByCoord, &GeoKey::for_visit(visit).encode())?;
        Ok(())
    }

    /// Visits inside the box `sw..=ne` (each `(lat, lng)`) reported within
    /// `start..=end`. A missing end bounds the scan at the current time.
    ///
    /// The key range is lexicographic, so keys between the corners but outside
    /// the box are iterated (and counted) without being returned.
    pub fn scan_bounded(
        &self,
        sw: (f64, f64),
        ne: (f64, f64),
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Scan, StorageError> {
        let start = start.as_ref().map(time_nanos).unwrap_or(0);
        let end = time_nanos(&end.unwrap_or_else(Utc::now));

        let min = GeoKey::bound(sw.0, sw.1, start);
        let max = GeoKey::bound(ne.0, ne.1, end);
        let (lat_range, lng_range) = (
            (sw.0 + LAT_OFFSET)..=(ne.0 + LAT_OFFSET),
            (sw.1 + LNG_OFFSET)..=(ne.1 + LNG_OFFSET),
        );

        let mut scan = Scan::default();
        let mut cursor = self.store.cursor(Keyspace::VisitsByCoord);
        let mut item = cursor.seek(&min)?;
        while let Some((key, value)) = item {
            if key[..GEO_PREFIX_LEN.min(key.len())] > max[..] {
                break;
            }
            scan.scanned += 1;

            let inside = decode_prefix(&key).is_some_and(|(lat, lng, nanos)| {
                lat_range.contains(&lat) && lng_range.contains(&lng) && (start..=end).contains(&nanos)
            });
            if inside {
                if let Some(visit) = decode_visit(&key, &value) {
                    scan.visits.push(visit);
                }
            }
            item = cursor.next_entry()?;
        }
        Ok(scan)
    }

    /// Visits reported within `start..=end`, either side open when `None`.
    pub fn scan_time(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Scan, StorageError> {
        let end = end.as_ref().map(|t| time_nanos(t).to_be_bytes());

        let mut scan = Scan::default();
        let mut cursor = self.store.cursor(Keyspace::Visits);
        let mut item = match start {
            Some(t) => cursor.seek(&time_nanos(&t).to_be_bytes())?,
            None => cursor.first()?,
        };
        while let Some((key, value)) = item {
            if let Some(end) = &end {
                if key.get(..8).is_some_and(|t| t > &end[..]) {
                    break;
                }
            }
            scan.scanned += 1;
            if let Some(visit) = decode_visit(&key, &value) {
                scan.visits.push(visit);
            }
            item = cursor.next_entry()?;
        }
        Ok(scan)
    }
}

fn decode_visit(key: &[u8], value: &[u8]) -> Option<VisitRecord> {
    match serde_json::from_slice::<VisitRecord>(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "unreadable visit record");
            None
        }
    }
}
