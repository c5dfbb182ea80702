use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::model::VisitRecord;
use crate::storage::Keyspace;
use crate::TrackDb;

/// Visit query. Every field is optional; unset fields do not filter.
///
/// The reported-time window drives the scan itself; the remaining fields are
/// checked per visit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisitFilter {
    pub uuids: Vec<String>,
    pub names: Vec<String>,

    #[serde(rename = "startArrivalT")]
    pub start_arrival: Option<DateTime<Utc>>,
    #[serde(rename = "endArrivalT")]
    pub end_arrival: Option<DateTime<Utc>>,
    #[serde(rename = "startDepartureT")]
    pub start_departure: Option<DateTime<Utc>>,
    #[serde(rename = "endDepartureT")]
    pub end_departure: Option<DateTime<Utc>>,
    #[serde(rename = "startReportedT")]
    pub start_reported: Option<DateTime<Utc>>,
    #[serde(rename = "endReportedT")]
    pub end_reported: Option<DateTime<Utc>>,

    /// Oldest first when set.
    #[serde(rename = "rc")]
    pub reverse_chrono: bool,

    #[serde(rename = "startI")]
    pub start_index: i64,
    #[serde(rename = "endI")]
    pub end_index: i64,

    #[serde(rename = "latmin")]
    pub lat_min: Option<f64>,
    #[serde(rename = "latmax")]
    pub lat_max: Option<f64>,
    #[serde(rename = "lngmin")]
    pub lng_min: Option<f64>,
    #[serde(rename = "lngmax")]
    pub lng_max: Option<f64>,

    /// `[lat, lng]`
    #[serde(rename = "bboxSW")]
    pub bbox_sw: Option<Vec<f64>>,
    /// `[lat, lng]`
    #[serde(rename = "bboxNE")]
    pub bbox_ne: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitsResponse {
    pub visits: Vec<VisitRecord>,
    pub scanned: usize,
    pub matches: usize,
}

type Corner = (f64, f64);

impl VisitFilter {
    /// Both corners as `(lat, lng)`, or `None` unless both are given.
    pub fn bounding_box(&self) -> Result<Option<(Corner, Corner)>> {
        fn corner(c: &[f64]) -> Result<Corner> {
            match c {
                [lat, lng] => Ok((*lat, *lng)),
                _ => Err(StoreError::InvalidQuery(format!(
                    "bounding box corner needs [lat, lng], got {:?}",
                    c
                ))),
            }
        }
        let sw = self.bbox_sw.as_deref().map(corner).transpose()?;
        let ne = self.bbox_ne.as_deref().map(corner).transpose()?;
        Ok(sw.zip(ne))
    }

    fn admits_times(&self, v: &VisitRecord) -> bool {
        self.start_arrival.map_or(true, |t| v.arrival_time >= t)
            && self.start_departure.map_or(true, |t| v.departure_time >= t)
            && self.end_arrival.map_or(true, |t| v.arrival_time <= t)
            && self.end_departure.map_or(true, |t| v.departure_time <= t)
    }

    fn admits_position(&self, v: &VisitRecord) -> bool {
        self.lat_min.map_or(true, |m| v.lat >= m)
            && self.lat_max.map_or(true, |m| v.lat <= m)
            && self.lng_min.map_or(true, |m| v.lng >= m)
            && self.lng_max.map_or(true, |m| v.lng <= m)
    }
}

/// Slices `[start, end)` out of `items`, clamping out-of-range bounds.
///
/// `end <= 0` or past the end means "to the end"; a start past the end gives
/// an empty page; a negative start means 0.
pub fn paginate<T>(mut items: Vec<T>, start: i64, end: i64) -> Vec<T> {
    let len = items.len();
    let end = if end <= 0 || end as u64 > len as u64 { len } else { end as usize };
    let start = start.clamp(0, len as i64) as usize;
    if start >= end {
        return Vec::new();
    }
    items.truncate(end);
    items.drain(..start);
    items
}

impl TrackDb {
    /// Answers a visit query: scan, filter, sort by arrival, paginate.
    ///
    /// With both bounding-box corners the coordinate keyspace is range-scanned;
    /// otherwise the time keyspace is walked, seeking to the reported-time
    /// start when one is given.
    pub fn query_visits(&self, filter: &VisitFilter) -> Result<VisitsResponse> {
        let index = self.index();
        let scan = match filter.bounding_box()? {
            Some((sw, ne)) => index.scan_bounded(sw, ne, filter.start_reported, filter.end_reported)?,
            None => index.scan_time(filter.start_reported, filter.end_reported)?,
        };

        let mut visits = Vec::new();
        for mut visit in scan.visits {
            if !filter.uuids.is_empty() && !filter.uuids.contains(&visit.uuid) {
                continue;
            }
            if !filter.names.is_empty() || visit.name.is_none() {
                match self.resolve_name(&visit)? {
                    Some(name) => visit.name = Some(name),
                    None => continue,
                }
            }
            if !filter.names.is_empty() {
                let name = visit.name.as_deref().unwrap_or_default();
                if !filter.names.iter().any(|n| n == name) {
                    continue;
                }
            }
            if !filter.admits_times(&visit) || !filter.admits_position(&visit) {
                continue;
            }
            visits.push(visit);
        }
        let matches = visits.len();

        if filter.reverse_chrono {
            visits.sort_by(|a, b| a.arrival_time.cmp(&b.arrival_time));
        } else {
            visits.sort_by(|a, b| b.arrival_time.cmp(&a.arrival_time));
        }
        let visits = paginate(visits, filter.start_index, filter.end_index);

        debug!(scanned = scan.scanned, matches, returned = visits.len(), "visit query");
        Ok(VisitsResponse { visits, scanned: scan.scanned, matches })
    }

    /// Entity name from the track record the visit was reported with.
    fn resolve_name(&self, visit: &VisitRecord) -> Result<Option<String>> {
        match self.store.get(Keyspace::Tracks, visit.track_key.as_bytes())? {
            Some(bytes) => match serde_json::from_slice::<crate::model::TrackFeature>(&bytes) {
                Ok(track) => Ok(Some(track.name)),
                Err(e) => {
                    warn!(key = %visit.track_key, error = %e, "unreadable track for visit");
                    Ok(None)
                }
            },
            None => {
                warn!(key = %visit.track_key, "no track stored for visit");
                Ok(None)
            }
        }
    }
}
