use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::parser;

// Required property names, as the tracking clients send them.
pub const PROP_NAME: &str = "Name";
pub const PROP_UUID: &str = "UUID";
pub const PROP_TIME: &str = "Time";
pub const PROP_ACCURACY: &str = "Accuracy";
pub const PROP_VISIT: &str = "Visit";

pub const OP_PUT: u8 = 1;
pub const OP_DELETE: u8 = 0;

/// One framed entry of the append-only segment.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct LogEntry {
    pub keyspace: u8,
    /// `OP_PUT` or `OP_DELETE`.
    pub op: u8,
    pub key: Vec<u8>,
    /// Empty for deletes.
    pub value: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Feature,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    FeatureCollection,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub coordinates: Value,
}

impl Geometry {
    pub fn point(lng: f64, lat: f64) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: Value::from(vec![lng, lat]),
        }
    }
}

/// A GeoJSON feature as decoded from the wire, before any validation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawFeature {
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl RawFeature {
    pub fn point(lng: f64, lat: f64, properties: Map<String, Value>) -> Self {
        Self {
            kind: FeatureKind::Feature,
            id: None,
            geometry: Some(Geometry::point(lng, lat)),
            properties: Some(properties),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.as_ref()?.get(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    pub features: Vec<RawFeature>,
}

/// An admitted point-feature.
///
/// Required fields are typed; everything else the client sent rides along in
/// `properties`. Converting from a [`RawFeature`] performs validation, see
/// [`crate::validate`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(into = "RawFeature", try_from = "RawFeature")]
pub struct TrackFeature {
    pub lng: f64,
    pub lat: f64,
    pub name: String,
    pub uuid: String,
    pub time: DateTime<Utc>,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    pub properties: Map<String, Value>,
}

impl TrackFeature {
    pub fn unix_seconds(&self) -> i64 {
        self.time.timestamp()
    }

    /// Nanoseconds since the epoch, clamped to zero for pre-epoch times.
    pub fn time_nanos(&self) -> u64 {
        time_nanos(&self.time)
    }

    /// Time-ordered primary key: `name+uuid+unixSeconds`.
    pub fn primary_key(&self) -> String {
        format!("{}+{}+{}", self.name, self.uuid, self.unix_seconds())
    }
}

impl From<TrackFeature> for RawFeature {
    fn from(f: TrackFeature) -> Self {
        let mut properties = f.properties;
        properties.insert(PROP_NAME.to_string(), Value::String(f.name));
        properties.insert(PROP_UUID.to_string(), Value::String(f.uuid));
        properties.insert(PROP_TIME.to_string(), Value::String(format_time(&f.time)));
        properties.insert(PROP_ACCURACY.to_string(), Value::from(f.accuracy));
        RawFeature::point(f.lng, f.lat, properties)
    }
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn time_nanos(t: &DateTime<Utc>) -> u64 {
    t.timestamp_nanos_opt().unwrap_or(0).max(0) as u64
}

/// A dwell event of a tracked entity, stored in the visit and geo keyspaces.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VisitRecord {
    pub uuid: String,
    /// Device-reported visits carry no name; it is resolved through `track_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub reported_time: DateTime<Utc>,
    pub arrival_time: DateTime<Utc>,
    pub departure_time: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<String>,
    /// Primary key of the track record this visit was reported with.
    pub track_key: String,
}

/// Visit payload as the iOS client reports it inside its notes.
#[derive(Deserialize, Debug, Default)]
struct DeviceVisit {
    #[serde(rename = "validVisit", default)]
    valid: bool,
    #[serde(rename = "arrivalDate", default)]
    arrival: Option<DateTime<Utc>>,
    #[serde(rename = "departureDate", default)]
    departure: Option<DateTime<Utc>>,
    #[serde(default)]
    place: Option<String>,
}

impl DeviceVisit {
    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::String(s) => serde_json::from_str(s).ok(),
            Value::Object(_) => serde_json::from_value(v.clone()).ok(),
            _ => None,
        }
    }
}

impl VisitRecord {
    /// Derives the visit for a stored feature.
    ///
    /// A valid device visit yields its arrival, departure and place. Any other
    /// point is a zero-dwell visit at its own position and time.
    pub fn from_feature(feature: &TrackFeature) -> Self {
        let track_key = feature.primary_key();
        let device = feature
            .properties
            .get(PROP_VISIT)
            .and_then(DeviceVisit::from_value)
            .filter(|v| v.valid);

        if let Some(DeviceVisit { arrival: Some(arrival), departure, place, .. }) = device {
            let (lat, lng) = place
                .as_deref()
                .and_then(|p| parser::parse_place_coordinates(p).ok())
                .unwrap_or((feature.lat, feature.lng));
            return Self {
                uuid: feature.uuid.clone(),
                name: None,
                reported_time: feature.time,
                arrival_time: arrival,
                departure_time: departure.unwrap_or(arrival),
                lat,
                lng,
                place,
                track_key,
            };
        }

        Self {
            uuid: feature.uuid.clone(),
            name: Some(feature.name.clone()),
            reported_time: feature.time,
            arrival_time: feature.time,
            departure_time: feature.time,
            lat: feature.lat,
            lng: feature.lng,
            place: None,
            track_key,
        }
    }
}

/// Most recent stored feature per tracked entity name.
pub type LastKnown = BTreeMap<String, TrackFeature>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    pub key_count: usize,
    pub last_updated_at: DateTime<Utc>,
    pub last_updated_by: String,
    pub last_updated_points: usize,
}
